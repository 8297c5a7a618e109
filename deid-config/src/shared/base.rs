use thiserror::Error;

/// Errors raised by `validate()` on configuration sections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    #[error("table `{0}` is configured more than once")]
    DuplicateTable(String),
    #[error("column `{column}` of table `{table}` is configured more than once")]
    DuplicateColumn { table: String, column: String },
    #[error("identifier column `{column}` of table `{table}` lists no identifier types")]
    EmptyIdentifierTypes { table: String, column: String },
}

impl ValidationError {
    pub(crate) fn invalid(field: &str, constraint: &str) -> Self {
        ValidationError::InvalidFieldValue {
            field: field.to_string(),
            constraint: constraint.to_string(),
        }
    }
}
