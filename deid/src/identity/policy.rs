use std::collections::HashSet;

use deid_config::shared::TablePolicyConfig;

use crate::error::{DeidResult, ErrorKind};
use crate::identity::{IdentifierType, IdentifierValue};
use crate::{bail, deid_error};
use crate::types::TableLayout;

/// A column holding identifier values of one or more types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierColumn {
    pub column: String,
    /// Listing several types makes the column multiplexed: a value belongs to the first type
    /// whose format it matches.
    pub types: Vec<IdentifierType>,
}

/// Which columns of a table carry identifiers and which carry other identifying data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableIdentityPolicy {
    pub table: String,
    pub identifier_columns: Vec<IdentifierColumn>,
    /// Removed from scrubbed output without replacement.
    pub pii_columns: Vec<String>,
}

impl TableIdentityPolicy {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            identifier_columns: Vec::new(),
            pii_columns: Vec::new(),
        }
    }

    pub fn with_identifier_column(
        mut self,
        column: impl Into<String>,
        types: impl IntoIterator<Item = IdentifierType>,
    ) -> Self {
        self.identifier_columns.push(IdentifierColumn {
            column: column.into(),
            types: types.into_iter().collect(),
        });
        self
    }

    pub fn with_pii_column(mut self, column: impl Into<String>) -> Self {
        self.pii_columns.push(column.into());
        self
    }

    /// Builds a policy from configuration, parsing identifier type names.
    pub fn from_config(config: &TablePolicyConfig) -> DeidResult<Self> {
        let mut policy = Self::new(&config.table);
        for column in &config.identifier_columns {
            let types = column
                .types
                .iter()
                .map(|name| IdentifierType::from_field_name(name))
                .collect::<DeidResult<Vec<_>>>()?;
            policy = policy.with_identifier_column(&column.column, types);
        }
        for column in &config.pii_columns {
            policy = policy.with_pii_column(column);
        }

        Ok(policy)
    }

    /// Name of the column that replaces an identifier column able to carry the main identifier.
    pub fn pseudonym_column_name(column: &str) -> String {
        format!("{column}_{}", IdentifierType::PSEUDONYM.field_name())
    }

    /// Locates every policy column in `layout`.
    ///
    /// Fails with [`ErrorKind::ConfigError`] when the layout belongs to another table, a column
    /// is missing or listed twice, a column has no types, or the pseudonym type is listed as a
    /// raw identifier.
    pub(crate) fn bind(&self, layout: &TableLayout) -> DeidResult<BoundPolicy> {
        if layout.name != self.table {
            bail!(
                ErrorKind::ConfigError,
                "Table policy does not match the table layout",
                format!("policy for `{}`, layout of `{}`", self.table, layout.name)
            );
        }

        let mut seen = HashSet::new();
        let mut identifier_columns = Vec::with_capacity(self.identifier_columns.len());
        for column in &self.identifier_columns {
            if column.types.is_empty() {
                bail!(
                    ErrorKind::ConfigError,
                    "Identifier column lists no identifier types",
                    format!("table `{}` column `{}`", self.table, column.column)
                );
            }
            if column.types.iter().any(IdentifierType::is_pseudonym) {
                bail!(
                    ErrorKind::ConfigError,
                    "The pseudonym cannot be a raw identifier",
                    format!("table `{}` column `{}`", self.table, column.column)
                );
            }

            let index = self.locate(layout, &column.column, &mut seen)?;
            identifier_columns.push(BoundColumn {
                index,
                name: column.column.clone(),
                types: column.types.clone(),
            });
        }

        let mut pii_columns = Vec::with_capacity(self.pii_columns.len());
        for column in &self.pii_columns {
            pii_columns.push(self.locate(layout, column, &mut seen)?);
        }

        Ok(BoundPolicy {
            identifier_columns,
            pii_columns,
        })
    }

    fn locate(
        &self,
        layout: &TableLayout,
        column: &str,
        seen: &mut HashSet<usize>,
    ) -> DeidResult<usize> {
        let Some(index) = layout.column_index(column) else {
            bail!(
                ErrorKind::ConfigError,
                "Policy column is missing from the table",
                format!("table `{}` column `{column}`", self.table)
            );
        };
        if !seen.insert(index) {
            bail!(
                ErrorKind::ConfigError,
                "Column is listed twice in the table policy",
                format!("table `{}` column `{column}`", self.table)
            );
        }

        Ok(index)
    }
}

/// A policy resolved against a concrete layout.
#[derive(Debug, Clone)]
pub(crate) struct BoundPolicy {
    pub identifier_columns: Vec<BoundColumn>,
    pub pii_columns: Vec<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct BoundColumn {
    pub index: usize,
    pub name: String,
    pub types: Vec<IdentifierType>,
}

impl BoundColumn {
    pub fn may_carry(&self, ty: IdentifierType) -> bool {
        self.types.contains(&ty)
    }

    /// Types the text `value` of this column, or `None` if it is no identifier.
    ///
    /// A single-typed column requires every value to have that type's kind and format and fails
    /// with [`ErrorKind::InvalidIdentifier`] otherwise. A multiplexed column types each value by
    /// the first listed type whose format matches.
    pub fn classify(
        &self,
        table: &str,
        value: &str,
    ) -> DeidResult<Option<(IdentifierType, IdentifierValue)>> {
        if let [ty] = self.types.as_slice() {
            let value = ty.to_value(value).map_err(|err| {
                deid_error!(
                    ErrorKind::InvalidIdentifier,
                    "Identifier column holds a malformed value",
                    format!("table `{table}` column `{}`", self.name)
                )
                .with_source(err)
            })?;
            if !ty.accepts(&value) {
                bail!(
                    ErrorKind::InvalidIdentifier,
                    "Identifier column holds a malformed value",
                    format!(
                        "table `{table}` column `{}` holds a value not formatted as `{ty}`",
                        self.name
                    )
                );
            }

            return Ok(Some((*ty, value)));
        }

        Ok(self
            .types
            .iter()
            .find_map(|ty| ty.recognize(value).map(|value| (*ty, value))))
    }
}
