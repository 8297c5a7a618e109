use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// How conflicting values of one identifier type are merged during resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicyConfig {
    /// The first value encountered wins.
    #[default]
    FirstSeen,
    /// The smallest value wins, independent of input order.
    LeastValue,
}

/// What the scrubbing stage does with a record whose main identifier is not in the snapshot.
///
/// Deliberately has no default: deployments must choose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicyConfig {
    Fail,
    Drop,
    PassThrough,
}

/// Identity resolution and scrubbing settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IdentityConfig {
    /// Field name of the deployment's main identifier type, for example `huid`.
    pub main_identifier: String,
    #[serde(default)]
    pub merge_policy: MergePolicyConfig,
    pub unresolved_policy: UnresolvedPolicyConfig,
    #[serde(default)]
    pub tables: Vec<TablePolicyConfig>,
}

impl IdentityConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.main_identifier.trim().is_empty() {
            return Err(ValidationError::invalid(
                "identity.main_identifier",
                "must not be empty",
            ));
        }

        let mut tables = HashSet::new();
        for table in &self.tables {
            if !tables.insert(table.table.as_str()) {
                return Err(ValidationError::DuplicateTable(table.table.clone()));
            }
            table.validate()?;
        }

        Ok(())
    }
}

/// Which columns of a table carry identifiers or other identifying data.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TablePolicyConfig {
    pub table: String,
    #[serde(default)]
    pub identifier_columns: Vec<IdentifierColumnConfig>,
    /// Identifying columns that are not identifiers (names, e-mail addresses, free text).
    /// They are removed from scrubbed output.
    #[serde(default)]
    pub pii_columns: Vec<String>,
}

impl TablePolicyConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.table.trim().is_empty() {
            return Err(ValidationError::invalid(
                "identity.tables.table",
                "must not be empty",
            ));
        }

        let mut columns = HashSet::new();
        let all_columns = self
            .identifier_columns
            .iter()
            .map(|column| column.column.as_str())
            .chain(self.pii_columns.iter().map(String::as_str));

        for column in all_columns {
            if !columns.insert(column) {
                return Err(ValidationError::DuplicateColumn {
                    table: self.table.clone(),
                    column: column.to_string(),
                });
            }
        }

        for column in &self.identifier_columns {
            if column.types.is_empty() {
                return Err(ValidationError::EmptyIdentifierTypes {
                    table: self.table.clone(),
                    column: column.column.clone(),
                });
            }
        }

        Ok(())
    }
}

/// A column holding identifier values.
///
/// Listing more than one type marks the column as multiplexed: each value belongs to the first
/// listed type whose format it matches.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IdentifierColumnConfig {
    pub column: String,
    pub types: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_config() -> IdentityConfig {
        serde_json::from_str(
            r#"{
                "main_identifier": "huid",
                "unresolved_policy": "fail",
                "tables": [
                    {
                        "table": "enrollments",
                        "identifier_columns": [
                            {"column": "user_id", "types": ["huid", "xid"]},
                            {"column": "canvas_user", "types": ["source_id"]}
                        ],
                        "pii_columns": ["email"]
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_table_policies() {
        let config = identity_config();
        assert_eq!(config.merge_policy, MergePolicyConfig::FirstSeen);
        assert_eq!(config.unresolved_policy, UnresolvedPolicyConfig::Fail);
        assert!(config.validate().is_ok());

        let table = &config.tables[0];
        assert_eq!(table.table, "enrollments");
        assert_eq!(table.identifier_columns[0].types, vec!["huid", "xid"]);
        assert_eq!(table.pii_columns, vec!["email"]);
    }

    #[test]
    fn unresolved_policy_is_required() {
        let result = serde_json::from_str::<IdentityConfig>(r#"{"main_identifier": "huid"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let mut config = identity_config();
        config.tables[0].pii_columns.push("user_id".to_string());

        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateColumn {
                table: "enrollments".to_string(),
                column: "user_id".to_string(),
            })
        );
    }

    #[test]
    fn duplicate_tables_are_rejected() {
        let mut config = identity_config();
        let table = config.tables[0].clone();
        config.tables.push(table);

        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateTable("enrollments".to_string()))
        );
    }

    #[test]
    fn identifier_columns_need_types() {
        let mut config = identity_config();
        config.tables[0].identifier_columns[1].types.clear();

        assert!(matches!(
            config.validate(),
            Err(ValidationError::EmptyIdentifierTypes { .. })
        ));
    }
}
