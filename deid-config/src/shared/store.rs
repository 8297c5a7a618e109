use serde::{Deserialize, Serialize};

use crate::shared::{PgConnectionConfig, PgConnectionConfigWithoutSecrets, ValidationError};

/// Backend holding lease records.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaseStoreConfig {
    /// Process local store. Only excludes runs inside the same process.
    Memory,
    Postgres { connection: PgConnectionConfig },
}

impl LeaseStoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            LeaseStoreConfig::Memory => Ok(()),
            LeaseStoreConfig::Postgres { connection } => connection.validate(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaseStoreConfigWithoutSecrets {
    Memory,
    Postgres {
        connection: PgConnectionConfigWithoutSecrets,
    },
}

impl From<LeaseStoreConfig> for LeaseStoreConfigWithoutSecrets {
    fn from(value: LeaseStoreConfig) -> Self {
        match value {
            LeaseStoreConfig::Memory => LeaseStoreConfigWithoutSecrets::Memory,
            LeaseStoreConfig::Postgres { connection } => LeaseStoreConfigWithoutSecrets::Postgres {
                connection: connection.into(),
            },
        }
    }
}
