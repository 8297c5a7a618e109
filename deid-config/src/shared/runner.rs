use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{
    IdentityConfig, LeaseConfig, LeaseStoreConfig, LeaseStoreConfigWithoutSecrets, SnapshotConfig,
    ValidationError,
};

/// Complete configuration of one identity phase run.
#[derive(Clone, Debug, Deserialize)]
pub struct RunnerConfig {
    pub lease: LeaseConfig,
    pub lease_store: LeaseStoreConfig,
    pub identity: IdentityConfig,
    pub snapshot: SnapshotConfig,
    pub io: IoConfig,
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.lease.validate()?;
        self.lease_store.validate()?;
        self.identity.validate()?;
        self.snapshot.validate()?;
        self.io.validate()
    }
}

impl Config for RunnerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

/// Where raw shards are read from and scrubbed shards are written to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IoConfig {
    /// Directory with one sub-directory of raw shard files per table.
    pub input_dir: PathBuf,
    /// Directory receiving one sub-directory of scrubbed shard files per table.
    pub output_dir: PathBuf,
}

impl IoConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.input_dir == self.output_dir {
            return Err(ValidationError::invalid(
                "io.output_dir",
                "must differ from io.input_dir",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfigWithoutSecrets {
    pub lease: LeaseConfig,
    pub lease_store: LeaseStoreConfigWithoutSecrets,
    pub identity: IdentityConfig,
    pub snapshot: SnapshotConfig,
    pub io: IoConfig,
}

impl From<RunnerConfig> for RunnerConfigWithoutSecrets {
    fn from(value: RunnerConfig) -> Self {
        RunnerConfigWithoutSecrets {
            lease: value.lease,
            lease_store: value.lease_store.into(),
            identity: value.identity,
            snapshot: value.snapshot,
            io: value.io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNER_JSON: &str = r#"{
        "lease": {"name": "identity"},
        "lease_store": {
            "type": "postgres",
            "connection": {
                "host": "localhost",
                "port": 5432,
                "name": "deid",
                "username": "deid",
                "password": "hunter2",
                "tls": {"enabled": false}
            }
        },
        "identity": {"main_identifier": "huid", "unresolved_policy": "drop"},
        "snapshot": {"directory": "/data/identity"},
        "io": {"input_dir": "/data/raw", "output_dir": "/data/clean"}
    }"#;

    #[test]
    fn full_config_validates() {
        let config: RunnerConfig = serde_json::from_str(RUNNER_JSON).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.snapshot.read_retry.max_attempts, 3);
    }

    #[test]
    fn secrets_are_stripped() {
        let config: RunnerConfig = serde_json::from_str(RUNNER_JSON).unwrap();
        let without_secrets = RunnerConfigWithoutSecrets::from(config);
        let rendered = serde_json::to_string(&without_secrets).unwrap();

        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("\"type\":\"postgres\""));
    }

    #[test]
    fn input_and_output_must_differ() {
        let mut config: RunnerConfig = serde_json::from_str(RUNNER_JSON).unwrap();
        config.io.output_dir = config.io.input_dir.clone();
        assert!(config.validate().is_err());
    }
}
