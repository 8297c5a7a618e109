use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Location of published identity snapshot generations.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SnapshotConfig {
    /// Directory containing one sub-directory per snapshot generation.
    pub directory: PathBuf,
    #[serde(default)]
    pub read_retry: RetryConfig,
}

impl SnapshotConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.directory.as_os_str().is_empty() {
            return Err(ValidationError::invalid(
                "snapshot.directory",
                "must not be empty",
            ));
        }

        self.read_retry.validate()
    }
}

/// Bounded retry of transient read failures.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    ///
    /// Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds, doubled for each further retry.
    ///
    /// Default: 200
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_INITIAL_DELAY_MS: u64 = 200;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::invalid(
                "snapshot.read_retry.max_attempts",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: Self::DEFAULT_INITIAL_DELAY_MS,
        }
    }
}

fn default_max_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_delay_ms() -> u64 {
    RetryConfig::DEFAULT_INITIAL_DELAY_MS
}
