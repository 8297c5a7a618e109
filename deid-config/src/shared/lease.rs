//! Lease configuration for the identity phase mutual exclusion.

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration of the lease guarding the identity phase.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LeaseConfig {
    /// Name of the lease record, shared by every run that must be mutually exclusive.
    pub name: String,

    /// Owner identifier written into the lease.
    ///
    /// When absent the runner generates a unique owner per process.
    #[serde(default)]
    pub owner: Option<String>,

    /// Time to live of the lease in seconds. The renewal loop renews every `ttl_secs / 2`.
    ///
    /// Default: 300
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default)]
    pub acquire: LeaseAcquireConfig,
}

impl LeaseConfig {
    pub const DEFAULT_TTL_SECS: u64 = 300;

    /// Renewal needs at least one whole second between attempts.
    pub const MIN_TTL_SECS: u64 = 2;

    /// A crashed runner blocks others for at most a day.
    pub const MAX_TTL_SECS: u64 = 86_400;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::invalid("lease.name", "must not be empty"));
        }

        if matches!(&self.owner, Some(owner) if owner.trim().is_empty()) {
            return Err(ValidationError::invalid(
                "lease.owner",
                "must not be empty when set",
            ));
        }

        if self.ttl_secs < Self::MIN_TTL_SECS {
            return Err(ValidationError::invalid(
                "lease.ttl_secs",
                "must be at least 2",
            ));
        }

        if self.ttl_secs > Self::MAX_TTL_SECS {
            return Err(ValidationError::invalid(
                "lease.ttl_secs",
                "must be at most 86400",
            ));
        }

        self.acquire.validate()
    }
}

/// Bounds of the blocking acquire loop.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LeaseAcquireConfig {
    /// Attempts before giving up with an exhausted error.
    ///
    /// Default: 60
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound of a single wait between attempts, in milliseconds.
    ///
    /// Default: 60000
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Initial backoff after a lease store failure, in milliseconds. Doubles per failure.
    ///
    /// Default: 1000
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Jitter applied to every wait, as a percentage (0-100).
    ///
    /// Default: 25
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: u8,
}

impl LeaseAcquireConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;
    pub const DEFAULT_MAX_WAIT_MS: u64 = 60_000;
    pub const DEFAULT_MIN_BACKOFF_MS: u64 = 1_000;
    pub const DEFAULT_JITTER_PERCENT: u8 = 25;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::invalid(
                "lease.acquire.max_attempts",
                "must be greater than zero",
            ));
        }

        if self.jitter_percent > 100 {
            return Err(ValidationError::invalid(
                "lease.acquire.jitter_percent",
                "must be <= 100",
            ));
        }

        if self.min_backoff_ms > self.max_wait_ms {
            return Err(ValidationError::invalid(
                "lease.acquire.min_backoff_ms",
                "must be <= max_wait_ms",
            ));
        }

        Ok(())
    }
}

impl Default for LeaseAcquireConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            max_wait_ms: Self::DEFAULT_MAX_WAIT_MS,
            min_backoff_ms: Self::DEFAULT_MIN_BACKOFF_MS,
            jitter_percent: Self::DEFAULT_JITTER_PERCENT,
        }
    }
}

fn default_ttl_secs() -> u64 {
    LeaseConfig::DEFAULT_TTL_SECS
}

fn default_max_attempts() -> u32 {
    LeaseAcquireConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_max_wait_ms() -> u64 {
    LeaseAcquireConfig::DEFAULT_MAX_WAIT_MS
}

fn default_min_backoff_ms() -> u64 {
    LeaseAcquireConfig::DEFAULT_MIN_BACKOFF_MS
}

fn default_jitter_percent() -> u8 {
    LeaseAcquireConfig::DEFAULT_JITTER_PERCENT
}
