//! Lease based mutual exclusion over a store offering conditional writes.
//!
//! A lease is a named record `{owner, expires_at, version}`. It is valid for an owner while the
//! owner matches and the current time is before `expires_at`. Every successful write bumps the
//! version by one, which makes writes conditional on the version read just before. Leases are
//! never deleted: releasing one moves its expiry to the release time.

use std::time::Duration;

use chrono::{DateTime, Utc};

mod backoff;
mod clock;
mod manager;
mod renewal;
pub mod store;

pub use backoff::acquire_with_backoff;
pub use clock::{Clock, SystemClock};
pub use manager::{AcquireOutcome, LeaseManager, LostReason, RenewOutcome};
pub use renewal::{LeaseRenewalLoop, LeaseState, LeaseStatus};

/// A lease as stored, possibly free or held by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub name: String,
    pub owner: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl LeaseRecord {
    /// Returns `true` if `owner` holds this lease at `now`.
    pub fn is_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner.as_deref() == Some(owner) && now < self.expires_at
    }

    /// Returns `true` if `owner` may write a claim over this record at `now`.
    ///
    /// That is the case when the lease has no owner, has expired, or already belongs to `owner`.
    pub fn is_claimable_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match self.owner.as_deref() {
            None => true,
            Some(current) => current == owner || now >= self.expires_at,
        }
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A lease confirmed as held by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub owner: String,
    /// Expiry as read back from the store.
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl Lease {
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Name, owner and time to live of a lease someone wants to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub name: String,
    pub owner: String,
    pub ttl: Duration,
}

impl LeaseRequest {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            ttl,
        }
    }
}
