use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::{DeidResult, ErrorKind};
#[cfg(feature = "failpoints")]
use crate::failpoints::{LEASE_ACQUIRE__AFTER_WRITE, LEASE_RENEW__BEFORE_WRITE, deid_fail_point};
use crate::lease::store::{CreateOutcome, LeaseStore, UpdateOutcome};
use crate::lease::{Clock, Lease, LeaseRecord, SystemClock};
use crate::metrics::{
    DEID_LEASE_ACQUIRE_ATTEMPTS_TOTAL, DEID_LEASE_RENEWALS_TOTAL, LEASE_LABEL, OUTCOME_LABEL,
};
use crate::{bail, deid_error};

/// Result of a single, non-blocking acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(Lease),
    /// Someone else holds the lease, or won the race for it.
    NotAcquired {
        holder: Option<String>,
        remaining: Duration,
    },
}

/// Result of a renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed(Lease),
    Lost(LostReason),
}

/// Why a renewal found the lease no longer held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostReason {
    /// No lease record exists.
    Absent,
    /// The record names another owner.
    OwnedByOther,
    /// The lease expired before it was renewed.
    Expired,
    /// Another write landed on the record concurrently with ours.
    Superseded,
}

impl LostReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LostReason::Absent => "absent",
            LostReason::OwnedByOther => "owned_by_other",
            LostReason::Expired => "expired",
            LostReason::Superseded => "superseded",
        }
    }
}

/// Acquires, renews and releases leases in a [`LeaseStore`].
///
/// Every operation is a short sequence of reads and conditional writes with no blocking of its
/// own; waiting for a held lease is left to [`crate::lease::acquire_with_backoff`].
#[derive(Debug, Clone)]
pub struct LeaseManager<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S> LeaseManager<S>
where
    S: LeaseStore,
{
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Attempts to take or extend the lease `name` for `owner` for `ttl`.
    ///
    /// 1. Read the current record.
    /// 2. If there is none, create it with version 1. If it is free, expired or already ours,
    ///    overwrite it conditionally on the version just read. Otherwise report who holds it.
    /// 3. Read the record again and confirm that `owner` holds it. The returned expiry is the
    ///    one read back from the store.
    ///
    /// Losing a race at step 2 is not an error: the confirming read reports the winner.
    pub async fn acquire(&self, name: &str, owner: &str, ttl: Duration) -> DeidResult<AcquireOutcome> {
        let ttl = to_time_delta(ttl)?;
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;
        let claim = |version| LeaseRecord {
            name: name.to_string(),
            owner: Some(owner.to_string()),
            expires_at,
            version,
        };

        let written = match self.store.get(name).await? {
            None => {
                let outcome = self.store.put_if_absent(claim(1)).await?;
                outcome == CreateOutcome::Created
            }
            Some(current) if current.is_claimable_by(owner, now) => {
                let outcome = self
                    .store
                    .put_if_version(claim(current.version + 1), current.version)
                    .await?;
                outcome == UpdateOutcome::Updated
            }
            Some(current) => {
                debug!(
                    lease = name,
                    holder = current.owner.as_deref().unwrap_or_default(),
                    "lease held by another owner"
                );
                count_acquire(name, "held");

                return Ok(AcquireOutcome::NotAcquired {
                    remaining: current.remaining(now),
                    holder: current.owner,
                });
            }
        };

        if !written {
            debug!(lease = name, "lost the race for the lease");
        }

        #[cfg(feature = "failpoints")]
        deid_fail_point(LEASE_ACQUIRE__AFTER_WRITE)?;

        let Some(confirmed) = self.store.get(name).await? else {
            bail!(
                ErrorKind::InvalidState,
                "Lease record vanished after a write",
                format!("lease `{name}`")
            );
        };

        let now = self.clock.now();
        if !confirmed.is_held_by(owner, now) {
            count_acquire(name, "raced");

            return Ok(AcquireOutcome::NotAcquired {
                remaining: confirmed.remaining(now),
                holder: confirmed.owner,
            });
        }

        info!(
            lease = name,
            owner,
            version = confirmed.version,
            expires_at = %confirmed.expires_at,
            "lease acquired"
        );
        count_acquire(name, "acquired");

        Ok(AcquireOutcome::Acquired(Lease {
            name: confirmed.name,
            owner: owner.to_string(),
            expires_at: confirmed.expires_at,
            version: confirmed.version,
        }))
    }

    /// Extends a lease `owner` currently holds. Never creates a lease.
    ///
    /// The renewal only counts if the record read back carries exactly the version written;
    /// anything else means another writer interfered.
    pub async fn renew(&self, name: &str, owner: &str, ttl: Duration) -> DeidResult<RenewOutcome> {
        let ttl = to_time_delta(ttl)?;
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;

        let Some(current) = self.store.get(name).await? else {
            return Ok(self.lost(name, LostReason::Absent));
        };
        if current.owner.as_deref() != Some(owner) {
            return Ok(self.lost(name, LostReason::OwnedByOther));
        }
        if now >= current.expires_at {
            return Ok(self.lost(name, LostReason::Expired));
        }

        #[cfg(feature = "failpoints")]
        deid_fail_point(LEASE_RENEW__BEFORE_WRITE)?;

        let expected_version = current.version + 1;
        let renewal = LeaseRecord {
            name: name.to_string(),
            owner: Some(owner.to_string()),
            expires_at,
            version: expected_version,
        };

        if self.store.put_if_version(renewal, current.version).await? == UpdateOutcome::VersionMismatch {
            return Ok(self.lost(name, LostReason::Superseded));
        }

        match self.store.get(name).await? {
            None => Ok(self.lost(name, LostReason::Absent)),
            Some(confirmed)
                if confirmed.owner.as_deref() == Some(owner)
                    && confirmed.version == expected_version =>
            {
                debug!(lease = name, version = confirmed.version, "lease renewed");
                counter!(
                    DEID_LEASE_RENEWALS_TOTAL,
                    LEASE_LABEL => name.to_string(),
                    OUTCOME_LABEL => "renewed"
                )
                .increment(1);

                Ok(RenewOutcome::Renewed(Lease {
                    name: confirmed.name,
                    owner: owner.to_string(),
                    expires_at: confirmed.expires_at,
                    version: confirmed.version,
                }))
            }
            Some(_) => Ok(self.lost(name, LostReason::Superseded)),
        }
    }

    /// Gives up a lease `owner` holds by moving its expiry to now.
    ///
    /// Best effort: a lease that is gone, expired, held by someone else, or changed under us is
    /// left alone without error. The owner is kept on the record.
    pub async fn release(&self, name: &str, owner: &str) -> DeidResult<()> {
        let now = self.clock.now();

        let Some(current) = self.store.get(name).await? else {
            debug!(lease = name, "no lease to release");
            return Ok(());
        };
        if !current.is_held_by(owner, now) {
            debug!(lease = name, owner, "lease not held, nothing to release");
            return Ok(());
        }

        let released = LeaseRecord {
            expires_at: now,
            version: current.version + 1,
            ..current.clone()
        };

        match self.store.put_if_version(released, current.version).await? {
            UpdateOutcome::Updated => info!(lease = name, owner, "lease released"),
            UpdateOutcome::VersionMismatch => {
                debug!(lease = name, owner, "lease changed concurrently, release skipped")
            }
        }

        Ok(())
    }

    /// Time left on the lease `name` whoever holds it. Zero when absent or expired.
    pub async fn remaining(&self, name: &str) -> DeidResult<Duration> {
        let record = self.store.get(name).await?;

        Ok(record
            .map(|record| record.remaining(self.clock.now()))
            .unwrap_or(Duration::ZERO))
    }

    fn lost(&self, name: &str, reason: LostReason) -> RenewOutcome {
        warn!(lease = name, reason = reason.as_str(), "lease lost");
        counter!(
            DEID_LEASE_RENEWALS_TOTAL,
            LEASE_LABEL => name.to_string(),
            OUTCOME_LABEL => "lost"
        )
        .increment(1);

        RenewOutcome::Lost(reason)
    }
}

fn count_acquire(name: &str, outcome: &'static str) {
    counter!(
        DEID_LEASE_ACQUIRE_ATTEMPTS_TOTAL,
        LEASE_LABEL => name.to_string(),
        OUTCOME_LABEL => outcome
    )
    .increment(1);
}

fn to_time_delta(ttl: Duration) -> DeidResult<TimeDelta> {
    if ttl.is_zero() {
        bail!(ErrorKind::ConfigError, "Lease time to live must be positive");
    }

    TimeDelta::from_std(ttl).map_err(|err| {
        deid_error!(
            ErrorKind::ConfigError,
            "Lease time to live is out of range",
            source: err
        )
    })
}

fn expiry_after(now: DateTime<Utc>, ttl: TimeDelta) -> DeidResult<DateTime<Utc>> {
    let Some(expires_at) = now.checked_add_signed(ttl) else {
        bail!(
            ErrorKind::ConfigError,
            "Lease time to live is out of range",
            format!("{}s from {now} is not a representable expiry", ttl.num_seconds())
        );
    };

    Ok(expires_at)
}
