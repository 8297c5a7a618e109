use std::time::Duration;

use deid_config::shared::LeaseAcquireConfig;
use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::deid_error;
use crate::error::{DeidError, DeidResult, ErrorKind};
use crate::lease::manager::{AcquireOutcome, LeaseManager};
use crate::lease::store::LeaseStore;
use crate::lease::{Lease, LeaseRequest};

/// Acquires a lease, waiting for the current holder when it is taken.
///
/// While the lease is held elsewhere, waits the holder's remaining time capped at
/// `max_wait_ms`. Lease store failures back off exponentially from `min_backoff_ms`. Every wait
/// is jittered. Fails with [`ErrorKind::LeaseAcquireExhausted`] after `max_attempts` attempts
/// and immediately on non-transient errors.
pub async fn acquire_with_backoff<S>(
    manager: &LeaseManager<S>,
    request: &LeaseRequest,
    config: &LeaseAcquireConfig,
) -> DeidResult<Lease>
where
    S: LeaseStore,
{
    let max_wait = Duration::from_millis(config.max_wait_ms);
    let min_backoff = Duration::from_millis(config.min_backoff_ms);
    let mut store_backoff = min_backoff;
    let mut last_error: Option<DeidError> = None;

    for attempt in 1..=config.max_attempts {
        let wait = match manager
            .acquire(&request.name, &request.owner, request.ttl)
            .await
        {
            Ok(AcquireOutcome::Acquired(lease)) => return Ok(lease),
            Ok(AcquireOutcome::NotAcquired { holder, remaining }) => {
                store_backoff = min_backoff;
                info!(
                    lease = %request.name,
                    holder = holder.as_deref().unwrap_or_default(),
                    remaining_secs = remaining.as_secs(),
                    attempt,
                    "lease is held, waiting for it"
                );

                if remaining.is_zero() {
                    min_backoff
                } else {
                    remaining.min(max_wait)
                }
            }
            Err(err) if err.is_transient() => {
                warn!(
                    lease = %request.name,
                    error = %err,
                    attempt,
                    backoff_ms = store_backoff.as_millis() as u64,
                    "lease store failed, will retry after backoff"
                );
                last_error = Some(err);

                let wait = store_backoff;
                store_backoff = (store_backoff * 2).min(max_wait);
                wait
            }
            Err(err) => return Err(err),
        };

        if attempt < config.max_attempts {
            sleep(jittered(wait, config.jitter_percent)).await;
        }
    }

    let err = deid_error!(
        ErrorKind::LeaseAcquireExhausted,
        "Lease could not be acquired",
        format!(
            "lease `{}` not acquired after {} attempts",
            request.name, config.max_attempts
        )
    );

    Err(match last_error {
        Some(source) => err.with_source(source),
        None => err,
    })
}

/// Applies random jitter of ±`jitter_percent`% so contending runners spread their retries.
pub(crate) fn jittered(base: Duration, jitter_percent: u8) -> Duration {
    let jitter_range = base.as_secs_f64() * f64::from(jitter_percent) / 100.0;
    if jitter_range <= 0.0 {
        return base;
    }

    let jitter = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lease::store::memory::MemoryLeaseStore;
    use crate::test_utils::clock::TestClock;
    use crate::test_utils::lease_store::{FaultInjectingLeaseStore, LeaseStoreFault};

    const TTL: Duration = Duration::from_secs(60);

    fn config(max_attempts: u32) -> LeaseAcquireConfig {
        LeaseAcquireConfig {
            max_attempts,
            max_wait_ms: 10_000,
            min_backoff_ms: 100,
            jitter_percent: 0,
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let wait = jittered(base, 25);
            assert!(wait >= Duration::from_secs_f64(7.5));
            assert!(wait <= Duration::from_secs_f64(12.5));
        }
        assert_eq!(jittered(base, 0), base);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_holder_to_expire() {
        let clock = Arc::new(TestClock::following_tokio());
        let manager = LeaseManager::with_clock(MemoryLeaseStore::new(), clock);
        manager
            .acquire("identity", "holder", Duration::from_secs(25))
            .await
            .unwrap();

        let request = LeaseRequest::new("identity", "waiter", TTL);
        let lease = acquire_with_backoff(&manager, &request, &config(5))
            .await
            .unwrap();

        assert_eq!(lease.owner, "waiter");
        assert_eq!(lease.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let clock = Arc::new(TestClock::following_tokio());
        let manager = LeaseManager::with_clock(MemoryLeaseStore::new(), clock);
        manager.acquire("identity", "holder", TTL * 10).await.unwrap();

        let request = LeaseRequest::new("identity", "waiter", TTL);
        let err = acquire_with_backoff(&manager, &request, &config(3))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LeaseAcquireExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_store_failures() {
        let store = FaultInjectingLeaseStore::wrap(MemoryLeaseStore::new());
        store.fail_next_gets(2, LeaseStoreFault::Error);
        let manager = LeaseManager::with_clock(store, Arc::new(TestClock::following_tokio()));

        let request = LeaseRequest::new("identity", "waiter", TTL);
        let lease = acquire_with_backoff(&manager, &request, &config(5))
            .await
            .unwrap();

        assert_eq!(lease.version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_after_store_failures_keeps_the_cause() {
        let store = FaultInjectingLeaseStore::wrap(MemoryLeaseStore::new());
        store.fail_next_gets(10, LeaseStoreFault::Error);
        let manager = LeaseManager::with_clock(store, Arc::new(TestClock::following_tokio()));

        let request = LeaseRequest::new("identity", "waiter", TTL);
        let err = acquire_with_backoff(&manager, &request, &config(3))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LeaseAcquireExhausted);
        assert!(std::error::Error::source(&err).is_some());
    }
}
