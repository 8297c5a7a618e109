use std::sync::Arc;
use std::time::Duration;

use deid::error::ErrorKind;
use deid::failpoints::{LEASE_ACQUIRE__AFTER_WRITE, LEASE_RENEW__BEFORE_WRITE};
use deid::lease::store::LeaseStore;
use deid::lease::store::memory::MemoryLeaseStore;
use deid::lease::{AcquireOutcome, LeaseManager, LeaseRenewalLoop, LeaseRequest, LeaseState};
use deid::test_utils::clock::TestClock;
use deid::test_utils::failpoints::FailpointScenario;
use deid_config::shared::LeaseAcquireConfig;
use deid_telemetry::tracing::init_test_tracing;

const TTL: Duration = Duration::from_secs(30);

fn acquire_config() -> LeaseAcquireConfig {
    LeaseAcquireConfig {
        max_attempts: 1,
        max_wait_ms: 1_000,
        min_backoff_ms: 100,
        jitter_percent: 0,
    }
}

#[tokio::test(start_paused = true)]
async fn failure_after_the_write_is_recovered_by_the_same_owner() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(LEASE_ACQUIRE__AFTER_WRITE, "1*return")]);

    let store = MemoryLeaseStore::new();
    let manager = LeaseManager::with_clock(store.clone(), Arc::new(TestClock::following_tokio()));

    let err = manager.acquire("identity", "a", TTL).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LeaseStoreFailed);

    // The write went through before the failure, so the record already names the owner.
    let record = store.get("identity").await.unwrap().unwrap();
    assert_eq!(record.owner.as_deref(), Some("a"));
    assert_eq!(record.version, 1);

    let AcquireOutcome::Acquired(lease) = manager.acquire("identity", "a", TTL).await.unwrap()
    else {
        panic!("the owner should reacquire its own lease");
    };
    assert_eq!(lease.version, 2);

    let outcome = manager.acquire("identity", "b", TTL).await.unwrap();
    assert!(matches!(outcome, AcquireOutcome::NotAcquired { .. }));
}

#[tokio::test(start_paused = true)]
async fn a_single_failed_renewal_keeps_the_lease() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(LEASE_RENEW__BEFORE_WRITE, "1*return")]);

    let manager = LeaseManager::with_clock(
        MemoryLeaseStore::new(),
        Arc::new(TestClock::following_tokio()),
    );
    let renewal = LeaseRenewalLoop::start(
        manager,
        LeaseRequest::new("identity", "a", TTL),
        &acquire_config(),
    )
    .await
    .unwrap();

    tokio::time::sleep(TTL / 2 + Duration::from_millis(1)).await;
    assert_eq!(renewal.status().state, LeaseState::Holding);
    assert_eq!(renewal.status().version, Some(1));

    tokio::time::sleep(TTL / 2).await;
    renewal.check_lease().unwrap();
    assert_eq!(renewal.status().version, Some(2));

    let status = renewal.release().await.unwrap();
    assert_eq!(status.state, LeaseState::Released);
}

#[tokio::test(start_paused = true)]
async fn two_failed_renewals_lose_the_lease() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(LEASE_RENEW__BEFORE_WRITE, "2*return")]);

    let store = MemoryLeaseStore::new();
    let manager = LeaseManager::with_clock(store.clone(), Arc::new(TestClock::following_tokio()));
    let renewal = LeaseRenewalLoop::start(
        manager,
        LeaseRequest::new("identity", "a", TTL),
        &acquire_config(),
    )
    .await
    .unwrap();

    let mut status_rx = renewal.subscribe();
    status_rx
        .wait_for(|status| status.state == LeaseState::Lost)
        .await
        .unwrap();

    let err = renewal.check_lease().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LeaseLost);

    // Giving the lease up never touches the stored record.
    let status = renewal.release().await.unwrap();
    assert_eq!(status.state, LeaseState::Lost);
    let record = store.get("identity").await.unwrap().unwrap();
    assert_eq!(record.version, 1);
}
