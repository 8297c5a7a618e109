use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use deid::error::ErrorKind;
use deid::lease::store::LeaseStore;
use deid::lease::store::memory::MemoryLeaseStore;
use deid::lease::{
    AcquireOutcome, LeaseManager, LeaseRecord, LeaseRenewalLoop, LeaseRequest, LeaseState,
    RenewOutcome, acquire_with_backoff,
};
use deid::test_utils::clock::TestClock;
use deid::test_utils::lease_store::{FaultInjectingLeaseStore, LeaseStoreFault};
use deid_config::shared::LeaseAcquireConfig;
use deid_telemetry::tracing::init_test_tracing;
use futures::future::join_all;

const TTL: Duration = Duration::from_secs(30);

fn acquire_config(max_attempts: u32) -> LeaseAcquireConfig {
    LeaseAcquireConfig {
        max_attempts,
        max_wait_ms: 5_000,
        min_backoff_ms: 100,
        jitter_percent: 10,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_grant_the_lease_once() {
    init_test_tracing();
    let manager = LeaseManager::new(MemoryLeaseStore::new());

    let attempts = (0..16).map(|i| {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .acquire("identity", &format!("runner-{i}"), TTL)
                .await
                .unwrap()
        })
    });
    let outcomes: Vec<AcquireOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let winners: Vec<_> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            AcquireOutcome::Acquired(lease) => Some(lease.owner.clone()),
            AcquireOutcome::NotAcquired { .. } => None,
        })
        .collect();
    assert_eq!(winners.len(), 1);

    for outcome in &outcomes {
        if let AcquireOutcome::NotAcquired { holder, .. } = outcome {
            assert_eq!(holder.as_ref(), Some(&winners[0]));
        }
    }
}

#[tokio::test]
async fn versions_increase_with_every_write() {
    init_test_tracing();
    let clock = Arc::new(TestClock::new());
    let manager = LeaseManager::with_clock(MemoryLeaseStore::new(), clock.clone());

    let mut versions = Vec::new();
    let AcquireOutcome::Acquired(lease) = manager.acquire("identity", "a", TTL).await.unwrap()
    else {
        panic!("first acquire must succeed");
    };
    versions.push(lease.version);

    clock.advance(Duration::from_secs(10));
    let AcquireOutcome::Acquired(again) = manager.acquire("identity", "a", TTL).await.unwrap()
    else {
        panic!("re-acquire by the owner must succeed");
    };
    assert!(again.expires_at > lease.expires_at);
    versions.push(again.version);

    let RenewOutcome::Renewed(renewed) = manager.renew("identity", "a", TTL).await.unwrap() else {
        panic!("renewal of a held lease must succeed");
    };
    versions.push(renewed.version);

    manager.release("identity", "a").await.unwrap();
    versions.push(
        manager
            .store()
            .get("identity")
            .await
            .unwrap()
            .unwrap()
            .version,
    );

    let AcquireOutcome::Acquired(next) = manager.acquire("identity", "b", TTL).await.unwrap()
    else {
        panic!("a released lease must be free");
    };
    versions.push(next.version);

    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn racing_writer_between_read_and_write_wins() {
    init_test_tracing();
    let clock = Arc::new(TestClock::new());
    let store = FaultInjectingLeaseStore::wrap(MemoryLeaseStore::new());
    let manager = LeaseManager::with_clock(store.clone(), clock.clone());

    // Another runner creates the lease right after our read found none.
    store.fail_next_writes(
        1,
        LeaseStoreFault::ForeignWrite(LeaseRecord {
            name: "identity".to_string(),
            owner: Some("b".to_string()),
            expires_at: clock.now() + TimeDelta::seconds(30),
            version: 1,
        }),
    );

    let outcome = manager.acquire("identity", "a", TTL).await.unwrap();

    assert_eq!(
        outcome,
        AcquireOutcome::NotAcquired {
            holder: Some("b".to_string()),
            remaining: TTL,
        }
    );
}

#[tokio::test]
async fn store_failures_are_errors_not_contention() {
    init_test_tracing();
    let store = FaultInjectingLeaseStore::wrap(MemoryLeaseStore::new());
    let manager = LeaseManager::new(store.clone());
    store.fail_next_gets(1, LeaseStoreFault::Error);

    let err = manager.acquire("identity", "a", TTL).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LeaseStoreFailed);
    assert!(err.is_transient());
    assert!(store.inner().get("identity").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn waiting_runner_takes_over_once_the_holder_releases() {
    init_test_tracing();
    let clock = Arc::new(TestClock::following_tokio());
    let store = MemoryLeaseStore::new();
    let manager = LeaseManager::with_clock(store, clock);

    let holder = LeaseRenewalLoop::start(
        manager.clone(),
        LeaseRequest::new("identity", "a", TTL),
        &acquire_config(3),
    )
    .await
    .unwrap();

    // The holder keeps renewing, so a bounded wait runs out.
    let waiter = LeaseRequest::new("identity", "b", TTL);
    let err = acquire_with_backoff(&manager, &waiter, &acquire_config(3))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LeaseAcquireExhausted);
    holder.check_lease().unwrap();

    let status = holder.release().await.unwrap();
    assert_eq!(status.state, LeaseState::Released);

    let lease = acquire_with_backoff(&manager, &waiter, &acquire_config(1))
        .await
        .unwrap();
    assert_eq!(lease.owner, "b");
}

#[tokio::test(start_paused = true)]
async fn crashed_holder_is_recovered_by_expiry() {
    init_test_tracing();
    let clock = Arc::new(TestClock::following_tokio());
    let manager = LeaseManager::with_clock(MemoryLeaseStore::new(), clock);

    // The holder acquires and never renews nor releases.
    manager.acquire("identity", "crashed", TTL).await.unwrap();

    let config = LeaseAcquireConfig {
        max_attempts: 5,
        max_wait_ms: 60_000,
        min_backoff_ms: 100,
        jitter_percent: 0,
    };
    let lease = acquire_with_backoff(&manager, &LeaseRequest::new("identity", "b", TTL), &config)
        .await
        .unwrap();

    assert_eq!(lease.owner, "b");
    assert_eq!(lease.version, 2);
}
