//! Background renewal of a held lease.
//!
//! ```text
//!  Acquiring ──► Holding ──► Renewing ──► Holding ──► ...
//!                   │            │
//!                   ▼            ▼
//!               Released        Lost
//! ```
//!
//! The owner of the lease keeps working while a spawned task renews the lease every half time
//! to live. A renewal that fails on a lease store error is retried after a quarter of the time
//! to live; a second consecutive failure gives the lease up.
//!
//! The owner is expected to call [`LeaseRenewalLoop::check_lease`] between units of work: once
//! the lease is lost, no further output may be produced under it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deid_config::shared::LeaseAcquireConfig;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bail;
use crate::error::{DeidResult, ErrorKind};
use crate::lease::manager::{LeaseManager, RenewOutcome};
use crate::lease::store::LeaseStore;
use crate::lease::{Lease, LeaseRequest, acquire_with_backoff};
use crate::metrics::{DEID_LEASE_RENEWALS_TOTAL, LEASE_LABEL, OUTCOME_LABEL};

/// Lifecycle state of a renewed lease. `Released` and `Lost` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Acquiring,
    Holding,
    Renewing,
    Released,
    Lost,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Acquiring => "acquiring",
            LeaseState::Holding => "holding",
            LeaseState::Renewing => "renewing",
            LeaseState::Released => "released",
            LeaseState::Lost => "lost",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LeaseState::Released | LeaseState::Lost)
    }
}

/// State published by the renewal task, with the last expiry the store confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub state: LeaseState,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: Option<u64>,
}

impl LeaseStatus {
    fn acquiring() -> Self {
        Self {
            state: LeaseState::Acquiring,
            expires_at: None,
            version: None,
        }
    }

    fn holding(lease: &Lease) -> Self {
        Self {
            state: LeaseState::Holding,
            expires_at: Some(lease.expires_at),
            version: Some(lease.version),
        }
    }
}

/// Handle to a lease held and renewed in the background.
#[derive(Debug)]
pub struct LeaseRenewalLoop<S> {
    manager: LeaseManager<S>,
    request: LeaseRequest,
    status_tx: Arc<watch::Sender<LeaseStatus>>,
    status_rx: watch::Receiver<LeaseStatus>,
    shutdown_tx: watch::Sender<()>,
    join_handle: Option<JoinHandle<()>>,
}

impl<S> LeaseRenewalLoop<S>
where
    S: LeaseStore + Clone + Send + Sync + 'static,
{
    /// Acquires the lease, waiting with backoff while it is held elsewhere, and starts renewing
    /// it every `ttl / 2`.
    pub async fn start(
        manager: LeaseManager<S>,
        request: LeaseRequest,
        acquire_config: &LeaseAcquireConfig,
    ) -> DeidResult<Self> {
        let (status_tx, status_rx) = watch::channel(LeaseStatus::acquiring());
        let status_tx = Arc::new(status_tx);

        let lease = acquire_with_backoff(&manager, &request, acquire_config).await?;
        status_tx.send_replace(LeaseStatus::holding(&lease));

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let worker = RenewalWorker {
            manager: manager.clone(),
            request: request.clone(),
            status_tx: status_tx.clone(),
            shutdown_rx,
            lease,
        };
        let join_handle = tokio::spawn(worker.run());

        Ok(Self {
            manager,
            request,
            status_tx,
            status_rx,
            shutdown_tx,
            join_handle: Some(join_handle),
        })
    }

    pub fn status(&self) -> LeaseStatus {
        self.status_rx.borrow().clone()
    }

    /// Returns a receiver observing every state change.
    pub fn subscribe(&self) -> watch::Receiver<LeaseStatus> {
        self.status_rx.clone()
    }

    /// Fails with [`ErrorKind::LeaseLost`] unless the lease is still held.
    ///
    /// Also fails when the local clock has passed the last expiry confirmed by the store, even
    /// if the renewal task has not noticed yet.
    pub fn check_lease(&self) -> DeidResult<()> {
        let status = self.status();

        if status.state.is_terminal() {
            bail!(
                ErrorKind::LeaseLost,
                "Lease is no longer held",
                format!("lease `{}` is {}", self.request.name, status.state.as_str())
            );
        }

        if let Some(expires_at) = status.expires_at
            && self.manager.now() >= expires_at
        {
            bail!(
                ErrorKind::LeaseLost,
                "Lease expired before it was renewed",
                format!("lease `{}`", self.request.name)
            );
        }

        Ok(())
    }

    /// Stops renewing and releases the lease, returning the final status.
    ///
    /// A lease already lost is not released again. Releasing is best effort with respect to
    /// contention but lease store failures are returned.
    pub async fn release(mut self) -> DeidResult<LeaseStatus> {
        let _ = self.shutdown_tx.send(());
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.await?;
        }

        if self.status_rx.borrow().state == LeaseState::Lost {
            info!(lease = %self.request.name, "lease was lost, skipping release");
            return Ok(self.status());
        }

        self.manager
            .release(&self.request.name, &self.request.owner)
            .await?;

        self.status_tx
            .send_modify(|status| status.state = LeaseState::Released);

        Ok(self.status())
    }
}

struct RenewalWorker<S> {
    manager: LeaseManager<S>,
    request: LeaseRequest,
    status_tx: Arc<watch::Sender<LeaseStatus>>,
    shutdown_rx: watch::Receiver<()>,
    lease: Lease,
}

impl<S> RenewalWorker<S>
where
    S: LeaseStore,
{
    async fn run(mut self) {
        let interval = renewal_interval(self.request.ttl);
        let mut failed_last_cycle = false;

        info!(
            lease = %self.request.name,
            interval_ms = interval.as_millis() as u64,
            "starting lease renewal"
        );

        loop {
            let wait = if failed_last_cycle { interval / 2 } else { interval };

            tokio::select! {
                biased;

                // Also fires when the handle is dropped.
                _ = self.shutdown_rx.changed() => {
                    debug!(lease = %self.request.name, "lease renewal stopped");
                    return;
                }
                _ = sleep(wait) => {}
            }

            self.update(LeaseState::Renewing);

            match self
                .manager
                .renew(&self.request.name, &self.request.owner, self.request.ttl)
                .await
            {
                Ok(RenewOutcome::Renewed(lease)) => {
                    self.lease = lease;
                    failed_last_cycle = false;
                    self.update(LeaseState::Holding);
                }
                Ok(RenewOutcome::Lost(reason)) => {
                    error!(
                        lease = %self.request.name,
                        reason = reason.as_str(),
                        "lease lost during renewal"
                    );
                    self.update(LeaseState::Lost);
                    return;
                }
                Err(err) => {
                    counter!(
                        DEID_LEASE_RENEWALS_TOTAL,
                        LEASE_LABEL => self.request.name.clone(),
                        OUTCOME_LABEL => "failed"
                    )
                    .increment(1);

                    let expired = self.manager.now() >= self.lease.expires_at;
                    if failed_last_cycle || expired {
                        error!(
                            lease = %self.request.name,
                            error = %err,
                            "lease renewal failed again, giving the lease up"
                        );
                        self.update(LeaseState::Lost);
                        return;
                    }

                    warn!(
                        lease = %self.request.name,
                        error = %err,
                        "lease renewal failed, retrying next cycle"
                    );
                    failed_last_cycle = true;
                    self.update(LeaseState::Holding);
                }
            }
        }
    }

    fn update(&self, state: LeaseState) {
        self.status_tx.send_replace(LeaseStatus {
            state,
            expires_at: Some(self.lease.expires_at),
            version: Some(self.lease.version),
        });
        debug!(lease = %self.request.name, state = state.as_str(), "lease state changed");
    }
}

/// Half the time to live, so one failed renewal still leaves time for another attempt.
fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(Duration::from_millis(1))
}
