//! Lease reaper
//!
//! Periodically reclaims tasks whose lease ran out without an ack, nack or
//! extension. Each reclaimed lease counts as an implicit retryable failure,
//! so an abandoned task is retried or dead-lettered like any other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::persistence::{NackOutcome, StoreError, TaskStore};
use crate::reliability::RetryDecider;

/// What a single reaper pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Tasks made eligible for another claim
    pub reclaimed: usize,

    /// Tasks whose abandoned attempt was their last
    pub dead_lettered: usize,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.reclaimed + self.dead_lettered
    }
}

/// Background sweeper for expired leases
///
/// The reaper talks to the store only through `reap_expired_leases`, so it
/// can run in any process next to producers and workers. Several reapers on
/// the same store are safe; a lease is reclaimed by exactly one of them.
pub struct LeaseReaper {
    store: Arc<dyn TaskStore>,
    decider: Arc<dyn RetryDecider>,
    interval: Duration,
    batch_size: usize,
}

impl LeaseReaper {
    /// Create a reaper
    pub fn new(
        store: Arc<dyn TaskStore>,
        decider: Arc<dyn RetryDecider>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            decider,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    /// Time between passes
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reclaim every lease that is expired right now
    ///
    /// Works in batches of `batch_size` until a batch comes back short.
    pub async fn run_once(&self) -> Result<ReapReport, StoreError> {
        let mut report = ReapReport::default();

        loop {
            let reaped = self
                .store
                .reap_expired_leases(self.decider.as_ref(), self.batch_size)
                .await?;

            for task in &reaped {
                match task.outcome {
                    NackOutcome::Retrying { .. } => report.reclaimed += 1,
                    NackOutcome::DeadLettered { .. } => {
                        warn!(task_id = %task.task_id, queue = %task.queue, "abandoned task dead-lettered");
                        report.dead_lettered += 1;
                    }
                    NackOutcome::InvalidLease => {}
                }
            }

            if reaped.len() < self.batch_size {
                break;
            }
        }

        if report.total() > 0 {
            info!(
                reclaimed = report.reclaimed,
                dead_lettered = report.dead_lettered,
                "Reclaimed expired leases"
            );
        }

        Ok(report)
    }

    /// Run passes every `interval` until `shutdown` flips to `true`
    ///
    /// Store errors are logged and the next pass tries again.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Lease reaper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Lease reaping failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Lease reaper: shutdown requested");
                        break;
                    }
                }
            }
        }

        info!("Lease reaper stopped");
    }

    /// Run on a background task
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));

        ReaperHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Handle to a spawned [`LeaseReaper`]
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper after its current pass and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!("Lease reaper task failed: {}", e);
        }
    }

    /// Whether the reaper loop has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
