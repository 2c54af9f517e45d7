use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::notify::Notifier;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::storage::Storage;

/// Rows handled per pass; anything left over is picked up by the next sweep.
const SWEEP_BATCH: i64 = 500;

/// Periodic lifecycle maintenance: expire abandoned active jobs, archive
/// terminal jobs past retention, purge archived jobs past a second window.
///
/// Each pass is idempotent and safe to run concurrently from several
/// processes; the optimistic state checks in the storage layer make a lost
/// race on one row a skip, never an abort of the pass.
pub(crate) struct Sweeper {
    storage: Arc<Storage>,
    notifier: Arc<Notifier>,
    interval: Duration,
    purge_after: Duration,
}

impl Sweeper {
    pub(crate) fn new(
        storage: Arc<Storage>,
        notifier: Arc<Notifier>,
        interval: Duration,
        purge_after: Duration,
    ) -> Self {
        Self {
            storage,
            notifier,
            interval,
            purge_after,
        }
    }

    pub(crate) async fn run(&self, shutdown: CancellationToken) {
        info!("Maintenance sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Maintenance sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// Run all three passes once. A failing pass is logged and the others
    /// still run; everything is retried on the next tick.
    pub(crate) async fn sweep(&self) {
        if let Err(error) = self.expire().await {
            warn!(%error, "Expire pass failed");
        }
        if let Err(error) = self.archive().await {
            warn!(%error, "Archive pass failed");
        }
        if let Err(error) = self.purge().await {
            warn!(%error, "Purge pass failed");
        }
    }

    /// Expire abandoned active jobs, then route every expired job through the
    /// retry policy exactly as if its handler had failed.
    pub(crate) async fn expire(&self) -> sqlx::Result<u64> {
        let expired = self.storage.expire_active(SWEEP_BATCH).await?;
        if expired > 0 {
            debug!(count = expired, "Expired abandoned active jobs");
        }

        for job in self.storage.expired_jobs(SWEEP_BATCH).await? {
            let policy = RetryPolicy::from_job(&job);
            match policy.decide(job.retry_count) {
                RetryDecision::Requeue(delay) => {
                    let requeued = self
                        .storage
                        .requeue_job(job.id, job.state, delay, None)
                        .await?;
                    if requeued {
                        debug!(job.id = %job.id, ?delay, "Requeued expired job");
                        self.notifier.publish(self.storage.pool(), &job.name).await;
                    }
                    // a lost race is fine, the next sweep sees the row again
                }
                RetryDecision::DeadLetter => {
                    let error = json!({"message": "job expired before an outcome was reported"});
                    let updated = self
                        .storage
                        .dead_letter_job(job.id, job.state, Some(&error))
                        .await?;
                    if updated {
                        warn!(job.id = %job.id, job.name = %job.name, "Dead-lettered expired job");
                    }
                }
            }
        }
        Ok(expired)
    }

    /// Move terminal jobs past their retention horizon to the archive table.
    pub(crate) async fn archive(&self) -> sqlx::Result<u64> {
        let archived = self.storage.archive_jobs(SWEEP_BATCH).await?;
        if archived > 0 {
            debug!(count = archived, "Archived terminal jobs");
        }
        Ok(archived)
    }

    /// Permanently remove archived jobs past the purge retention window.
    pub(crate) async fn purge(&self) -> sqlx::Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.purge_after).unwrap_or(chrono::Duration::MAX);
        let purged = self.storage.purge_archive(cutoff).await?;
        if purged > 0 {
            debug!(count = purged, "Purged archived jobs");
        }
        Ok(purged)
    }
}
