use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::notify::Notifier;
use crate::registry::BoxedHandler;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::schema::Job;
use crate::states::JobState;
use crate::storage::Storage;
use crate::util;

const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// One consumer loop for one queue name.
///
/// Claims jobs when capacity is free, runs each in its own task under a
/// semaphore permit, and reports the outcome back through the state machine.
/// Two triggers feed the claim attempt, the poll timer and the wake channel,
/// and only the timer is load-bearing; a dropped wake signal costs latency,
/// nothing else.
pub(crate) struct Worker {
    pub(crate) storage: Arc<Storage>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) name: String,
    pub(crate) handler: BoxedHandler,
    pub(crate) team_size: usize,
    pub(crate) batch_size: usize,
    pub(crate) poll_interval: Duration,
}

impl Worker {
    /// Calculate the sleep duration with random jitter applied, so a fleet of
    /// workers does not poll in lockstep.
    fn sleep_duration_with_jitter(&self) -> Duration {
        let jitter_millis = u64::try_from(DEFAULT_JITTER.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run until shutdown, then wait for in-flight handlers to finish.
    pub(crate) async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.team_size));
        let mut wake = self.notifier.subscribe(&self.name);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let capacity = semaphore.available_permits().min(self.batch_size);
            if capacity > 0 {
                match self
                    .storage
                    .claim_jobs(&self.name, i64::try_from(capacity).unwrap_or(1))
                    .await
                {
                    Ok(jobs) if !jobs.is_empty() => {
                        trace!(count = jobs.len(), "Claimed jobs");
                        for job in jobs {
                            // the claim size never exceeds the free permits
                            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                break;
                            };
                            let worker = Arc::clone(&self);
                            tokio::spawn(async move {
                                worker.run_job(job).await;
                                drop(permit);
                            });
                        }
                        // more jobs may be waiting; claim again while capacity remains
                        continue;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "Failed to claim jobs; backing off");
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.sleep_duration_with_jitter()) => {}
                received = wake.recv() => {
                    if let Err(RecvError::Closed) = received {
                        // no wake channel anymore; the poll timer still covers us
                        sleep(self.poll_interval).await;
                    }
                }
            }
        }

        // wait for in-flight handlers before reporting the worker stopped
        let permits = u32::try_from(self.team_size).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(permits).await;
        debug!(worker.queue = %self.name, "Worker stopped");
    }

    async fn run_job(&self, job: Job) {
        let span = info_span!(
            "job",
            job.id = %job.id,
            job.name = %job.name,
            job.attempt = job.retry_count,
        );
        async {
            debug!("Running job…");
            let outcome = AssertUnwindSafe((self.handler)(job.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(util::panic_error(panic)));

            match outcome {
                Ok(output) => self.report_success(&job, &output).await,
                Err(error) => self.report_failure(&job, &error).await,
            }
        }
        .instrument(span)
        .await;
    }

    async fn report_success(&self, job: &Job, output: &Value) {
        match self.storage.complete_job(job.id, Some(output)).await {
            Ok(true) => debug!("Job completed"),
            // cancelled or expired underneath us; the other actor won
            Ok(false) => debug!("Job was mutated concurrently; dropping the result"),
            Err(error) => warn!(%error, "Failed to record job completion"),
        }
    }

    async fn report_failure(&self, job: &Job, error: &anyhow::Error) {
        warn!(%error, "Job failed");
        let detail = json!({ "message": format!("{error:#}") });

        match RetryPolicy::from_job(job).decide(job.retry_count) {
            RetryDecision::Requeue(delay) => {
                let requeued = self
                    .storage
                    .requeue_job(job.id, JobState::Active, delay, Some(&detail))
                    .await;
                match requeued {
                    Ok(true) => {
                        debug!(?delay, "Requeued failed job");
                        self.notifier.publish(self.storage.pool(), &job.name).await;
                    }
                    Ok(false) => debug!("Job was mutated concurrently; skipping the requeue"),
                    Err(error) => warn!(%error, "Failed to requeue job"),
                }
            }
            RetryDecision::DeadLetter => {
                let updated = self
                    .storage
                    .dead_letter_job(job.id, JobState::Active, Some(&detail))
                    .await;
                match updated {
                    Ok(true) => warn!("Job dead-lettered after exhausting retries"),
                    Ok(false) => debug!("Job was mutated concurrently; skipping the dead-letter"),
                    Err(error) => warn!(%error, "Failed to dead-letter job"),
                }
            }
        }
    }
}
