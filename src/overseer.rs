use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::{Config, JobDefaults};
use crate::errors::{Error, Result};
use crate::notify::{Notifier, Wakeup};
use crate::registry::{BoxedHandler, WorkerHandle, WorkerRegistry};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::schema::{ArchivedJob, Job, Schedule, ScheduleOptions, SendOptions, WorkOptions};
use crate::scheduler::{self, Scheduler};
use crate::states::JobState;
use crate::storage::{NewJob, Storage};
use crate::sweeper::Sweeper;
use crate::worker::Worker;

/// A handle to one durable job queue.
///
/// Construction validates the configuration without touching the network;
/// [`start`](Overseer::start) connects, verifies the store, provisions the
/// schema and spawns the background loops (wake listener, scheduler,
/// maintenance sweeper). Any number of `Overseer` instances, in one process or
/// many, may point at the same schema; the store's transactional guarantees
/// keep them from stepping on each other.
pub struct Overseer {
    config: Config,
    defaults: JobDefaults,
    notifier: Arc<Notifier>,
    workers: Arc<WorkerRegistry>,
    runtime: Option<Runtime>,
}

/// Everything that only exists between `start()` and `stop()`.
struct Runtime {
    storage: Arc<Storage>,
    sweeper: Arc<Sweeper>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Overseer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overseer")
            .field("schema", &self.config.schema)
            .field("started", &self.runtime.is_some())
            .finish()
    }
}

impl Overseer {
    /// Validate the configuration and create an unstarted queue handle.
    ///
    /// Fails synchronously, before any connection attempt, when the
    /// configuration is invalid (oversized schema name, conflicting pool-size
    /// options, missing connection descriptor).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            defaults: config.job_defaults(),
            notifier: Arc::new(Notifier::new(&config.schema)),
            workers: Arc::new(WorkerRegistry::default()),
            runtime: None,
            config,
        })
    }

    /// Connect to the store, verify it, provision the schema, and spawn the
    /// background loops. A no-op when already started.
    ///
    /// Fails with [`Error::MissingCapability`] when the store cannot mint
    /// random identifiers (no `gen_random_uuid()`), naming the missing
    /// function so the problem can be diagnosed.
    pub async fn start(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.config.resolved_pool_size())
            .connect(&self.config.database_url())
            .await?;
        let storage = Arc::new(Storage::new(pool.clone(), &self.config.schema));

        if let Err(error) = storage.check_uuid_capability().await {
            return Err(Error::MissingCapability(format!(
                "gen_random_uuid() is unavailable; use PostgreSQL 13+ or install \
                 the pgcrypto extension ({error})"
            )));
        }
        storage.provision().await?;

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let listener = Arc::clone(&self.notifier);
        let listener_pool = pool.clone();
        let listener_shutdown = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            listener.listen(listener_pool, listener_shutdown).await;
        }));

        let scheduler = Scheduler::new(
            Arc::clone(&storage),
            Arc::clone(&self.notifier),
            self.defaults,
            self.config.schedule_interval,
        );
        let scheduler_shutdown = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            scheduler.run(scheduler_shutdown).await;
        }));

        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&storage),
            Arc::clone(&self.notifier),
            self.config.maintenance_interval,
            self.config.purge_after,
        ));
        let sweeper_loop = Arc::clone(&sweeper);
        let sweeper_shutdown = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            sweeper_loop.run(sweeper_shutdown).await;
        }));

        info!(schema = %self.config.schema, "Queue started");
        self.runtime = Some(Runtime {
            storage,
            sweeper,
            shutdown,
            tasks,
        });
        Ok(())
    }

    /// Stop all workers and background loops, waiting for in-flight handlers
    /// to finish, then close the pool. A no-op when not started.
    pub async fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        info!("Stopping queue…");
        runtime.shutdown.cancel();

        for handle in self.workers.drain() {
            let WorkerHandle { name, cancel, task } = handle;
            cancel.cancel();
            if let Err(error) = task.await {
                warn!(%error, worker.queue = %name, "Worker task panicked");
            }
        }
        for task in runtime.tasks {
            if let Err(error) = task.await {
                warn!(%error, "Background task panicked");
            }
        }
        runtime.storage.pool().close().await;
        info!("Queue stopped");
    }

    /// Enqueue a job.
    ///
    /// Returns the new job's id, or `None` when a singleton key deduplicated
    /// the send because a non-terminal job with the same name and key already
    /// exists. Deduplication is an outcome for the caller to interpret, not an
    /// error.
    pub async fn send(&self, name: &str, data: Value, options: SendOptions) -> Result<Option<Uuid>> {
        let storage = self.storage()?;
        let job = NewJob::resolve(name, data, &options, &self.defaults);
        match storage.insert_job(&job).await? {
            Some(id) => {
                debug!(job.id = %id, job.name = %name, "Job sent");
                self.notifier.publish(storage.pool(), name).await;
                Ok(Some(id))
            }
            None => {
                debug!(job.name = %name, "Send deduplicated by singleton key");
                Ok(None)
            }
        }
    }

    /// Claim up to `batch_size` jobs for manual consumption, transitioning
    /// them to `active`. Returns an empty vector when nothing is eligible.
    pub async fn fetch(&self, name: &str, batch_size: usize) -> Result<Vec<Job>> {
        let storage = self.storage()?;
        let batch = i64::try_from(batch_size).unwrap_or(i64::MAX);
        Ok(storage.claim_jobs(name, batch).await?)
    }

    /// Register a consumer for a queue and start its worker loop.
    ///
    /// The handler receives each claimed [`Job`] and reports back a success
    /// payload (recorded as the job's output) or an error (routed through the
    /// retry policy). Panics are caught and treated as errors. Returns a
    /// worker id usable with [`off_work`](Overseer::off_work).
    pub async fn work<F, Fut>(&self, name: &str, options: WorkOptions, handler: F) -> Result<Uuid>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let runtime = self.runtime()?;
        let handler: BoxedHandler = Arc::new(move |job| handler(job).boxed());
        let team_size = options.team_size.max(1);
        let worker = Arc::new(Worker {
            storage: Arc::clone(&runtime.storage),
            notifier: Arc::clone(&self.notifier),
            name: name.to_owned(),
            handler,
            team_size,
            batch_size: options.batch_size.unwrap_or(team_size).max(1),
            poll_interval: options.poll_interval.unwrap_or(self.config.poll_interval),
        });

        let id = Uuid::new_v4();
        let cancel = runtime.shutdown.child_token();
        let span = info_span!("worker", worker.queue = %name, worker.id = %id);
        let task = tokio::spawn(worker.run(cancel.clone()).instrument(span));
        self.workers.insert(
            id,
            WorkerHandle {
                name: name.to_owned(),
                cancel,
                task,
            },
        );
        info!(worker.queue = %name, worker.id = %id, "Worker started");
        Ok(id)
    }

    /// Stop one worker, waiting for its in-flight handlers to finish.
    pub async fn off_work(&self, worker_id: Uuid) -> Result<()> {
        let handle = self
            .workers
            .remove(worker_id)
            .ok_or(Error::UnknownWorker(worker_id))?;
        let WorkerHandle { name, cancel, task } = handle;
        cancel.cancel();
        if let Err(error) = task.await {
            warn!(%error, worker.queue = %name, "Worker task panicked");
        }
        info!(worker.queue = %name, worker.id = %worker_id, "Worker stopped");
        Ok(())
    }

    /// Register (or replace) a recurring schedule minting jobs under `name`.
    ///
    /// Accepts standard five-field cron expressions as well as six/seven-field
    /// expressions with seconds. Evaluation happens in the configured
    /// timezone, UTC by default. At most one job is minted per fire instant
    /// even when several processes evaluate the same schedule; instants missed
    /// during downtime are skipped, except the most recent one.
    pub async fn schedule(
        &self,
        cron: &str,
        name: &str,
        data: Value,
        options: ScheduleOptions,
    ) -> Result<()> {
        let storage = self.storage()?;
        let parsed = scheduler::parse_cron(cron)?;
        let timezone = options.timezone.as_deref().unwrap_or("UTC");
        let tz = scheduler::parse_timezone(timezone)?;
        let next = scheduler::next_fire(&parsed, tz, Utc::now())
            .ok_or_else(|| Error::InvalidCron(cron.to_owned()))?;
        let send_options = serde_json::to_value(&options.send).unwrap_or_else(|_| json!({}));

        storage
            .upsert_schedule(name, cron, timezone, &data, &send_options, next)
            .await?;
        info!(schedule.name = %name, cron = %cron, next_fire = %next, "Schedule registered");
        Ok(())
    }

    /// Remove a schedule. Returns whether one existed.
    pub async fn unschedule(&self, name: &str) -> Result<bool> {
        Ok(self.storage()?.delete_schedule(name).await?)
    }

    /// All registered schedules.
    pub async fn get_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self.storage()?.get_schedules().await?)
    }

    /// Look up a job by id. Archived and purged jobs are not found.
    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.storage()?.get_job(id).await?)
    }

    /// Cancel a job that has not reached an outcome. Cancellation is
    /// cooperative: a handler already running is not interrupted, but the job
    /// will not be dispatched again and its result will be dropped.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let storage = self.storage()?;
        if storage.cancel_job(id).await? {
            info!(job.id = %id, "Job cancelled");
            return Ok(());
        }
        match storage.get_job(id).await? {
            None => Err(Error::JobNotFound(id)),
            Some(_) => Err(Error::StateConflict { id }),
        }
    }

    /// Manually report an active job as completed with the given output.
    pub async fn complete(&self, id: Uuid, output: Value) -> Result<()> {
        let storage = self.storage()?;
        if storage.complete_job(id, Some(&output)).await? {
            return Ok(());
        }
        match storage.get_job(id).await? {
            None => Err(Error::JobNotFound(id)),
            Some(_) => Err(Error::StateConflict { id }),
        }
    }

    /// Manually report an active job as failed.
    ///
    /// Routed through the retry policy exactly like a handler failure: the job
    /// is either requeued with backoff or dead-lettered, and `error` becomes
    /// its recorded output either way.
    pub async fn fail(&self, id: Uuid, error: Value) -> Result<()> {
        let storage = self.storage()?;
        let job = storage.get_job(id).await?.ok_or(Error::JobNotFound(id))?;
        if job.state != JobState::Active {
            return Err(Error::StateConflict { id });
        }
        match RetryPolicy::from_job(&job).decide(job.retry_count) {
            RetryDecision::Requeue(delay) => {
                if storage
                    .requeue_job(id, JobState::Active, delay, Some(&error))
                    .await?
                {
                    self.notifier.publish(storage.pool(), &job.name).await;
                    return Ok(());
                }
            }
            RetryDecision::DeadLetter => {
                if storage
                    .dead_letter_job(id, JobState::Active, Some(&error))
                    .await?
                {
                    return Ok(());
                }
            }
        }
        Err(Error::StateConflict { id })
    }

    /// Subscribe to wake signals for a queue without consuming jobs.
    ///
    /// Delivery is best effort; receivers may observe gaps after reconnects
    /// and must not treat the signal as a correctness primitive.
    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<Wakeup> {
        self.notifier.subscribe(name)
    }

    /// Run the expire pass now: transition abandoned active jobs and route
    /// them through the retry policy. Returns how many jobs expired.
    pub async fn expire(&self) -> Result<u64> {
        Ok(self.runtime()?.sweeper.expire().await?)
    }

    /// Run the archive pass now. Returns how many jobs were archived.
    pub async fn archive(&self) -> Result<u64> {
        Ok(self.runtime()?.sweeper.archive().await?)
    }

    /// Run the purge pass now. Returns how many archived jobs were removed.
    pub async fn purge(&self) -> Result<u64> {
        Ok(self.runtime()?.sweeper.purge().await?)
    }

    /// Number of jobs currently claimable in a queue.
    pub async fn queue_size(&self, name: &str) -> Result<i64> {
        Ok(self.storage()?.queue_size(name).await?)
    }

    /// Number of jobs in the archive table.
    pub async fn archived_count(&self) -> Result<i64> {
        Ok(self.storage()?.archived_count().await?)
    }

    /// Archived jobs, newest first, optionally filtered by queue name.
    pub async fn get_archived_jobs(
        &self,
        name: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<ArchivedJob>> {
        Ok(self.storage()?.get_archived_jobs(name, limit).await?)
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or(Error::NotStarted)
    }

    fn storage(&self) -> Result<&Arc<Storage>> {
        Ok(&self.runtime()?.storage)
    }
}
