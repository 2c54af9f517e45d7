//! Database row types and per-call options.
//!
//! Row structs mirror the tables the queue provisions inside its schema and
//! are decoded straight from query results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::retry::RetryBackoff;
use crate::states::JobState;

/// A job row.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier, minted by the store.
    pub id: Uuid,
    /// Logical queue the job belongs to.
    pub name: String,
    /// Higher priority is served first.
    pub priority: i32,
    /// Opaque payload handed to the handler.
    pub data: Value,
    /// Current lifecycle state.
    pub state: JobState,
    /// Retries allowed after the initial attempt.
    pub retry_limit: i32,
    /// Attempts so far; incremented when the job is claimed.
    pub retry_count: i32,
    /// Base retry delay in seconds.
    pub retry_delay_secs: i32,
    /// Delay growth mode.
    pub retry_backoff: RetryBackoff,
    /// Whether retry delays are widened by random jitter.
    pub retry_jitter: bool,
    /// Cap on computed retry delays, in seconds.
    pub retry_delay_max_secs: i32,
    /// Earliest time the job may be claimed.
    pub start_after: DateTime<Utc>,
    /// When the current (or last) attempt was claimed.
    pub started_on: Option<DateTime<Utc>>,
    /// Deduplication key; at most one non-terminal job per key and name.
    pub singleton_key: Option<String>,
    /// Fire-instant slot for schedule-minted jobs; unique per name.
    pub singleton_on: Option<DateTime<Utc>>,
    /// Seconds an active attempt may run before it is considered abandoned.
    pub expire_in_secs: i32,
    /// When the job was inserted.
    pub created_on: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub completed_on: Option<DateTime<Utc>>,
    /// Seconds a terminal job is retained before archival.
    pub keep_for_secs: i64,
    /// Success payload, or detail of the most recent failure.
    pub output: Option<Value>,
}

/// A job row that has been moved to the archive table.
#[derive(Debug, Clone, FromRow)]
pub struct ArchivedJob {
    /// The job as it looked when archived.
    #[sqlx(flatten)]
    pub job: Job,
    /// When the archive sweep moved it.
    pub archived_on: DateTime<Utc>,
}

/// A recurring job template.
#[derive(Debug, Clone, FromRow)]
pub struct Schedule {
    /// Queue name jobs are minted under; one schedule per name.
    pub name: String,
    /// Cron recurrence expression.
    pub cron: String,
    /// IANA timezone the expression is evaluated in.
    pub timezone: String,
    /// Payload template for minted jobs.
    pub data: Value,
    /// Send options applied to minted jobs, stored as JSON.
    pub options: Value,
    /// The next fire instant, as last computed.
    pub next_fire_on: DateTime<Utc>,
    /// When the schedule was registered.
    pub created_on: DateTime<Utc>,
    /// When the schedule definition last changed.
    pub updated_on: DateTime<Utc>,
}

/// Per-job options accepted by [`Overseer::send`](crate::Overseer::send).
///
/// Unset fields fall back to the [`Config`](crate::Config) defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    /// Priority; higher is served first.
    pub priority: i32,
    /// Retries allowed after the initial attempt.
    pub retry_limit: Option<u32>,
    /// Base delay before a retry becomes eligible.
    pub retry_delay: Option<Duration>,
    /// Delay growth mode.
    pub retry_backoff: Option<RetryBackoff>,
    /// Widen retry delays by bounded random jitter.
    pub retry_jitter: Option<bool>,
    /// Cap on computed retry delays.
    pub retry_delay_max: Option<Duration>,
    /// Earliest time the job may be claimed.
    pub start_after: Option<DateTime<Utc>>,
    /// How long an active attempt may run before expiring.
    pub expire_in: Option<Duration>,
    /// How long the job is retained after reaching a terminal state.
    pub keep_for: Option<Duration>,
    /// Deduplication key; a send is ignored while a non-terminal job with the
    /// same key and name exists.
    pub singleton_key: Option<String>,
}

impl SendOptions {
    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry limit.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    /// Set the base retry delay.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Set the backoff mode.
    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    /// Delay the job until the given time.
    pub fn with_start_after(mut self, start_after: DateTime<Utc>) -> Self {
        self.start_after = Some(start_after);
        self
    }

    /// Set the expiration horizon for active attempts.
    pub fn with_expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = Some(expire_in);
        self
    }

    /// Set the retention after a terminal state.
    pub fn with_keep_for(mut self, keep_for: Duration) -> Self {
        self.keep_for = Some(keep_for);
        self
    }

    /// Set the singleton deduplication key.
    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }
}

/// Options accepted by [`Overseer::work`](crate::Overseer::work).
#[derive(Debug, Clone)]
pub struct WorkOptions {
    /// Concurrency limit: how many handler invocations may run at once.
    pub team_size: usize,
    /// Cap on jobs claimed per request; defaults to the free capacity.
    pub batch_size: Option<usize>,
    /// Poll interval override for this worker.
    pub poll_interval: Option<Duration>,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            team_size: 1,
            batch_size: None,
            poll_interval: None,
        }
    }
}

impl WorkOptions {
    /// Set the concurrency limit.
    pub fn with_team_size(mut self, team_size: usize) -> Self {
        self.team_size = team_size.max(1);
        self
    }

    /// Cap the number of jobs claimed per request.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }

    /// Override the poll interval for this worker.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }
}

/// Options accepted by [`Overseer::schedule`](crate::Overseer::schedule).
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// IANA timezone the cron expression is evaluated in; UTC when unset.
    pub timezone: Option<String>,
    /// Send options applied to every job the schedule mints.
    pub send: SendOptions,
}

impl ScheduleOptions {
    /// Evaluate the cron expression in the given timezone.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Apply the given send options to minted jobs.
    pub fn with_send(mut self, send: SendOptions) -> Self {
        self.send = send;
        self
    }
}
