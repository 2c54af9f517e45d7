use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::config::JobDefaults;
use crate::retry::RetryBackoff;
use crate::schema::{ArchivedJob, Job, Schedule, SendOptions};
use crate::states::JobState;

/// All SQL the queue runs, qualified by the configured schema.
///
/// The schema name is validated at construction time to be a short lowercase
/// identifier, so interpolating it into statement text is safe. Every method
/// is a single statement (or a single data-modifying CTE), so no partial
/// update is ever observable.
pub(crate) struct Storage {
    pool: PgPool,
    schema: String,
}

/// Resolved column values for a job insert.
pub(crate) struct NewJob {
    pub(crate) name: String,
    pub(crate) data: Value,
    pub(crate) priority: i32,
    pub(crate) retry_limit: i32,
    pub(crate) retry_delay_secs: i32,
    pub(crate) retry_backoff: RetryBackoff,
    pub(crate) retry_jitter: bool,
    pub(crate) retry_delay_max_secs: i32,
    pub(crate) start_after: Option<DateTime<Utc>>,
    pub(crate) singleton_key: Option<String>,
    pub(crate) singleton_on: Option<DateTime<Utc>>,
    pub(crate) expire_in_secs: i32,
    pub(crate) keep_for_secs: i64,
}

impl NewJob {
    /// Merge explicit send options with the configured defaults.
    pub(crate) fn resolve(
        name: &str,
        data: Value,
        options: &SendOptions,
        defaults: &JobDefaults,
    ) -> Self {
        Self {
            name: name.to_owned(),
            data,
            priority: options.priority,
            retry_limit: i32::try_from(options.retry_limit.unwrap_or(defaults.retry_limit))
                .unwrap_or(i32::MAX),
            retry_delay_secs: secs_i32(options.retry_delay.unwrap_or(defaults.retry_delay)),
            retry_backoff: options.retry_backoff.unwrap_or(defaults.retry_backoff),
            retry_jitter: options.retry_jitter.unwrap_or(defaults.retry_jitter),
            retry_delay_max_secs: secs_i32(
                options.retry_delay_max.unwrap_or(defaults.retry_delay_max),
            ),
            start_after: options.start_after,
            singleton_key: options.singleton_key.clone(),
            singleton_on: None,
            // the expiration horizon must stay positive
            expire_in_secs: secs_i32(options.expire_in.unwrap_or(defaults.expire_in)).max(1),
            keep_for_secs: secs_i64(options.keep_for.unwrap_or(defaults.keep_for)),
        }
    }
}

fn secs_i32(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn secs_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

impl Storage {
    pub(crate) fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_owned(),
        }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Probe the store's random-identifier capability. Job ids default to
    /// `gen_random_uuid()`, which needs PostgreSQL 13+ or `pgcrypto`.
    pub(crate) async fn check_uuid_capability(&self) -> sqlx::Result<()> {
        sqlx::query("SELECT gen_random_uuid()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create the schema, tables and indexes. Idempotent.
    pub(crate) async fn provision(&self) -> sqlx::Result<()> {
        let s = &self.schema;
        let ddl = format!(
            r#"
            CREATE SCHEMA IF NOT EXISTS {s};

            CREATE TABLE IF NOT EXISTS {s}.job (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                name text NOT NULL,
                priority integer NOT NULL DEFAULT 0,
                data jsonb NOT NULL DEFAULT '{{}}'::jsonb,
                state text NOT NULL DEFAULT 'created'
                    CHECK (state IN ('created','active','completed','failed','cancelled','expired')),
                retry_limit integer NOT NULL DEFAULT 0,
                retry_count integer NOT NULL DEFAULT 0,
                retry_delay_secs integer NOT NULL DEFAULT 0,
                retry_backoff text NOT NULL DEFAULT 'fixed',
                retry_jitter boolean NOT NULL DEFAULT false,
                retry_delay_max_secs integer NOT NULL DEFAULT 86400,
                start_after timestamptz NOT NULL DEFAULT now(),
                started_on timestamptz,
                singleton_key text,
                singleton_on timestamptz,
                expire_in_secs integer NOT NULL DEFAULT 900 CHECK (expire_in_secs > 0),
                created_on timestamptz NOT NULL DEFAULT now(),
                completed_on timestamptz,
                keep_for_secs bigint NOT NULL DEFAULT 43200,
                output jsonb
            );

            CREATE INDEX IF NOT EXISTS job_claim_idx
                ON {s}.job (name, priority DESC, created_on)
                WHERE state = 'created';
            CREATE UNIQUE INDEX IF NOT EXISTS job_singleton_key_idx
                ON {s}.job (name, singleton_key)
                WHERE state IN ('created', 'active') AND singleton_key IS NOT NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS job_singleton_on_idx
                ON {s}.job (name, singleton_on)
                WHERE singleton_on IS NOT NULL;

            CREATE TABLE IF NOT EXISTS {s}.archive (
                LIKE {s}.job,
                archived_on timestamptz NOT NULL DEFAULT now()
            );

            CREATE INDEX IF NOT EXISTS archive_archived_on_idx
                ON {s}.archive (archived_on);

            CREATE TABLE IF NOT EXISTS {s}.schedule (
                name text PRIMARY KEY,
                cron text NOT NULL,
                timezone text NOT NULL DEFAULT 'UTC',
                data jsonb NOT NULL DEFAULT '{{}}'::jsonb,
                options jsonb NOT NULL DEFAULT '{{}}'::jsonb,
                next_fire_on timestamptz NOT NULL,
                created_on timestamptz NOT NULL DEFAULT now(),
                updated_on timestamptz NOT NULL DEFAULT now()
            );
            "#
        );
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a job. Returns `None` when a singleton constraint (either the
    /// non-terminal key or a schedule's fire-instant slot) deduplicated it.
    pub(crate) async fn insert_job(&self, job: &NewJob) -> sqlx::Result<Option<Uuid>> {
        let sql = format!(
            r"
            INSERT INTO {s}.job (
                name, data, priority,
                retry_limit, retry_delay_secs, retry_backoff, retry_jitter, retry_delay_max_secs,
                start_after, singleton_key, singleton_on, expire_in_secs, keep_for_secs
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, now()), $10, $11, $12, $13)
            ON CONFLICT DO NOTHING
            RETURNING id
            ",
            s = self.schema,
        );
        sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(&job.name)
            .bind(&job.data)
            .bind(job.priority)
            .bind(job.retry_limit)
            .bind(job.retry_delay_secs)
            .bind(job.retry_backoff)
            .bind(job.retry_jitter)
            .bind(job.retry_delay_max_secs)
            .bind(job.start_after)
            .bind(&job.singleton_key)
            .bind(job.singleton_on)
            .bind(job.expire_in_secs)
            .bind(job.keep_for_secs)
            .fetch_optional(&self.pool)
            .await
    }

    pub(crate) async fn get_job(&self, id: Uuid) -> sqlx::Result<Option<Job>> {
        let sql = format!("SELECT * FROM {s}.job WHERE id = $1", s = self.schema);
        sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Atomically claim up to `batch` eligible jobs for one caller.
    ///
    /// Rows locked by a concurrent claim are skipped rather than waited on, so
    /// under contention a caller receives fewer jobs, never a duplicate and
    /// never a block behind another worker's in-flight claim.
    pub(crate) async fn claim_jobs(&self, name: &str, batch: i64) -> sqlx::Result<Vec<Job>> {
        let sql = format!(
            r"
            WITH eligible AS (
                SELECT id FROM {s}.job
                WHERE name = $1 AND state = 'created' AND start_after <= now()
                ORDER BY priority DESC, created_on ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {s}.job AS job
            SET state = 'active', started_on = now(), retry_count = retry_count + 1
            FROM eligible
            WHERE job.id = eligible.id
            RETURNING job.*
            ",
            s = self.schema,
        );
        let mut jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(name)
            .bind(batch)
            .fetch_all(&self.pool)
            .await?;
        // UPDATE ... FROM does not preserve the CTE's ordering
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_on.cmp(&b.created_on))
        });
        Ok(jobs)
    }

    /// `active → completed`. False means another actor got there first.
    pub(crate) async fn complete_job(&self, id: Uuid, output: Option<&Value>) -> sqlx::Result<bool> {
        let sql = format!(
            r"
            UPDATE {s}.job
            SET state = 'completed', completed_on = now(), output = $2
            WHERE id = $1 AND state = 'active'
            ",
            s = self.schema,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(output)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `expected → failed`, terminally. Keeps the previous output when no new
    /// failure detail is supplied.
    pub(crate) async fn dead_letter_job(
        &self,
        id: Uuid,
        expected: JobState,
        error: Option<&Value>,
    ) -> sqlx::Result<bool> {
        let sql = format!(
            r"
            UPDATE {s}.job
            SET state = 'failed', completed_on = now(), output = COALESCE($3, output)
            WHERE id = $1 AND state = $2
            ",
            s = self.schema,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(expected)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `expected → created`, eligible again after `delay`. The recorded error
    /// (if any) is preserved as the job's output until the next outcome.
    pub(crate) async fn requeue_job(
        &self,
        id: Uuid,
        expected: JobState,
        delay: Duration,
        error: Option<&Value>,
    ) -> sqlx::Result<bool> {
        let sql = format!(
            r"
            UPDATE {s}.job
            SET state = 'created',
                start_after = now() + $3 * interval '1 second',
                started_on = NULL,
                completed_on = NULL,
                output = COALESCE($4, output)
            WHERE id = $1 AND state = $2
            ",
            s = self.schema,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(expected)
            .bind(secs_i64(delay))
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel a job that has not reached an outcome yet.
    pub(crate) async fn cancel_job(&self, id: Uuid) -> sqlx::Result<bool> {
        let sql = format!(
            r"
            UPDATE {s}.job
            SET state = 'cancelled', completed_on = now()
            WHERE id = $1 AND state IN ('created', 'active')
            ",
            s = self.schema,
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition abandoned active jobs to `expired`. Returns how many rows
    /// moved; retry routing happens separately via [`expired_jobs`].
    ///
    /// [`expired_jobs`]: Storage::expired_jobs
    pub(crate) async fn expire_active(&self, batch: i64) -> sqlx::Result<u64> {
        let sql = format!(
            r"
            WITH stuck AS (
                SELECT id FROM {s}.job
                WHERE state = 'active'
                  AND started_on + expire_in_secs * interval '1 second' <= now()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {s}.job AS job
            SET state = 'expired', completed_on = now()
            FROM stuck
            WHERE job.id = stuck.id
            ",
            s = self.schema,
        );
        let result = sqlx::query(&sql).bind(batch).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Jobs awaiting retry routing after expiration. Scanning all `expired`
    /// rows (not only freshly expired ones) lets a sweep interrupted between
    /// its two steps heal on the next pass.
    pub(crate) async fn expired_jobs(&self, batch: i64) -> sqlx::Result<Vec<Job>> {
        let sql = format!(
            "SELECT * FROM {s}.job WHERE state = 'expired' ORDER BY completed_on LIMIT $1",
            s = self.schema,
        );
        sqlx::query_as::<_, Job>(&sql)
            .bind(batch)
            .fetch_all(&self.pool)
            .await
    }

    /// Move terminal jobs past their retention horizon into the archive
    /// table. One data-modifying statement, so the move is atomic.
    pub(crate) async fn archive_jobs(&self, batch: i64) -> sqlx::Result<u64> {
        let sql = format!(
            r"
            WITH moved AS (
                DELETE FROM {s}.job
                WHERE id IN (
                    SELECT id FROM {s}.job
                    WHERE state IN ('completed', 'failed', 'cancelled')
                      AND completed_on + keep_for_secs * interval '1 second' <= now()
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
            )
            INSERT INTO {s}.archive
            SELECT moved.*, now() FROM moved
            ",
            s = self.schema,
        );
        let result = sqlx::query(&sql).bind(batch).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Permanently remove archived jobs older than the cutoff.
    pub(crate) async fn purge_archive(&self, cutoff: DateTime<Utc>) -> sqlx::Result<u64> {
        let sql = format!(
            "DELETE FROM {s}.archive WHERE archived_on <= $1",
            s = self.schema,
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Number of claimable jobs in a queue.
    pub(crate) async fn queue_size(&self, name: &str) -> sqlx::Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {s}.job WHERE name = $1 AND state = 'created'",
            s = self.schema,
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(name)
            .fetch_one(&self.pool)
            .await
    }

    /// Number of jobs in the archive table.
    pub(crate) async fn archived_count(&self) -> sqlx::Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {s}.archive", s = self.schema);
        sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool).await
    }

    /// Archived jobs, newest first, optionally filtered by queue name.
    pub(crate) async fn get_archived_jobs(
        &self,
        name: Option<&str>,
        limit: Option<i64>,
    ) -> sqlx::Result<Vec<ArchivedJob>> {
        let sql = format!(
            r"
            SELECT * FROM {s}.archive
            WHERE ($1::text IS NULL OR name = $1)
            ORDER BY archived_on DESC
            LIMIT $2
            ",
            s = self.schema,
        );
        sqlx::query_as::<_, ArchivedJob>(&sql)
            .bind(name)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    pub(crate) async fn upsert_schedule(
        &self,
        name: &str,
        cron: &str,
        timezone: &str,
        data: &Value,
        options: &Value,
        next_fire_on: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        let sql = format!(
            r"
            INSERT INTO {s}.schedule (name, cron, timezone, data, options, next_fire_on)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE
            SET cron = excluded.cron,
                timezone = excluded.timezone,
                data = excluded.data,
                options = excluded.options,
                next_fire_on = excluded.next_fire_on,
                updated_on = now()
            ",
            s = self.schema,
        );
        sqlx::query(&sql)
            .bind(name)
            .bind(cron)
            .bind(timezone)
            .bind(data)
            .bind(options)
            .bind(next_fire_on)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn delete_schedule(&self, name: &str) -> sqlx::Result<bool> {
        let sql = format!("DELETE FROM {s}.schedule WHERE name = $1", s = self.schema);
        let result = sqlx::query(&sql).bind(name).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn get_schedules(&self) -> sqlx::Result<Vec<Schedule>> {
        let sql = format!("SELECT * FROM {s}.schedule ORDER BY name", s = self.schema);
        sqlx::query_as::<_, Schedule>(&sql).fetch_all(&self.pool).await
    }

    /// Schedules whose stored next fire time has passed.
    pub(crate) async fn due_schedules(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Schedule>> {
        let sql = format!(
            "SELECT * FROM {s}.schedule WHERE next_fire_on <= $1 ORDER BY name",
            s = self.schema,
        );
        sqlx::query_as::<_, Schedule>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
    }

    /// Advance a schedule's stored next fire time, guarded against concurrent
    /// evaluators by matching the previously stored value.
    pub(crate) async fn advance_schedule(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let sql = format!(
            r"
            UPDATE {s}.schedule
            SET next_fire_on = $3, updated_on = now()
            WHERE name = $1 AND next_fire_on = $2
            ",
            s = self.schema,
        );
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(from)
            .bind(to)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
