#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use claims::{assert_none, assert_some};
use insta::assert_compact_json_snapshot;
use overseer::{Config, Error, JobState, Overseer, ScheduleOptions, SendOptions, WorkOptions};
use serde_json::json;
use sqlx::PgPool;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use overseer::Job;
    use testcontainers::ImageExt;
    use testcontainers::runners::AsyncRunner;

    /// Start a disposable PostgreSQL and return its connection string.
    pub(super) async fn postgres() -> anyhow::Result<(String, ContainerAsync<Postgres>)> {
        let container = Postgres::default().with_tag("16-alpine").start().await?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        Ok((connection_string, container))
    }

    /// A config tuned for tests: fast polling, no automatic sweeps (the tests
    /// drive maintenance passes explicitly), immediate retries.
    pub(super) fn test_config(connection_string: &str) -> Config {
        Config {
            connection_string: Some(connection_string.to_owned()),
            poll_interval: Duration::from_millis(100),
            schedule_interval: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(3600),
            retry_delay: Duration::ZERO,
            ..Config::default()
        }
    }

    pub(super) async fn start_queue()
    -> anyhow::Result<(Overseer, PgPool, ContainerAsync<Postgres>)> {
        let (connection_string, container) = postgres().await?;
        let mut boss = Overseer::new(test_config(&connection_string))?;
        boss.start().await?;
        let pool = PgPool::connect(&connection_string).await?;
        Ok((boss, pool, container))
    }

    /// Poll until the job reaches the given state, or fail after ten seconds.
    pub(super) async fn wait_for_state(
        boss: &Overseer,
        id: Uuid,
        state: JobState,
    ) -> anyhow::Result<Job> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(job) = boss.get_job(id).await?
                && job.state == state
            {
                return Ok(job);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timed out waiting for job {id} to reach {state}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[tokio::test]
async fn start_provisions_the_schema() -> anyhow::Result<()> {
    let (mut boss, pool, _container) = test_utils::start_queue().await?;

    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_schema = 'overseer'
           AND table_name IN ('job', 'archive', 'schedule')",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(tables, 3);

    // starting twice is a no-op, and provisioning is idempotent
    boss.start().await?;

    boss.stop().await;
    Ok(())
}

#[tokio::test]
async fn start_fails_without_uuid_capability() -> anyhow::Result<()> {
    use testcontainers::ImageExt;
    use testcontainers::runners::AsyncRunner;

    // PostgreSQL 11 has no built-in gen_random_uuid() and pgcrypto is not
    // installed in a fresh database
    let container = Postgres::default().with_tag("11-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let mut boss = Overseer::new(Config::from_connection_string(connection_string))?;
    let error = boss.start().await.unwrap_err();

    assert!(matches!(error, Error::MissingCapability(_)));
    assert!(error.to_string().contains("gen_random_uuid()"));
    Ok(())
}

#[tokio::test]
async fn operations_before_start_are_rejected() -> anyhow::Result<()> {
    let boss = Overseer::new(Config::from_connection_string("postgres://localhost/app"))?;
    let error = boss.send("email", json!({}), SendOptions::default()).await;
    assert!(matches!(error, Err(Error::NotStarted)));
    Ok(())
}

#[tokio::test]
async fn send_fetch_complete_roundtrip() -> anyhow::Result<()> {
    let (mut boss, _pool, _container) = test_utils::start_queue().await?;

    let id = assert_some!(
        boss.send("email", json!({"to": "user@example.com"}), SendOptions::default())
            .await?
    );
    assert_eq!(boss.queue_size("email").await?, 1);

    let jobs = boss.fetch("email", 1).await?;
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.id, id);
    assert_eq!(job.state, JobState::Active);
    assert_eq!(job.retry_count, 1);
    assert_some!(job.started_on);
    assert_compact_json_snapshot!(job.data, @r#"{"to": "user@example.com"}"#);

    // the job is owned now; a second fetch finds nothing
    assert!(boss.fetch("email", 1).await?.is_empty());

    boss.complete(id, json!({"delivered": true})).await?;
    let job = boss.get_job(id).await?.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_some!(job.completed_on);
    assert_compact_json_snapshot!(job.output, @r#"{"delivered": true}"#);

    boss.stop().await;
    Ok(())
}

#[tokio::test]
async fn claims_serve_higher_priority_first() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::start_queue().await?;

    let first = assert_some!(boss.send("work", json!({}), SendOptions::default()).await?);
    let urgent = assert_some!(
        boss.send("work", json!({}), SendOptions::default().with_priority(5))
            .await?
    );
    let second = assert_some!(boss.send("work", json!({}), SendOptions::default()).await?);

    let claimed: Vec<Uuid> = boss.fetch("work", 3).await?.iter().map(|j| j.id).collect();
    assert_eq!(claimed, vec![urgent, first, second]);
    Ok(())
}

#[tokio::test]
async fn singleton_key_rejects_concurrent_duplicates() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::start_queue().await?;
    let options = SendOptions::default().with_singleton_key("user-42");

    let first = assert_some!(boss.send("email", json!({"n": 1}), options.clone()).await?);

    // a second non-terminal job with the same key and name is deduplicated
    assert_none!(boss.send("email", json!({"n": 2}), options.clone()).await?);

    // still deduplicated while the first is active
    boss.fetch("email", 1).await?;
    assert_none!(boss.send("email", json!({"n": 3}), options.clone()).await?);

    // once the first reaches a terminal state the key is free again
    boss.complete(first, json!({})).await?;
    assert_some!(boss.send("email", json!({"n": 4}), options).await?);
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::start_queue().await?;

    for n in 0..20 {
        assert_some!(boss.send("bulk", json!({"n": n}), SendOptions::default()).await?);
    }

    let (a, b, c, d) = tokio::join!(
        boss.fetch("bulk", 5),
        boss.fetch("bulk", 5),
        boss.fetch("bulk", 5),
        boss.fetch("bulk", 5),
    );

    let mut seen = std::collections::HashSet::new();
    let mut total = 0;
    for jobs in [a?, b?, c?, d?] {
        assert!(jobs.len() <= 5);
        total += jobs.len();
        for job in jobs {
            assert!(seen.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert_eq!(total, 20);
    Ok(())
}

#[tokio::test]
async fn failing_handler_retries_until_dead_letter() -> anyhow::Result<()> {
    let (mut boss, _pool, _container) = test_utils::start_queue().await?;

    let attempts = Arc::new(AtomicU32::new(0));
    let handler_attempts = Arc::clone(&attempts);
    boss.work("flaky", WorkOptions::default(), move |_job| {
        let attempts = Arc::clone(&handler_attempts);
        async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Err(anyhow::anyhow!("boom on attempt {attempt}"))
        }
    })
    .await?;

    let id = assert_some!(
        boss.send("flaky", json!({}), SendOptions::default().with_retry_limit(2))
            .await?
    );

    // retry limit 2 means three total attempts, then a terminal failure
    let job = test_utils::wait_for_state(&boss, id, JobState::Failed).await?;
    assert_eq!(job.retry_count, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let output = job.output.unwrap();
    assert!(output["message"].as_str().unwrap().contains("boom on attempt 3"));

    boss.stop().await;
    Ok(())
}

#[tokio::test]
async fn panicking_handler_is_caught_and_dead_lettered() -> anyhow::Result<()> {
    let (mut boss, _pool, _container) = test_utils::start_queue().await?;

    boss.work("panicky", WorkOptions::default(), |_job| async move {
        panic!("handler exploded");
    })
    .await?;

    let id = assert_some!(
        boss.send("panicky", json!({}), SendOptions::default().with_retry_limit(0))
            .await?
    );

    let job = test_utils::wait_for_state(&boss, id, JobState::Failed).await?;
    let output = job.output.unwrap();
    assert!(output["message"].as_str().unwrap().contains("handler exploded"));

    boss.stop().await;
    Ok(())
}

#[tokio::test]
async fn expired_jobs_requeue_then_dead_letter() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::start_queue().await?;

    let options = SendOptions::default()
        .with_retry_limit(1)
        .with_expire_in(Duration::from_secs(1));
    let id = assert_some!(boss.send("slow", json!({}), options).await?);

    // first attempt is abandoned: claimed, never completed
    assert_eq!(boss.fetch("slow", 1).await?.len(), 1);
    assert_eq!(boss.expire().await?, 0, "not past its horizon yet");
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(boss.expire().await?, 1);

    // one retry is allowed, so the expiration requeued it
    let job = boss.get_job(id).await?.unwrap();
    assert_eq!(job.state, JobState::Created);
    assert_eq!(job.retry_count, 1);

    // second attempt is abandoned too; now retries are exhausted
    assert_eq!(boss.fetch("slow", 1).await?.len(), 1);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(boss.expire().await?, 1);

    let job = boss.get_job(id).await?.unwrap();
    assert_eq!(job.state, JobState::Failed);
    let output = job.output.unwrap();
    assert!(output["message"].as_str().unwrap().contains("expired"));
    Ok(())
}

#[tokio::test]
async fn archive_and_purge_respect_both_retention_windows() -> anyhow::Result<()> {
    let (connection_string, _container) = test_utils::postgres().await?;
    let mut boss = Overseer::new(Config {
        purge_after: Duration::from_secs(1),
        ..test_utils::test_config(&connection_string)
    })?;
    boss.start().await?;

    let options = SendOptions::default().with_keep_for(Duration::from_secs(1));
    let id = assert_some!(boss.send("audit", json!({}), options).await?);
    boss.fetch("audit", 1).await?;
    boss.complete(id, json!({})).await?;

    // terminal, but the retention horizon has not elapsed
    assert_eq!(boss.archive().await?, 0);
    assert_some!(boss.get_job(id).await?);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(boss.archive().await?, 1);
    assert_none!(boss.get_job(id).await?);
    assert_eq!(boss.archived_count().await?, 1);

    let archived = boss.get_archived_jobs(Some("audit"), None).await?;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].job.id, id);
    assert_eq!(archived[0].job.state, JobState::Completed);

    // archived, but the purge window has not elapsed
    assert_eq!(boss.purge().await?, 0);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(boss.purge().await?, 1);
    assert_eq!(boss.archived_count().await?, 0);

    boss.stop().await;
    Ok(())
}

#[tokio::test]
async fn schedules_mint_one_job_per_fire_instant() -> anyhow::Result<()> {
    let (connection_string, _container) = test_utils::postgres().await?;
    let fast_schedules = Config {
        schedule_interval: Duration::from_secs(1),
        ..test_utils::test_config(&connection_string)
    };

    // two independent instances evaluating the same schedule
    let mut first = Overseer::new(fast_schedules.clone())?;
    first.start().await?;
    let mut second = Overseer::new(fast_schedules)?;
    second.start().await?;

    first
        .schedule("*/2 * * * * *", "heartbeat", json!({}), ScheduleOptions::default())
        .await?;

    tokio::time::sleep(Duration::from_secs(5)).await;

    let pool = PgPool::connect(&connection_string).await?;
    let (total, distinct_instants): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(DISTINCT singleton_on)
         FROM overseer.job WHERE name = 'heartbeat'",
    )
    .fetch_one(&pool)
    .await?;
    assert!(total >= 1, "at least one fire instant should have minted");
    assert_eq!(total, distinct_instants, "an instant was minted twice");

    assert!(first.unschedule("heartbeat").await?);
    assert!(first.get_schedules().await?.is_empty());

    first.stop().await;
    second.stop().await;
    Ok(())
}

#[tokio::test]
async fn cancelled_jobs_are_never_dispatched_again() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::start_queue().await?;

    // cancel straight out of created
    let id = assert_some!(boss.send("doomed", json!({}), SendOptions::default()).await?);
    boss.cancel(id).await?;
    assert!(boss.fetch("doomed", 1).await?.is_empty());
    assert_eq!(boss.get_job(id).await?.unwrap().state, JobState::Cancelled);

    // cancelling a terminal job is a conflict, not a silent success
    assert!(matches!(
        boss.cancel(id).await,
        Err(Error::StateConflict { .. })
    ));

    // cancel while active: the outcome report loses
    let id = assert_some!(boss.send("doomed", json!({}), SendOptions::default()).await?);
    boss.fetch("doomed", 1).await?;
    boss.cancel(id).await?;
    assert!(matches!(
        boss.complete(id, json!({})).await,
        Err(Error::StateConflict { .. })
    ));

    assert!(matches!(
        boss.cancel(Uuid::new_v4()).await,
        Err(Error::JobNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn manual_fail_routes_through_the_retry_policy() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::start_queue().await?;

    let options = SendOptions::default().with_retry_limit(1);
    let id = assert_some!(boss.send("manual", json!({}), options).await?);

    // first failure: one retry remains, so the job requeues
    boss.fetch("manual", 1).await?;
    boss.fail(id, json!({"message": "first failure"})).await?;
    let job = boss.get_job(id).await?.unwrap();
    assert_eq!(job.state, JobState::Created);

    // second failure exhausts the retries
    boss.fetch("manual", 1).await?;
    boss.fail(id, json!({"message": "second failure"})).await?;
    let job = boss.get_job(id).await?.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_compact_json_snapshot!(job.output, @r#"{"message": "second failure"}"#);

    // failing a terminal job is rejected
    assert!(matches!(
        boss.fail(id, json!({})).await,
        Err(Error::StateConflict { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn wake_signals_reach_subscribers() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::start_queue().await?;

    let mut wake = boss.subscribe("pings");
    assert_some!(boss.send("pings", json!({}), SendOptions::default()).await?);

    let wakeup = tokio::time::timeout(Duration::from_secs(5), wake.recv()).await??;
    assert_eq!(wakeup.name, "pings");
    Ok(())
}

#[tokio::test]
async fn worker_records_handler_output() -> anyhow::Result<()> {
    let (mut boss, _pool, _container) = test_utils::start_queue().await?;

    boss.work(
        "email",
        WorkOptions::default().with_team_size(2),
        |job| async move { Ok(json!({"delivered": true, "to": job.data["to"]})) },
    )
    .await?;

    let id = assert_some!(
        boss.send("email", json!({"to": "user@example.com"}), SendOptions::default())
            .await?
    );

    let job = test_utils::wait_for_state(&boss, id, JobState::Completed).await?;
    assert_compact_json_snapshot!(job.output, @r#"{"delivered": true, "to": "user@example.com"}"#);

    boss.stop().await;
    Ok(())
}

#[tokio::test]
async fn off_work_stops_a_single_worker() -> anyhow::Result<()> {
    let (mut boss, _pool, _container) = test_utils::start_queue().await?;

    let worker = boss
        .work("quiet", WorkOptions::default(), |_job| async move {
            Ok(json!({}))
        })
        .await?;

    boss.off_work(worker).await?;
    assert!(matches!(
        boss.off_work(worker).await,
        Err(Error::UnknownWorker(_))
    ));

    // with no worker attached the job just sits there
    let id = assert_some!(boss.send("quiet", json!({}), SendOptions::default()).await?);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(boss.get_job(id).await?.unwrap().state, JobState::Created);

    boss.stop().await;
    Ok(())
}
