use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::JobDefaults;
use crate::errors::Error;
use crate::notify::Notifier;
use crate::schema::SendOptions;
use crate::storage::{NewJob, Storage};

/// Parse a cron expression. Standard five-field expressions are accepted by
/// prepending a seconds field of `0`.
pub(crate) fn parse_cron(expr: &str) -> Result<cron::Schedule, Error> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_owned()
    };
    cron::Schedule::from_str(&normalized).map_err(|_| Error::InvalidCron(expr.to_owned()))
}

/// Parse an IANA timezone name.
pub(crate) fn parse_timezone(timezone: &str) -> Result<Tz, Error> {
    timezone
        .parse()
        .map_err(|_| Error::InvalidTimezone(timezone.to_owned()))
}

/// The first fire instant strictly after `after`, evaluated in `tz`.
pub(crate) fn next_fire(
    schedule: &cron::Schedule,
    tz: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|fire| fire.with_timezone(&Utc))
}

/// Given the stored next fire time, decide what (if anything) is due at `now`.
///
/// Returns the fire instant to emit and the new stored next fire time. When
/// several instants have passed (the process was down), only the most recent
/// one is emitted; missed instants are skipped, deliberately never backfilled,
/// so downtime does not turn into a catch-up herd.
pub(crate) fn due_fire(
    schedule: &cron::Schedule,
    tz: Tz,
    stored_next: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    if stored_next > now {
        return None;
    }
    let mut fire = stored_next;
    for upcoming in schedule.after(&stored_next.with_timezone(&tz)) {
        let upcoming = upcoming.with_timezone(&Utc);
        if upcoming <= now {
            fire = upcoming;
        } else {
            return Some((fire, upcoming));
        }
    }
    None
}

/// Evaluates recurring schedules and mints jobs at due fire instants.
///
/// Safe to run from any number of processes: the minted job carries the fire
/// instant as its `singleton_on` slot, so a duplicate insert for the same
/// instant is deduplicated by the store rather than treated as an error.
pub(crate) struct Scheduler {
    storage: Arc<Storage>,
    notifier: Arc<Notifier>,
    defaults: JobDefaults,
    interval: Duration,
}

impl Scheduler {
    pub(crate) fn new(
        storage: Arc<Storage>,
        notifier: Arc<Notifier>,
        defaults: JobDefaults,
        interval: Duration,
    ) -> Self {
        Self {
            storage,
            notifier,
            defaults,
            interval,
        }
    }

    pub(crate) async fn run(&self, shutdown: CancellationToken) {
        info!("Scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.tick(Utc::now()).await {
                        error!(%error, "Failed to evaluate schedules");
                    }
                }
            }
        }
    }

    /// Evaluate every due schedule once.
    pub(crate) async fn tick(&self, now: DateTime<Utc>) -> sqlx::Result<()> {
        for schedule in self.storage.due_schedules(now).await? {
            let parsed = match parse_cron(&schedule.cron) {
                Ok(parsed) => parsed,
                Err(error) => {
                    error!(schedule.name = %schedule.name, %error, "Skipping unparsable schedule");
                    continue;
                }
            };
            let tz = match parse_timezone(&schedule.timezone) {
                Ok(tz) => tz,
                Err(error) => {
                    error!(schedule.name = %schedule.name, %error, "Skipping unparsable schedule");
                    continue;
                }
            };
            let Some((fire, next)) = due_fire(&parsed, tz, schedule.next_fire_on, now) else {
                continue;
            };

            let options: SendOptions =
                serde_json::from_value(schedule.options.clone()).unwrap_or_default();
            let mut job = NewJob::resolve(&schedule.name, schedule.data.clone(), &options, &self.defaults);
            job.singleton_on = Some(fire);

            match self.storage.insert_job(&job).await? {
                Some(id) => {
                    debug!(schedule.name = %schedule.name, job.id = %id, fire = %fire, "Minted scheduled job");
                    self.notifier.publish(self.storage.pool(), &schedule.name).await;
                }
                None => {
                    debug!(schedule.name = %schedule.name, fire = %fire, "Fire instant already minted elsewhere");
                }
            }

            if !self
                .storage
                .advance_schedule(&schedule.name, schedule.next_fire_on, next)
                .await?
            {
                debug!(schedule.name = %schedule.name, "Schedule advanced by another process");
            }
        }
        Ok(())
    }
}
