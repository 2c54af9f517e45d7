#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod config;
mod errors;
mod notify;
mod overseer;
mod registry;
mod retry;
mod scheduler;
/// Database row types and per-call options.
pub mod schema;
mod states;
mod storage;
mod sweeper;
mod util;
mod worker;

/// Queue configuration, validated before any connection attempt.
pub use self::config::Config;
/// Error types for configuration and queue operations.
pub use self::errors::{ConfigError, Error, Result};
/// Wake signal delivered to subscribers.
pub use self::notify::Wakeup;
/// The queue instance type.
pub use self::overseer::Overseer;
/// Retry policy primitives.
pub use self::retry::{RetryBackoff, RetryDecision, RetryPolicy};
/// Row types and per-call options, re-exported for convenience.
pub use self::schema::{ArchivedJob, Job, Schedule, ScheduleOptions, SendOptions, WorkOptions};
/// Job lifecycle states.
pub use self::states::JobState;
