use uuid::Uuid;

/// Configuration problems detected by [`Overseer::new`](crate::Overseer::new),
/// before any connection attempt is made.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Schema names are capped at 50 characters.
    #[error("schema name {0:?} is longer than 50 characters")]
    SchemaNameTooLong(String),

    /// Schema names must be plain lowercase identifiers, since they are
    /// interpolated into SQL statements.
    #[error("schema name {0:?} must match [a-z_][a-z0-9_]*")]
    InvalidSchemaName(String),

    /// `pool_size` and `max` are two names for the same setting and must agree
    /// when both are supplied.
    #[error("conflicting pool sizes: pool_size = {pool_size}, max = {max}")]
    PoolSizeConflict {
        /// Value supplied as `pool_size`.
        pool_size: u32,
        /// Value supplied as `max`.
        max: u32,
    },

    /// Neither a connection string nor a host was configured.
    #[error("no connection string or host configured")]
    MissingConnection,
}

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration is invalid. Raised synchronously by
    /// [`Overseer::new`](crate::Overseer::new).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The store lacks a capability the queue depends on. Raised by
    /// [`Overseer::start`](crate::Overseer::start).
    #[error("store is missing a required capability: {0}")]
    MissingCapability(String),

    /// The store rejected or dropped the operation. Callers driving their own
    /// loop should back off and retry rather than crash.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Another actor mutated the job first, or the job is not in a state that
    /// permits the requested transition.
    #[error("job {id} was not in an eligible state for this transition")]
    StateConflict {
        /// The job whose transition was rejected.
        id: Uuid,
    },

    /// No job with this identifier exists (it may have been purged).
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// The operation requires [`Overseer::start`](crate::Overseer::start) to
    /// have completed.
    #[error("queue has not been started")]
    NotStarted,

    /// No running worker with this identifier.
    #[error("unknown worker {0}")]
    UnknownWorker(Uuid),

    /// The cron expression could not be parsed.
    #[error("invalid cron expression {0:?}")]
    InvalidCron(String),

    /// The timezone name is not a known IANA identifier.
    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),
}

/// Shorthand for results produced by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
