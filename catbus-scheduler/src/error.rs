//! Error types for the delay scheduler.

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No handler registered under this name
    #[error("No handler registered for: {0}")]
    UnknownHandler(String),

    /// A delayed handler failed
    #[error("Handler failed: {0}")]
    Handler(String),

    /// The job store could not be read or written
    #[error("Job store error: {0}")]
    Store(String),

    /// Job arguments could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Scheduler not running
    #[error("Scheduler not running")]
    NotRunning,

    /// Scheduler already running
    #[error("Scheduler already running")]
    AlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<catbus_config::ConfigError> for SchedulerError {
    fn from(err: catbus_config::ConfigError) -> Self {
        SchedulerError::Config(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for SchedulerError {
    fn from(err: redis::RedisError) -> Self {
        SchedulerError::Store(err.to_string())
    }
}
