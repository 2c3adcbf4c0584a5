//! Error types for the catbus CLI.

use thiserror::Error;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] catbus_config::ConfigError),

    /// Broker or consumer failure
    #[error("Messaging error: {0}")]
    Messaging(#[from] catbus_messaging::MessagingError),

    /// Scheduler failure
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] catbus_scheduler::SchedulerError),

    /// Signal handling failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The publish went to the dead-letter exchange
    #[error("Event was dead-lettered: {0}")]
    DeadLettered(String),
}
