//! Error types for messaging operations

use thiserror::Error;

/// Result type for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Errors that can occur during messaging operations
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Failed to connect to the broker, or the connection dropped
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A declaration conflicts with what the broker already has
    #[error("Topology declaration failed: {0}")]
    Topology(String),

    /// Failed to serialize a message
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The broker returned a mandatory message as unroutable
    #[error("Message unroutable: {0}")]
    Unroutable(String),

    /// Unexpected transport fault while publishing
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Failed to start consuming a queue
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Failed to acknowledge or reject a delivery
    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Channel/connection is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The consumer is already running
    #[error("Consumer already running")]
    AlreadyRunning,

    /// The consumer is not running
    #[error("Consumer not running")]
    NotRunning,

    /// The delay scheduler refused a job
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] catbus_scheduler::SchedulerError),

    /// Internal broker error
    #[error("Broker error: {0}")]
    Broker(String),
}

impl MessagingError {
    /// Check if this error indicates a connection issue
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_)
                | MessagingError::ChannelClosed(_)
                | MessagingError::Timeout(_)
        )
    }
}

impl From<catbus_config::ConfigError> for MessagingError {
    fn from(err: catbus_config::ConfigError) -> Self {
        MessagingError::Configuration(err.to_string())
    }
}

#[cfg(feature = "rabbitmq")]
impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        // Connection state is judged by the caller from the connection
        // status, so every lapin error starts out as a broker error.
        MessagingError::Broker(err.to_string())
    }
}
