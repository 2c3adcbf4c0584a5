//! Error types for event encoding and decoding

use thiserror::Error;

/// Result type for event operations.
pub type EventResult<T> = Result<T, EventError>;

/// Errors raised while turning events into envelopes and back.
#[derive(Error, Debug)]
pub enum EventError {
    /// The event could not be turned into JSON
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The payload is not a valid event envelope
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// The envelope carries no `event_type`
    #[error("Envelope has no event_type field")]
    MissingEventType,

    /// The envelope carries an `event_type` this crate does not know
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}
