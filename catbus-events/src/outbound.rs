//! The producer-facing view of an event.

use crate::error::EventResult;
use serde_json::{Map, Value};
use std::fmt::Debug;

/// Anything a publisher can send.
///
/// Producers hand the publisher a `&dyn OutboundEvent`. The defaults describe
/// an event that knows neither its routing key nor how to serialize itself;
/// the publisher dead-letters such events instead of failing the caller.
pub trait OutboundEvent: Debug + Send + Sync {
    /// Name of the event type, used in logs and dead-letter metadata.
    fn type_name(&self) -> &str;

    /// Routing key for this event, if it has a fixed one.
    fn routing_key(&self) -> Option<&str> {
        None
    }

    /// Build the flat JSON envelope. `None` means the event has no
    /// serializer at all.
    fn to_envelope(&self) -> Option<EventResult<Map<String, Value>>> {
        None
    }
}
