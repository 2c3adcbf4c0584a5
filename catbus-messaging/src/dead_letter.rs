//! Dead-letter fallback for events that cannot be delivered normally.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use tracing::{error, warn};

use crate::message::{CONTENT_TYPE_TEXT, OutgoingMessage, PublishConfirm};
use crate::topology::Topology;
use crate::transport::BrokerConnection;

/// Header carrying the diversion reason.
pub const HEADER_ERROR_REASON: &str = "x-error-reason";

/// Header carrying the routing key the event was meant for.
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "original-routing-key";

/// Header carrying the diversion time, RFC 3339.
pub const HEADER_TIMESTAMP: &str = "timestamp";

/// Why an event was sent to the dead-letter exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The event has no serializer
    MissingSerializer,
    /// The serializer failed
    Serialization(String),
    /// Neither the caller nor the event named a routing key
    MissingRoutingKey,
    /// No queue is bound for the routing key
    Unroutable,
    /// The broker refused the publish
    Nacked,
    /// The transport failed mid-publish
    Transport(String),
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::MissingSerializer => f.write_str("missing serializer"),
            DeadLetterReason::Serialization(msg) => write!(f, "serialization error: {}", msg),
            DeadLetterReason::MissingRoutingKey => f.write_str("missing routing key"),
            DeadLetterReason::Unroutable => f.write_str("unroutable"),
            DeadLetterReason::Nacked => f.write_str("nacked"),
            DeadLetterReason::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

/// Publishes failed payloads to the dead-letter exchange.
#[derive(Debug, Clone)]
pub struct DeadLetterSink {
    exchange: String,
    routing_key: String,
}

impl DeadLetterSink {
    /// Create a sink for a topology's dead-letter exchange.
    pub fn new(topology: &Topology) -> Self {
        Self {
            exchange: topology.dead_letter_exchange.clone(),
            routing_key: topology.dead_letter_routing_key.clone(),
        }
    }

    /// Build the dead-letter message for a payload.
    pub fn message(
        &self,
        payload: &str,
        reason: &DeadLetterReason,
        original_routing_key: &str,
    ) -> OutgoingMessage {
        OutgoingMessage::new(&self.exchange, &self.routing_key, payload.as_bytes().to_vec())
            .with_content_type(CONTENT_TYPE_TEXT)
            .header(HEADER_ERROR_REASON, reason.to_string())
            .header(HEADER_ORIGINAL_ROUTING_KEY, original_routing_key)
            .header(
                HEADER_TIMESTAMP,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            )
    }

    /// Publish `payload` verbatim to the dead-letter exchange.
    ///
    /// Failures are logged and swallowed; the return value says whether the
    /// broker accepted the message.
    pub async fn send_to_dead_letter(
        &self,
        conn: &dyn BrokerConnection,
        payload: &str,
        reason: &DeadLetterReason,
        original_routing_key: &str,
    ) -> bool {
        let message = self.message(payload, reason, original_routing_key);

        match conn.publish(&message).await {
            Ok(PublishConfirm::Acked) => {
                warn!(
                    reason = %reason,
                    original_routing_key,
                    dead_letter_exchange = %self.exchange,
                    "Event sent to dead-letter exchange"
                );
                true
            }
            Ok(confirm) => {
                error!(
                    reason = %reason,
                    original_routing_key,
                    confirm = ?confirm,
                    "Dead-letter exchange did not accept the message"
                );
                false
            }
            Err(e) => {
                error!(
                    reason = %reason,
                    original_routing_key,
                    error = %e,
                    "Failed to send to dead-letter exchange"
                );
                false
            }
        }
    }
}
