//! Outgoing messages and received deliveries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{MessagingError, MessagingResult};

/// Content type of primary event envelopes.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type of dead-letter payloads.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// A message ready to hand to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Unique message ID
    pub id: String,
    /// Target exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Message body
    pub body: Vec<u8>,
    /// Content type
    pub content_type: String,
    /// Persistent delivery mode (2)
    pub persistent: bool,
    /// Ask the broker to return the message if no queue takes it
    pub mandatory: bool,
    /// String headers
    pub headers: BTreeMap<String, String>,
}

impl OutgoingMessage {
    /// Create a persistent, non-mandatory message.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            mandatory: false,
            headers: BTreeMap::new(),
        }
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the mandatory flag.
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// Set a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// How the broker settled a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirm {
    /// Accepted and routed
    Acked,
    /// Returned as unroutable (mandatory publishes only)
    Returned,
    /// Refused by the broker
    Nacked,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Acknowledge the delivery.
    async fn ack(&self) -> MessagingResult<()>;

    /// Reject the delivery. Without requeue the broker dead-letters it when
    /// the queue has a dead-letter exchange.
    async fn reject(&self, requeue: bool) -> MessagingResult<()>;
}

/// A message received from a queue.
pub struct Delivery {
    /// Message body
    pub body: Vec<u8>,
    /// Routing key it was published under
    pub routing_key: String,
    /// String headers
    pub headers: BTreeMap<String, String>,
    /// Whether the broker delivered it before
    pub redelivered: bool,
    acker: Box<dyn Acker>,
    settled: AtomicBool,
}

impl Delivery {
    /// Create a delivery settled through `acker`.
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        headers: BTreeMap<String, String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            headers,
            redelivered,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    /// Get a header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Body as text, with invalid UTF-8 replaced.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Acknowledge the delivery.
    pub async fn ack(&self) -> MessagingResult<()> {
        self.settle()?;
        self.acker.ack().await
    }

    /// Reject the delivery.
    pub async fn reject(&self, requeue: bool) -> MessagingResult<()> {
        self.settle()?;
        self.acker.reject(requeue).await
    }

    fn settle(&self) -> MessagingResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::Acknowledge(
                "delivery already settled".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// First `max_chars` characters of a payload, for logs.
pub fn preview(payload: &str, max_chars: usize) -> String {
    match payload.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &payload[..end]),
        None => payload.to_string(),
    }
}
