//! Broker transport seam.
//!
//! The publisher and consumer talk to the broker only through these traits,
//! so the same logic runs against RabbitMQ and against the in-process
//! broker.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::MessagingResult;
use crate::message::{Delivery, OutgoingMessage, PublishConfirm};

/// A stream of deliveries from one queue.
pub type DeliveryStream = BoxStream<'static, MessagingResult<Delivery>>;

/// A durable topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name
    pub name: String,
    /// Survives broker restart
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// Where a queue sends the messages it rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    /// `x-dead-letter-exchange`
    pub exchange: String,
    /// `x-dead-letter-routing-key`
    pub routing_key: String,
}

/// A queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survives broker restart
    pub durable: bool,
    /// Dead-letter arguments
    pub dead_letter: Option<DeadLetterTarget>,
}

impl QueueSpec {
    /// Durable queue without dead-letter arguments.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: None,
        }
    }

    /// Add dead-letter arguments.
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }
}

/// Opens broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerConnection>>;

    /// Where this connector points, safe for logs.
    fn describe(&self) -> String;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Declare an exchange.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> MessagingResult<()>;

    /// Declare a queue.
    async fn declare_queue(&self, spec: &QueueSpec) -> MessagingResult<()>;

    /// Bind a queue to an exchange.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()>;

    /// Publish and wait for the broker's confirmation.
    async fn publish(&self, message: &OutgoingMessage) -> MessagingResult<PublishConfirm>;

    /// Start consuming a queue with manual acknowledgement.
    async fn consume(&self, queue: &str, prefetch: u16) -> MessagingResult<DeliveryStream>;

    /// Close the connection gracefully.
    async fn close(&self) -> MessagingResult<()>;
}
