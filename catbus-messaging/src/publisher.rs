//! Event publisher with dead-letter fallback.

use std::sync::Arc;

use async_trait::async_trait;
use catbus_events::OutboundEvent;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::dead_letter::{DeadLetterReason, DeadLetterSink};
use crate::error::{MessagingError, MessagingResult};
use crate::message::{OutgoingMessage, PublishConfirm, preview};
use crate::topology::{Topology, TopologyManager};
use crate::transport::{BrokerConnection, BrokerConnector};

/// Characters of payload included in publish logs.
pub const PREVIEW_CHARS: usize = 256;

/// What happened to a published event.
///
/// Transport faults are not an outcome; `publish` returns them as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker confirmed delivery to at least one queue
    Delivered,
    /// The event went to the dead-letter exchange instead
    DeadLettered(DeadLetterReason),
}

impl PublishOutcome {
    /// Check if the event reached the primary exchange.
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered)
    }
}

/// What producing services depend on to emit events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Open the connection and declare the topology.
    async fn connect(&self) -> MessagingResult<()>;

    /// Publish an event. `routing_key` overrides the event's own key.
    async fn publish(
        &self,
        event: &dyn OutboundEvent,
        routing_key: Option<&str>,
    ) -> MessagingResult<PublishOutcome>;

    /// Close the connection.
    async fn disconnect(&self) -> MessagingResult<()>;
}

/// Publishes events to the primary exchange.
///
/// The publisher owns one connection, opened lazily and reopened after a
/// transport fault. Events that cannot be serialized or routed go to the
/// dead-letter exchange and `publish` still succeeds.
///
/// # Examples
///
/// ```no_run
/// use catbus_events::CatCreatedEvent;
/// use catbus_messaging::*;
///
/// # async fn example() -> MessagingResult<()> {
/// let settings = RabbitMqSettings::from_env()?;
/// let publisher = Publisher::rabbitmq(&settings);
///
/// let event = CatCreatedEvent::new(42, "Tom", 3, "grey", "Siamese", None);
/// let outcome = publisher.publish(&event, None).await?;
/// assert!(outcome.is_delivered());
/// # Ok(())
/// # }
/// ```
pub struct Publisher {
    connector: Arc<dyn BrokerConnector>,
    topology: TopologyManager,
    sink: DeadLetterSink,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl Publisher {
    /// Create a publisher over any broker.
    pub fn new(connector: Arc<dyn BrokerConnector>, topology: Topology) -> Self {
        Self {
            connector,
            sink: DeadLetterSink::new(&topology),
            topology: TopologyManager::new(topology),
            connection: Mutex::new(None),
        }
    }

    /// Create a publisher for RabbitMQ.
    #[cfg(feature = "rabbitmq")]
    pub fn rabbitmq(settings: &crate::config::RabbitMqSettings) -> Self {
        Self::new(
            Arc::new(crate::rabbitmq::RabbitMqConnector::new(settings.clone())),
            Topology::from_settings(settings),
        )
    }

    /// Get the topology.
    pub fn topology(&self) -> &Topology {
        self.topology.topology()
    }

    /// Check if a usable connection is cached.
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_open())
    }

    /// Open the connection and declare the topology if not already done.
    pub async fn connect(&self) -> MessagingResult<()> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        let mut cached = self.connection.lock().await;

        if let Some(conn) = cached.as_ref() {
            if conn.is_open() {
                return Ok(conn.clone());
            }
            warn!("Publisher connection closed, reconnecting");
        }
        *cached = None;

        let conn = self.connector.connect().await.map_err(|e| {
            error!(broker = %self.connector.describe(), error = %e, "Publisher failed to connect");
            match e {
                MessagingError::Connection(_) => e,
                other => MessagingError::Connection(other.to_string()),
            }
        })?;

        if let Err(e) = self.topology.ensure_topology(conn.as_ref()).await {
            if let Err(close_err) = conn.close().await {
                debug!(error = %close_err, "Error closing publisher connection after topology failure");
            }
            return Err(e);
        }

        info!(broker = %self.connector.describe(), "Publisher connected");
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Error closing broken publisher connection");
            }
        }
    }

    /// Publish an event.
    ///
    /// Returns `DeadLettered` when the event had no serializer, failed to
    /// serialize, had no routing key, was unroutable, or was nacked. Returns
    /// `Err(Connection)` when the broker cannot be reached and `Err(Publish)`
    /// on any other transport fault; the event is dead-lettered best-effort
    /// in that case too.
    pub async fn publish(
        &self,
        event: &dyn OutboundEvent,
        routing_key: Option<&str>,
    ) -> MessagingResult<PublishOutcome> {
        let conn = self.connection().await?;
        let event_kind = event.type_name();
        let intended_key = routing_key.or(event.routing_key()).unwrap_or_default();

        let envelope = match event.to_envelope() {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => {
                let reason = DeadLetterReason::Serialization(e.to_string());
                return Ok(self
                    .divert(conn.as_ref(), &format!("{:?}", event), reason, intended_key, event_kind)
                    .await);
            }
            None => {
                return Ok(self
                    .divert(
                        conn.as_ref(),
                        &format!("{:?}", event),
                        DeadLetterReason::MissingSerializer,
                        intended_key,
                        event_kind,
                    )
                    .await);
            }
        };

        let payload = match serde_json::to_string(&Value::Object(envelope)) {
            Ok(payload) => payload,
            Err(e) => {
                let reason = DeadLetterReason::Serialization(e.to_string());
                return Ok(self
                    .divert(conn.as_ref(), &format!("{:?}", event), reason, intended_key, event_kind)
                    .await);
            }
        };

        let Some(routing_key) = routing_key.or(event.routing_key()) else {
            return Ok(self
                .divert(
                    conn.as_ref(),
                    &payload,
                    DeadLetterReason::MissingRoutingKey,
                    "",
                    event_kind,
                )
                .await);
        };

        let message = OutgoingMessage::new(
            &self.topology.topology().exchange,
            routing_key,
            payload.as_bytes().to_vec(),
        )
        .mandatory(true);

        match conn.publish(&message).await {
            Ok(PublishConfirm::Acked) => {
                info!(
                    routing_key,
                    event_kind,
                    payload = %preview(&payload, PREVIEW_CHARS),
                    "Event published"
                );
                Ok(PublishOutcome::Delivered)
            }
            Ok(PublishConfirm::Returned) => Ok(self
                .divert(
                    conn.as_ref(),
                    &payload,
                    DeadLetterReason::Unroutable,
                    routing_key,
                    event_kind,
                )
                .await),
            Ok(PublishConfirm::Nacked) => Ok(self
                .divert(
                    conn.as_ref(),
                    &payload,
                    DeadLetterReason::Nacked,
                    routing_key,
                    event_kind,
                )
                .await),
            Err(e) => {
                error!(routing_key, event_kind, error = %e, "Publish failed");
                self.divert(
                    conn.as_ref(),
                    &payload,
                    DeadLetterReason::Transport(e.to_string()),
                    routing_key,
                    event_kind,
                )
                .await;
                self.drop_connection().await;
                Err(MessagingError::Publish(e.to_string()))
            }
        }
    }

    async fn divert(
        &self,
        conn: &dyn BrokerConnection,
        payload: &str,
        reason: DeadLetterReason,
        routing_key: &str,
        event_kind: &str,
    ) -> PublishOutcome {
        warn!(
            routing_key,
            event_kind,
            reason = %reason,
            payload = %preview(payload, PREVIEW_CHARS),
            "Diverting event to dead-letter exchange"
        );
        self.sink
            .send_to_dead_letter(conn, payload, &reason, routing_key)
            .await;
        PublishOutcome::DeadLettered(reason)
    }

    /// Send an arbitrary payload to the dead-letter exchange.
    ///
    /// Never fails; problems are logged.
    pub async fn send_to_dead_letter(
        &self,
        payload: &str,
        reason: &DeadLetterReason,
        original_routing_key: &str,
    ) {
        match self.connection().await {
            Ok(conn) => {
                self.sink
                    .send_to_dead_letter(conn.as_ref(), payload, reason, original_routing_key)
                    .await;
            }
            Err(e) => error!(
                reason = %reason,
                original_routing_key,
                error = %e,
                "Cannot reach broker for dead-letter message"
            ),
        }
    }

    /// Close the connection. Idempotent.
    pub async fn disconnect(&self) -> MessagingResult<()> {
        let Some(conn) = self.connection.lock().await.take() else {
            return Ok(());
        };

        conn.close().await?;
        info!("Publisher disconnected");
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for Publisher {
    async fn connect(&self) -> MessagingResult<()> {
        Publisher::connect(self).await
    }

    async fn publish(
        &self,
        event: &dyn OutboundEvent,
        routing_key: Option<&str>,
    ) -> MessagingResult<PublishOutcome> {
        Publisher::publish(self, event, routing_key).await
    }

    async fn disconnect(&self) -> MessagingResult<()> {
        Publisher::disconnect(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    #[derive(Debug)]
    struct Opaque;

    impl OutboundEvent for Opaque {
        fn type_name(&self) -> &str {
            "OpaqueEvent"
        }
    }

    fn publisher(broker: &MemoryBroker) -> Publisher {
        Publisher::new(Arc::new(broker.clone()), Topology::default())
    }

    #[test]
    fn test_outcome() {
        assert!(PublishOutcome::Delivered.is_delivered());
        assert!(!PublishOutcome::DeadLettered(DeadLetterReason::Unroutable).is_delivered());
    }

    #[tokio::test]
    async fn test_connect_declares_topology_once() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        publisher.connect().await.unwrap();
        publisher.connect().await.unwrap();

        assert!(publisher.is_connected().await);
        assert_eq!(broker.connections_opened(), 1);
        assert!(broker.has_exchange("cats_events"));
        assert!(broker.has_exchange("dlx.cats.events"));
    }

    #[tokio::test]
    async fn test_missing_serializer_is_dead_lettered() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let outcome = publisher.publish(&Opaque, Some("cat.created")).await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::DeadLettered(DeadLetterReason::MissingSerializer)
        );

        let dead = broker.drain("dlq.cat_created_queue");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body_text(), "Opaque");
        assert_eq!(dead[0].headers["x-error-reason"], "missing serializer");
        assert_eq!(dead[0].headers["original-routing-key"], "cat.created");
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let broker = MemoryBroker::new();
        broker.set_unreachable(true);

        let result = publisher(&broker).publish(&Opaque, None).await;
        assert!(matches!(result, Err(MessagingError::Connection(_))));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        publisher.disconnect().await.unwrap();
        publisher.connect().await.unwrap();
        publisher.disconnect().await.unwrap();
        assert!(!publisher.is_connected().await);
    }
}
