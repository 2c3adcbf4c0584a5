//! Exchange, queue and binding declarations.

use tracing::{debug, error, info};

use crate::config::RabbitMqSettings;
use crate::error::{MessagingError, MessagingResult};
use crate::transport::{BrokerConnection, ExchangeSpec, QueueSpec};

/// Names of everything the publisher and consumer rely on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Primary topic exchange
    pub exchange: String,
    /// Primary queue
    pub queue: String,
    /// Routing key the primary queue is bound under
    pub routing_key: String,
    /// Dead-letter topic exchange
    pub dead_letter_exchange: String,
    /// Dead-letter queue
    pub dead_letter_queue: String,
    /// Routing key for dead-lettered messages
    pub dead_letter_routing_key: String,
}

impl Topology {
    /// Derive the topology from broker settings.
    pub fn from_settings(settings: &RabbitMqSettings) -> Self {
        Self {
            exchange: settings.exchange_name.clone(),
            queue: settings.queue_name.clone(),
            routing_key: settings.routing_key.clone(),
            dead_letter_exchange: settings.dead_letter_exchange(),
            dead_letter_queue: settings.dead_letter_queue(),
            dead_letter_routing_key: settings.dead_letter_routing_key(),
        }
    }

    /// Primary queue declaration, dead-lettering into the DLX.
    pub fn primary_queue(&self) -> QueueSpec {
        QueueSpec::durable(&self.queue)
            .with_dead_letter(&self.dead_letter_exchange, &self.dead_letter_routing_key)
    }

    /// Dead-letter queue declaration.
    pub fn dead_letter_queue_spec(&self) -> QueueSpec {
        QueueSpec::durable(&self.dead_letter_queue)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_settings(&RabbitMqSettings::default())
    }
}

/// Declares the topology on a connection.
#[derive(Debug, Clone)]
pub struct TopologyManager {
    topology: Topology,
}

impl TopologyManager {
    /// Create a manager for a topology.
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    /// Get the topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declare exchanges, queues and bindings.
    ///
    /// Every declaration is idempotent, so this runs on each new connection.
    /// A declaration the broker refuses while the connection stays up is a
    /// [`MessagingError::Topology`] and must not be retried; losing the
    /// connection midway is a [`MessagingError::Connection`].
    pub async fn ensure_topology(&self, conn: &dyn BrokerConnection) -> MessagingResult<()> {
        let t = &self.topology;
        debug!(exchange = %t.exchange, queue = %t.queue, "Declaring topology");

        conn.declare_exchange(&ExchangeSpec::topic(&t.exchange))
            .await
            .map_err(|e| classify(conn, "primary exchange", e))?;

        conn.declare_queue(&t.primary_queue())
            .await
            .map_err(|e| classify(conn, "primary queue", e))?;

        conn.bind_queue(&t.queue, &t.exchange, &t.routing_key)
            .await
            .map_err(|e| classify(conn, "primary binding", e))?;

        conn.declare_exchange(&ExchangeSpec::topic(&t.dead_letter_exchange))
            .await
            .map_err(|e| classify(conn, "dead-letter exchange", e))?;

        conn.declare_queue(&t.dead_letter_queue_spec())
            .await
            .map_err(|e| classify(conn, "dead-letter queue", e))?;

        conn.bind_queue(
            &t.dead_letter_queue,
            &t.dead_letter_exchange,
            &t.dead_letter_routing_key,
        )
        .await
        .map_err(|e| classify(conn, "dead-letter binding", e))?;

        info!(
            exchange = %t.exchange,
            queue = %t.queue,
            routing_key = %t.routing_key,
            dead_letter_exchange = %t.dead_letter_exchange,
            dead_letter_queue = %t.dead_letter_queue,
            "Topology declared"
        );
        Ok(())
    }
}

fn classify(conn: &dyn BrokerConnection, step: &str, err: MessagingError) -> MessagingError {
    if err.is_connection_error() || !conn.is_open() {
        error!(step, error = %err, "Connection lost while declaring topology");
        MessagingError::Connection(format!("{}: {}", step, err))
    } else {
        error!(step, error = %err, "Topology declaration rejected");
        MessagingError::Topology(format!("{}: {}", step, err))
    }
}
