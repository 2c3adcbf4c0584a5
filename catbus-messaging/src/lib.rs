//! # catbus messaging
//!
//! Event publishing and delayed consumption over a topic exchange.
//!
//! - [`Publisher`] sends cat events to the primary exchange and diverts
//!   anything it cannot serialize or route to the dead-letter exchange.
//! - [`Consumer`] turns each event on the primary queue into a delayed job
//!   and drains the dead-letter queue.
//! - [`MemoryBroker`] is an in-process broker with the same semantics, used
//!   by tests and demo mode.
//!
//! ## Features
//!
//! - `rabbitmq` (default) - RabbitMQ transport via lapin
//! - `redis` - durable scheduler store
//!
//! ## Example
//!
//! ```no_run
//! use catbus_messaging::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> MessagingResult<()> {
//! let settings = RabbitMqSettings::from_env()?;
//! let scheduler = Arc::new(DelayScheduler::new(SchedulerConfig::default()));
//!
//! let consumer = Consumer::rabbitmq(&settings, scheduler.clone(), ConsumerConfig::from_env()?);
//! scheduler.start().await?;
//! consumer.start().await?;
//!
//! let publisher = Publisher::rabbitmq(&settings);
//! publisher
//!     .publish(&CatCreatedEvent::new(42, "Tom", 3, "grey", "Siamese", None), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod memory;
pub mod message;
pub mod publisher;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;
pub mod topology;
pub mod transport;

pub use config::{ConsumerConfig, RabbitMqSettings};
pub use consumer::{Consumer, Disposition, EventHandler, handle_dead_letter, handle_primary};
pub use dead_letter::{DeadLetterReason, DeadLetterSink};
pub use error::{MessagingError, MessagingResult};
pub use memory::{MemoryBroker, PublishFailure, StoredMessage};
pub use message::{Acker, Delivery, OutgoingMessage, PublishConfirm};
pub use publisher::{EventPublisher, PublishOutcome, Publisher};
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::{RabbitMqConnection, RabbitMqConnector};
pub use topology::{Topology, TopologyManager};
pub use transport::{
    BrokerConnection, BrokerConnector, DeadLetterTarget, DeliveryStream, ExchangeSpec, QueueSpec,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConsumerConfig, RabbitMqSettings};
    pub use crate::consumer::Consumer;
    pub use crate::dead_letter::DeadLetterReason;
    pub use crate::error::{MessagingError, MessagingResult};
    pub use crate::memory::MemoryBroker;
    pub use crate::publisher::{EventPublisher, PublishOutcome, Publisher};
    pub use crate::topology::Topology;
    pub use catbus_events::{
        CatCreatedEvent, CatDeletedEvent, CatEvent, CatUpdatedEvent, EventKind, OutboundEvent,
    };
    pub use catbus_scheduler::{DelayScheduler, SchedulerConfig};
}
