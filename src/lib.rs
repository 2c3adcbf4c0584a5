// catbus - cat domain events over a topic exchange
//
// Producers publish cat events; events that cannot be serialized or routed
// land on a dead-letter exchange instead of failing the caller. Consumers
// run one delayed handler per cat and event kind, collapsing bursts.

// Re-export member crates
pub use catbus_config as config;
pub use catbus_events as events;
pub use catbus_log as log;
pub use catbus_messaging as messaging;
pub use catbus_scheduler as scheduler;

pub use catbus_events::{
    CatCreatedEvent, CatDeletedEvent, CatEvent, CatUpdatedEvent, EventKind, OutboundEvent,
};
pub use catbus_messaging::{
    Consumer, ConsumerConfig, DeadLetterReason, MemoryBroker, MessagingError, MessagingResult,
    PublishOutcome, Publisher, RabbitMqSettings, Topology,
};
pub use catbus_scheduler::{DelayScheduler, SchedulerConfig, SchedulerError};

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        CatCreatedEvent, CatDeletedEvent, CatEvent, CatUpdatedEvent, Consumer, ConsumerConfig,
        DeadLetterReason, DelayScheduler, EventKind, MemoryBroker, MessagingError,
        MessagingResult, OutboundEvent, PublishOutcome, Publisher, RabbitMqSettings,
        SchedulerConfig, Topology,
    };
    pub use catbus_messaging::EventPublisher;
}
