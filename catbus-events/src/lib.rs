//! Cat domain events for catbus
//!
//! This crate defines the events that producers publish and consumers
//! reconstruct, plus the flat JSON envelope they travel in.
//!
//! ## Quick Start
//!
//! ```
//! use catbus_events::{CatCreatedEvent, CatEvent, EventKind};
//!
//! let event = CatEvent::from(CatCreatedEvent::new(42, "Tom", 3, "grey", "Siamese", Some(1)));
//!
//! assert_eq!(event.kind().routing_key(), "cat.created");
//! assert_eq!(event.job_id(), "cat_created_delay_42");
//!
//! let bytes = event.to_json().unwrap();
//! assert_eq!(CatEvent::from_slice(&bytes).unwrap(), event);
//! ```

pub mod error;
pub mod event;
pub mod kind;
pub mod outbound;
pub mod timestamp;

pub use error::{EventError, EventResult};
pub use event::{CatCreatedEvent, CatDeletedEvent, CatEvent, CatUpdatedEvent, envelope};
pub use kind::EventKind;
pub use outbound::OutboundEvent;
