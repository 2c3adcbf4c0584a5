//! Event kinds and their fixed wire names.

use crate::error::EventError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of cat events that travel over the broker.
///
/// Routing keys, type names and job ids are spelled out per kind; none of
/// them are computed from Rust identifiers, so renaming a type cannot change
/// the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CatCreated,
    CatUpdated,
    CatDeleted,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 3] = [
        EventKind::CatCreated,
        EventKind::CatUpdated,
        EventKind::CatDeleted,
    ];

    /// Routing key, also used as the `event_type` discriminator.
    pub fn routing_key(self) -> &'static str {
        match self {
            EventKind::CatCreated => "cat.created",
            EventKind::CatUpdated => "cat.updated",
            EventKind::CatDeleted => "cat.deleted",
        }
    }

    /// Name of the producing event type.
    pub fn type_name(self) -> &'static str {
        match self {
            EventKind::CatCreated => "CatCreatedEvent",
            EventKind::CatUpdated => "CatUpdatedEvent",
            EventKind::CatDeleted => "CatDeletedEvent",
        }
    }

    /// Name under which the delayed handler for this kind is registered.
    pub fn handler_name(self) -> &'static str {
        match self {
            EventKind::CatCreated => "cat_created_handler",
            EventKind::CatUpdated => "cat_updated_handler",
            EventKind::CatDeleted => "cat_deleted_handler",
        }
    }

    fn job_prefix(self) -> &'static str {
        match self {
            EventKind::CatCreated => "cat_created",
            EventKind::CatUpdated => "cat_updated",
            EventKind::CatDeleted => "cat_deleted",
        }
    }

    /// Deterministic id of the delayed job for a subject, e.g.
    /// `cat_created_delay_42`.
    pub fn job_id(self, subject_id: i64) -> String {
        format!("{}_delay_{}", self.job_prefix(), subject_id)
    }

    /// Look up a kind by its `event_type` / routing key.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.routing_key() == event_type)
    }

    /// Look up a kind by the producing type's name.
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.type_name() == type_name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_event_type(s).ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}
