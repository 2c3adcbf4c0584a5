//! Cat domain events and their JSON envelope.
//!
//! An envelope is a flat JSON object: the `event_type` discriminator, the
//! event's own fields, and a `timestamp` stamped when the envelope is built.
//!
//! ```json
//! {"event_type": "cat.created", "cat_id": 42, "name": "Tom", "age": 3,
//!  "color": "grey", "breed": "Siamese", "breed_id": 1,
//!  "created_at": "2026-01-01T10:00:00Z", "timestamp": "2026-01-01T10:00:00.2Z"}
//! ```

use crate::error::{EventError, EventResult};
use crate::kind::EventKind;
use crate::outbound::OutboundEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A cat was registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatCreatedEvent {
    pub cat_id: i64,
    pub name: String,
    pub age: u32,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub breed: String,
    pub breed_id: Option<i64>,
    #[serde(with = "crate::timestamp")]
    pub created_at: DateTime<Utc>,
}

impl CatCreatedEvent {
    /// Create the event, stamped with the current time.
    pub fn new(
        cat_id: i64,
        name: impl Into<String>,
        age: u32,
        color: impl Into<String>,
        breed: impl Into<String>,
        breed_id: Option<i64>,
    ) -> Self {
        Self {
            cat_id,
            name: name.into(),
            age,
            color: color.into(),
            breed: breed.into(),
            breed_id,
            created_at: Utc::now(),
        }
    }
}

/// A cat's attributes changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatUpdatedEvent {
    pub cat_id: i64,
    pub name: String,
    pub age: u32,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub breed: String,
    pub breed_id: Option<i64>,
    #[serde(with = "crate::timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl CatUpdatedEvent {
    /// Create the event, stamped with the current time.
    pub fn new(
        cat_id: i64,
        name: impl Into<String>,
        age: u32,
        color: impl Into<String>,
        breed: impl Into<String>,
        breed_id: Option<i64>,
    ) -> Self {
        Self {
            cat_id,
            name: name.into(),
            age,
            color: color.into(),
            breed: breed.into(),
            breed_id,
            updated_at: Utc::now(),
        }
    }
}

/// A cat was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatDeletedEvent {
    pub cat_id: i64,
    #[serde(with = "crate::timestamp")]
    pub deleted_at: DateTime<Utc>,
}

impl CatDeletedEvent {
    /// Create the event, stamped with the current time.
    pub fn new(cat_id: i64) -> Self {
        Self {
            cat_id,
            deleted_at: Utc::now(),
        }
    }
}

/// Any cat event, as reconstructed by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatEvent {
    Created(CatCreatedEvent),
    Updated(CatUpdatedEvent),
    Deleted(CatDeletedEvent),
}

impl CatEvent {
    /// The event's kind.
    pub fn kind(&self) -> EventKind {
        match self {
            CatEvent::Created(_) => EventKind::CatCreated,
            CatEvent::Updated(_) => EventKind::CatUpdated,
            CatEvent::Deleted(_) => EventKind::CatDeleted,
        }
    }

    /// Identifier of the cat the event is about.
    pub fn cat_id(&self) -> i64 {
        match self {
            CatEvent::Created(e) => e.cat_id,
            CatEvent::Updated(e) => e.cat_id,
            CatEvent::Deleted(e) => e.cat_id,
        }
    }

    /// When the change happened.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CatEvent::Created(e) => e.created_at,
            CatEvent::Updated(e) => e.updated_at,
            CatEvent::Deleted(e) => e.deleted_at,
        }
    }

    /// Id of the delayed job this event schedules.
    pub fn job_id(&self) -> String {
        self.kind().job_id(self.cat_id())
    }

    /// Build the flat JSON envelope.
    pub fn to_envelope(&self) -> EventResult<Map<String, Value>> {
        match self {
            CatEvent::Created(e) => envelope(EventKind::CatCreated, e),
            CatEvent::Updated(e) => envelope(EventKind::CatUpdated, e),
            CatEvent::Deleted(e) => envelope(EventKind::CatDeleted, e),
        }
    }

    /// Encode the envelope as JSON bytes.
    pub fn to_json(&self) -> EventResult<Vec<u8>> {
        let envelope = self.to_envelope()?;
        serde_json::to_vec(&envelope).map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Rebuild an event from a parsed envelope.
    pub fn from_envelope(value: &Value) -> EventResult<Self> {
        let event_type = value
            .get("event_type")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingEventType)?;

        let kind: EventKind = event_type.parse()?;
        let invalid = |e: serde_json::Error| {
            EventError::Deserialization(format!("{} envelope: {}", kind, e))
        };

        Ok(match kind {
            EventKind::CatCreated => {
                CatEvent::Created(CatCreatedEvent::deserialize(value).map_err(invalid)?)
            }
            EventKind::CatUpdated => {
                CatEvent::Updated(CatUpdatedEvent::deserialize(value).map_err(invalid)?)
            }
            EventKind::CatDeleted => {
                CatEvent::Deleted(CatDeletedEvent::deserialize(value).map_err(invalid)?)
            }
        })
    }

    /// Parse JSON bytes and rebuild the event.
    pub fn from_slice(bytes: &[u8]) -> EventResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| EventError::Deserialization(e.to_string()))?;
        Self::from_envelope(&value)
    }
}

impl From<CatCreatedEvent> for CatEvent {
    fn from(event: CatCreatedEvent) -> Self {
        CatEvent::Created(event)
    }
}

impl From<CatUpdatedEvent> for CatEvent {
    fn from(event: CatUpdatedEvent) -> Self {
        CatEvent::Updated(event)
    }
}

impl From<CatDeletedEvent> for CatEvent {
    fn from(event: CatDeletedEvent) -> Self {
        CatEvent::Deleted(event)
    }
}

/// Wrap any serializable body into an envelope for `kind`.
///
/// The body must serialize to a JSON object; its fields are copied next to
/// `event_type` and `timestamp`.
pub fn envelope<T: Serialize + ?Sized>(kind: EventKind, body: &T) -> EventResult<Map<String, Value>> {
    let value =
        serde_json::to_value(body).map_err(|e| EventError::Serialization(e.to_string()))?;

    let Value::Object(fields) = value else {
        return Err(EventError::Serialization(format!(
            "{} body must serialize to a JSON object",
            kind
        )));
    };

    let mut map = Map::with_capacity(fields.len() + 2);
    map.insert("event_type".to_string(), Value::from(kind.routing_key()));
    map.extend(fields);
    map.insert(
        "timestamp".to_string(),
        Value::from(crate::timestamp::format(&Utc::now())),
    );
    Ok(map)
}

macro_rules! outbound_event {
    ($ty:ty, $kind:expr) => {
        impl OutboundEvent for $ty {
            fn type_name(&self) -> &str {
                $kind.type_name()
            }

            fn routing_key(&self) -> Option<&str> {
                Some($kind.routing_key())
            }

            fn to_envelope(&self) -> Option<EventResult<Map<String, Value>>> {
                Some(envelope($kind, self))
            }
        }
    };
}

outbound_event!(CatCreatedEvent, EventKind::CatCreated);
outbound_event!(CatUpdatedEvent, EventKind::CatUpdated);
outbound_event!(CatDeletedEvent, EventKind::CatDeleted);

impl OutboundEvent for CatEvent {
    fn type_name(&self) -> &str {
        self.kind().type_name()
    }

    fn routing_key(&self) -> Option<&str> {
        Some(self.kind().routing_key())
    }

    fn to_envelope(&self) -> Option<EventResult<Map<String, Value>>> {
        Some(CatEvent::to_envelope(self))
    }
}
