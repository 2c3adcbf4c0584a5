//! Publish command - send one cat event.

use catbus_events::{CatCreatedEvent, CatDeletedEvent, CatEvent, CatUpdatedEvent};
use catbus_messaging::{PublishOutcome, Publisher, RabbitMqSettings};
use colored::Colorize;
use tracing::warn;

use crate::error::{CliError, CliResult};

/// Cat attributes shared by created and updated events.
#[derive(Debug, Clone)]
pub struct CatFields {
    pub id: i64,
    pub name: String,
    pub age: u32,
    pub color: String,
    pub breed: String,
    pub breed_id: Option<i64>,
}

impl CatFields {
    pub fn created(self) -> CatEvent {
        CatCreatedEvent::new(
            self.id,
            self.name,
            self.age,
            self.color,
            self.breed,
            self.breed_id,
        )
        .into()
    }

    pub fn updated(self) -> CatEvent {
        CatUpdatedEvent::new(
            self.id,
            self.name,
            self.age,
            self.color,
            self.breed,
            self.breed_id,
        )
        .into()
    }
}

/// Build a deleted event.
pub fn deleted(id: i64) -> CatEvent {
    CatDeletedEvent::new(id).into()
}

/// Publish `event` and report where it went.
pub async fn run(event: CatEvent, routing_key: Option<&str>) -> CliResult<()> {
    let settings = RabbitMqSettings::from_env()?;
    settings.validate()?;

    let publisher = Publisher::rabbitmq(&settings);
    let result = publisher.publish(&event, routing_key).await;

    if let Err(e) = publisher.disconnect().await {
        warn!(error = %e, "Publisher did not disconnect cleanly");
    }

    match result? {
        PublishOutcome::Delivered => {
            println!(
                "  {} Published {} for cat {}",
                "✓".green(),
                routing_key.unwrap_or(event.kind().routing_key()).cyan(),
                event.cat_id()
            );
            Ok(())
        }
        PublishOutcome::DeadLettered(reason) => {
            println!(
                "  {} Sent to {} ({})",
                "⚠".yellow(),
                settings.dead_letter_exchange().cyan(),
                reason
            );
            Err(CliError::DeadLettered(reason.to_string()))
        }
    }
}
