//! Demo command - run the whole pipeline against an in-process broker.

use std::sync::Arc;
use std::time::Duration;

use catbus_events::CatEvent;
use catbus_messaging::{Consumer, ConsumerConfig, MemoryBroker, PublishOutcome, Publisher, Topology};
use catbus_scheduler::{DelayScheduler, SchedulerConfig};
use colored::Colorize;

use crate::commands::publish::CatFields;
use crate::error::CliResult;

/// Publish `event` twice and one unroutable event, then wait out the delay.
///
/// The two publishes collapse into one handler run; the unroutable one ends
/// up on the dead-letter queue.
pub async fn run(event: CatEvent, delay: Duration) -> CliResult<()> {
    let broker = MemoryBroker::new();
    let topology = Topology::default();

    let scheduler = Arc::new(DelayScheduler::new(
        SchedulerConfig::default().with_poll_interval(Duration::from_millis(100)),
    ));
    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        topology.clone(),
        scheduler.clone(),
        ConsumerConfig::default().with_delay(delay),
    );
    let publisher = Publisher::new(Arc::new(broker.clone()), topology.clone());

    consumer.register_handlers().await;
    scheduler.start().await?;
    consumer.start().await?;

    println!();
    println!("  {} In-memory broker, delay {:?}", "●".green(), delay);

    for attempt in 1..=2 {
        let outcome = publisher.publish(&event, None).await?;
        report(&format!("publish #{}", attempt), &outcome);
    }

    let stray = CatFields {
        id: event.cat_id(),
        name: "Stray".to_string(),
        age: 1,
        color: String::new(),
        breed: String::new(),
        breed_id: None,
    }
    .created();
    let outcome = publisher.publish(&stray, Some("cat.adopted")).await?;
    report("publish cat.adopted", &outcome);

    tokio::time::sleep(delay + Duration::from_millis(500)).await;

    consumer.stop().await?;
    scheduler.stop().await?;
    publisher.disconnect().await?;

    println!(
        "  {} primary acked: {}, dead-letter acked: {}",
        "✓".green(),
        broker.acked(&topology.queue),
        broker.acked(&topology.dead_letter_queue)
    );
    println!();
    Ok(())
}

fn report(label: &str, outcome: &PublishOutcome) {
    match outcome {
        PublishOutcome::Delivered => println!("  {} {}: delivered", "→".cyan(), label),
        PublishOutcome::DeadLettered(reason) => {
            println!("  {} {}: dead-lettered ({})", "⚠".yellow(), label, reason)
        }
    }
}
