//! Topology command - declare exchanges and queues, then print them.

use catbus_messaging::{Publisher, RabbitMqSettings};
use colored::Colorize;

use crate::error::CliResult;

/// Declare the topology on the configured broker.
pub async fn run() -> CliResult<()> {
    let settings = RabbitMqSettings::from_env()?;
    settings.validate()?;

    let publisher = Publisher::rabbitmq(&settings);
    publisher.connect().await?;

    let t = publisher.topology().clone();
    publisher.disconnect().await?;

    println!();
    println!("  {} {}", "Broker:".bright_white().bold(), settings.redacted_uri());
    println!(
        "  {} {} → {} ({})",
        "Primary:".bright_white().bold(),
        t.exchange.cyan(),
        t.queue.cyan(),
        t.routing_key
    );
    println!(
        "  {} {} → {} ({})",
        "Dead letter:".bright_white().bold(),
        t.dead_letter_exchange.cyan(),
        t.dead_letter_queue.cyan(),
        t.dead_letter_routing_key
    );
    println!();
    Ok(())
}
