//! Consume command - run the delayed consumer until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use catbus_messaging::{Consumer, ConsumerConfig, RabbitMqSettings};
use catbus_scheduler::{DelayScheduler, SchedulerConfig};
use colored::Colorize;
use tracing::{info, warn};

use crate::error::CliResult;

/// Start the scheduler and consumer, then wait for a shutdown signal.
pub async fn run(delay_secs: Option<u64>) -> CliResult<()> {
    let settings = RabbitMqSettings::from_env()?;
    settings.validate()?;

    let mut consumer_config = ConsumerConfig::from_env()?;
    if let Some(secs) = delay_secs {
        consumer_config = consumer_config.with_delay(Duration::from_secs(secs));
    }

    let scheduler_config = SchedulerConfig::from_env()?;
    scheduler_config.validate()?;
    let scheduler = Arc::new(DelayScheduler::connect(scheduler_config).await?);
    let consumer = Consumer::rabbitmq(&settings, scheduler.clone(), consumer_config.clone());

    // Resumed jobs dispatch as soon as the timer starts
    consumer.register_handlers().await;
    scheduler.start().await?;
    if let Err(e) = consumer.start().await {
        if let Err(stop_err) = scheduler.stop().await {
            warn!(error = %stop_err, "Scheduler did not stop cleanly");
        }
        return Err(e.into());
    }

    println!();
    println!(
        "  {} Consuming {} from {} (delay {}s)",
        "●".green(),
        settings.queue_name.cyan(),
        settings.redacted_uri(),
        consumer_config.delay.as_secs()
    );
    println!("  {}", "Press Ctrl-C to stop".dimmed());
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Stop intake before the job pool
    consumer.stop().await?;
    scheduler.stop().await?;

    println!("  {} Stopped", "✓".green());
    Ok(())
}
