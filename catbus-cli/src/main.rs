//! catbus CLI - publish cat events and run the delayed consumer.
//!
//! # Commands
//!
//! - `catbus consume` - Run the consumer until Ctrl-C
//! - `catbus publish <created|updated|deleted>` - Publish one event
//! - `catbus topology` - Declare exchanges and queues
//! - `catbus demo` - Run the pipeline against an in-process broker
//!
//! Broker settings come from `RABBITMQ_*` variables, consumer timing from
//! `CATBUS_CONSUMER_*`, scheduler settings from `CATBUS_SCHEDULER_*` and
//! logging from `CATBUS_LOG_*`. A `.env` file is loaded first if present.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

mod commands;
mod error;

use commands::publish::{CatFields, deleted};
use commands::{consume, demo, publish, topology};
use error::CliResult;

/// catbus - cat events over RabbitMQ with delayed handlers
#[derive(Parser)]
#[command(name = "catbus")]
#[command(version)]
#[command(about = "Publish cat events and run the delayed consumer")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consumer until Ctrl-C
    #[command(alias = "c")]
    Consume {
        /// Override the handler delay in seconds
        #[arg(long)]
        delay: Option<u64>,
    },

    /// Publish one event
    #[command(alias = "p")]
    Publish {
        /// Routing key override
        #[arg(long, global = true)]
        routing_key: Option<String>,

        #[command(subcommand)]
        event: EventCommand,
    },

    /// Declare exchanges and queues, then print them
    Topology,

    /// Run the pipeline against an in-process broker
    Demo {
        /// Handler delay in milliseconds
        #[arg(long, default_value_t = 2000)]
        delay_ms: u64,

        #[command(flatten)]
        cat: CatArgs,
    },
}

#[derive(Subcommand)]
enum EventCommand {
    /// A cat was registered
    Created(CatArgs),
    /// A cat's attributes changed
    Updated(CatArgs),
    /// A cat was removed
    Deleted {
        /// Cat id
        #[arg(long)]
        id: i64,
    },
}

#[derive(Args, Clone)]
struct CatArgs {
    /// Cat id
    #[arg(long, default_value_t = 42)]
    id: i64,

    /// Name
    #[arg(long, default_value = "Tom")]
    name: String,

    /// Age in years
    #[arg(long, default_value_t = 3)]
    age: u32,

    /// Coat color
    #[arg(long, default_value = "")]
    color: String,

    /// Breed name
    #[arg(long, default_value = "")]
    breed: String,

    /// Breed id
    #[arg(long)]
    breed_id: Option<i64>,
}

impl From<CatArgs> for CatFields {
    fn from(args: CatArgs) -> Self {
        Self {
            id: args.id,
            name: args.name,
            age: args.age,
            color: args.color,
            breed: args.breed,
            breed_id: args.breed_id,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    catbus_config::load_dotenv();
    catbus_log::init();

    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }

    let result: CliResult<()> = match cli.command {
        Commands::Consume { delay } => consume::run(delay).await,
        Commands::Publish { routing_key, event } => {
            let event = match event {
                EventCommand::Created(args) => CatFields::from(args).created(),
                EventCommand::Updated(args) => CatFields::from(args).updated(),
                EventCommand::Deleted { id } => deleted(id),
            };
            publish::run(event, routing_key.as_deref()).await
        }
        Commands::Topology => topology::run().await,
        Commands::Demo { delay_ms, cat } => {
            demo::run(
                CatFields::from(cat).created(),
                Duration::from_millis(delay_ms),
            )
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("  {} {}", "✗".red(), e);
            ExitCode::FAILURE
        }
    }
}
