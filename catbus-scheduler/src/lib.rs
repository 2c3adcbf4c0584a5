//! Delayed job execution for catbus.
//!
//! A [`DelayScheduler`] runs a named handler once, a fixed time after a job
//! is submitted. Jobs carry a deterministic id; submitting an id that is
//! already waiting replaces the waiting job, which is how repeated events for
//! the same subject collapse into a single side effect.
//!
//! ## Features
//!
//! - At most one pending job per id
//! - Bounded handler pool, isolated from the caller
//! - Handler errors and panics are caught and logged
//! - Pending jobs kept in memory (default) or in Redis (`redis` feature)
//!
//! ## Quick Start
//!
//! ```no_run
//! use catbus_scheduler::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> SchedulerResult<()> {
//!     let scheduler = DelayScheduler::connect(SchedulerConfig::from_env()?).await?;
//!
//!     scheduler
//!         .register_handler("greet", |ctx| async move {
//!             println!("hello from {}", ctx.job_id);
//!             Ok(())
//!         })
//!         .await;
//!
//!     scheduler.start().await?;
//!     scheduler
//!         .schedule_in("greet_1", Duration::from_secs(2), "greet", serde_json::Value::Null)
//!         .await?;
//!
//!     tokio::time::sleep(Duration::from_secs(3)).await;
//!     scheduler.stop().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod job;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod scheduler;
pub mod store;

pub use config::{PersistenceMode, SchedulerConfig};
pub use error::{SchedulerError, SchedulerResult};
pub use job::{JobContext, JobHandler, JobState, ScheduledJob};
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use scheduler::DelayScheduler;
pub use store::{JobStore, MemoryJobStore};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{PersistenceMode, SchedulerConfig};
    pub use crate::error::{SchedulerError, SchedulerResult};
    pub use crate::job::{JobContext, JobState, ScheduledJob};
    pub use crate::scheduler::DelayScheduler;
    pub use crate::store::{JobStore, MemoryJobStore};
}
