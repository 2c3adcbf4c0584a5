//! Scheduled job definition.

use crate::error::SchedulerResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Delayed handler function type.
pub type JobHandler =
    Arc<dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = SchedulerResult<()>> + Send>> + Send + Sync>;

/// What a handler receives when its job fires.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job id
    pub job_id: String,

    /// Time the job was due
    pub scheduled_for: DateTime<Utc>,

    /// Time the handler actually started
    pub fired_at: DateTime<Utc>,

    /// Arguments stored with the job
    pub args: serde_json::Value,
}

impl JobContext {
    /// Get the delay between the due time and the actual start.
    pub fn lateness(&self) -> chrono::Duration {
        self.fired_at - self.scheduled_for
    }
}

/// Per-id job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for its fire time
    Pending,

    /// Handed to a worker
    Fired,

    /// Removed before it fired
    Cancelled,
}

/// A job waiting in a store.
///
/// Jobs refer to their handler by name so that they can be stored outside
/// the process and re-bound after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Deterministic job id; at most one pending job per id
    pub id: String,

    /// Registered handler name
    pub handler: String,

    /// Handler arguments
    pub args: serde_json::Value,

    /// Time the job should fire
    pub fire_at: DateTime<Utc>,

    /// Time the job was (last) scheduled
    pub enqueued_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Create a new job.
    pub fn new(
        id: impl Into<String>,
        handler: impl Into<String>,
        args: serde_json::Value,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            handler: handler.into(),
            args,
            fire_at,
            enqueued_at: Utc::now(),
        }
    }

    /// Check if the job is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_job_creation() {
        let fire_at = Utc::now() + Duration::seconds(2);
        let job = ScheduledJob::new(
            "cat_created_delay_1",
            "cat_created_handler",
            serde_json::json!({"cat_id": 1}),
            fire_at,
        );

        assert_eq!(job.id, "cat_created_delay_1");
        assert_eq!(job.handler, "cat_created_handler");
        assert_eq!(job.fire_at, fire_at);
        assert!(job.enqueued_at <= Utc::now());
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let job = ScheduledJob::new("a", "h", serde_json::Value::Null, now);

        assert!(job.is_due(now));
        assert!(job.is_due(now + Duration::milliseconds(1)));
        assert!(!job.is_due(now - Duration::milliseconds(1)));
    }

    #[test]
    fn test_job_survives_json() {
        let job = ScheduledJob::new(
            "cat_deleted_delay_3",
            "cat_deleted_handler",
            serde_json::json!({"event_type": "cat.deleted", "cat_id": 3}),
            Utc::now(),
        );

        let json = serde_json::to_string(&job).unwrap();
        let restored: ScheduledJob = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_context_lateness() {
        let scheduled_for = Utc::now();
        let ctx = JobContext {
            job_id: "a".to_string(),
            scheduled_for,
            fired_at: scheduled_for + Duration::milliseconds(250),
            args: serde_json::Value::Null,
        };

        assert_eq!(ctx.lateness(), Duration::milliseconds(250));
    }
}
