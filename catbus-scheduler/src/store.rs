//! Pending job storage.

use crate::error::SchedulerResult;
use crate::job::ScheduledJob;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Storage for jobs that have not fired yet.
///
/// A store holds at most one job per id. Implementations must make
/// `take_due` a claim: a job returned from it is gone from the store, so two
/// timer loops sharing a store never run the same job twice.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job, replacing any pending job with the same id.
    ///
    /// Returns the replaced job.
    async fn upsert(&self, job: ScheduledJob) -> SchedulerResult<Option<ScheduledJob>>;

    /// Remove a pending job.
    async fn remove(&self, id: &str) -> SchedulerResult<Option<ScheduledJob>>;

    /// Get a pending job.
    async fn get(&self, id: &str) -> SchedulerResult<Option<ScheduledJob>>;

    /// Remove and return every job due at `now`, earliest first.
    async fn take_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<ScheduledJob>>;

    /// Earliest fire time among pending jobs.
    async fn next_fire_time(&self) -> SchedulerResult<Option<DateTime<Utc>>>;

    /// Number of pending jobs.
    async fn len(&self) -> SchedulerResult<usize>;

    /// Whether pending jobs survive a process restart.
    fn is_durable(&self) -> bool {
        false
    }
}

/// In-process job store. Pending jobs are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, ScheduledJob>>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, job: ScheduledJob) -> SchedulerResult<Option<ScheduledJob>> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs.insert(job.id.clone(), job))
    }

    async fn remove(&self, id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        Ok(self.jobs.write().await.remove(id))
    }

    async fn get(&self, id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn take_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<ScheduledJob>> {
        let mut jobs = self.jobs.write().await;

        let due_ids: Vec<String> = jobs
            .values()
            .filter(|job| job.is_due(now))
            .map(|job| job.id.clone())
            .collect();

        let mut due: Vec<ScheduledJob> = due_ids
            .iter()
            .filter_map(|id| jobs.remove(id))
            .collect();
        due.sort_by_key(|job| job.fire_at);

        Ok(due)
    }

    async fn next_fire_time(&self) -> SchedulerResult<Option<DateTime<Utc>>> {
        Ok(self.jobs.read().await.values().map(|job| job.fire_at).min())
    }

    async fn len(&self) -> SchedulerResult<usize> {
        Ok(self.jobs.read().await.len())
    }
}
