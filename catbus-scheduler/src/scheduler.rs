//! Delay scheduler.

use crate::config::{PersistenceMode, SchedulerConfig};
use crate::error::{SchedulerError, SchedulerResult};
use crate::job::{JobContext, JobHandler, JobState, ScheduledJob};
use crate::store::{JobStore, MemoryJobStore};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

// Fired and cancelled states are kept for lookups until the map reaches
// this size, then dropped.
const MAX_STATE_HISTORY: usize = 10_000;

/// State shared between the scheduler handle, the timer task and handler
/// tasks.
struct Shared {
    store: Arc<dyn JobStore>,
    handlers: RwLock<HashMap<String, JobHandler>>,
    states: RwLock<HashMap<String, JobState>>,
    wakeup: Notify,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    poll_interval: Duration,
}

struct Running {
    cancel: CancellationToken,
    timer: JoinHandle<()>,
}

/// Runs a named handler once at a future time, keyed by job id.
///
/// Scheduling an id that is already pending replaces the pending job, so at
/// most one job per id is ever waiting. Due jobs run on a pool bounded by
/// [`SchedulerConfig::workers`]; a handler error or panic is logged and the
/// job is discarded.
///
/// The scheduler is an explicit service object. Construct it once, share it
/// as `Arc<DelayScheduler>`, and let a single owner call [`start`] and
/// [`stop`].
///
/// [`start`]: DelayScheduler::start
/// [`stop`]: DelayScheduler::stop
///
/// # Examples
///
/// ```no_run
/// use catbus_scheduler::*;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> SchedulerResult<()> {
/// let scheduler = DelayScheduler::new(SchedulerConfig::default());
///
/// scheduler
///     .register_handler("cat_created_handler", |ctx| async move {
///         println!("cat {} is ready", ctx.args["cat_id"]);
///         Ok(())
///     })
///     .await;
///
/// scheduler.start().await?;
/// scheduler
///     .schedule_in(
///         "cat_created_delay_42",
///         Duration::from_secs(2),
///         "cat_created_handler",
///         serde_json::json!({ "cat_id": 42 }),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct DelayScheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    running: Mutex<Option<Running>>,
}

impl DelayScheduler {
    /// Create a scheduler with an in-memory store.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryJobStore::new()))
    }

    /// Create a scheduler over an explicit store.
    pub fn with_store(config: SchedulerConfig, store: Arc<dyn JobStore>) -> Self {
        debug!(
            workers = config.workers,
            durable = store.is_durable(),
            "Initializing delay scheduler"
        );

        let shared = Shared {
            store,
            handlers: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            wakeup: Notify::new(),
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            tracker: TaskTracker::new(),
            poll_interval: config.poll_interval,
        };

        Self {
            shared: Arc::new(shared),
            config,
            running: Mutex::new(None),
        }
    }

    /// Create a scheduler with the store its persistence mode asks for.
    pub async fn connect(config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;

        match config.mode {
            PersistenceMode::Transient => Ok(Self::new(config)),
            #[cfg(feature = "redis")]
            PersistenceMode::Persisted => {
                let store =
                    crate::redis_store::RedisJobStore::connect(&config.redis_url, &config.key_prefix)
                        .await?;
                Ok(Self::with_store(config, Arc::new(store)))
            }
            #[cfg(not(feature = "redis"))]
            PersistenceMode::Persisted => Err(SchedulerError::Config(
                "persisted mode requires the `redis` feature".to_string(),
            )),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether pending jobs survive a restart.
    pub fn is_durable(&self) -> bool {
        self.shared.store.is_durable()
    }

    /// Register a handler under a name.
    ///
    /// Registering a name twice replaces the earlier handler.
    pub async fn register_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SchedulerResult<()>> + Send + 'static,
    {
        let wrapped: JobHandler = Arc::new(
            move |ctx: JobContext| -> Pin<Box<dyn Future<Output = SchedulerResult<()>> + Send>> {
                Box::pin(handler(ctx))
            },
        );

        let name = name.into();
        debug!(handler = %name, "Registering delayed handler");
        self.shared.handlers.write().await.insert(name, wrapped);
    }

    /// Check whether a handler is registered.
    pub async fn has_handler(&self, name: &str) -> bool {
        self.shared.handlers.read().await.contains_key(name)
    }

    /// Schedule `handler` to run with `args` at `fire_at`.
    ///
    /// Replaces any pending job with the same id. Returns `true` when a
    /// pending job was replaced.
    pub async fn schedule_at(
        &self,
        job_id: impl Into<String>,
        fire_at: DateTime<Utc>,
        handler: impl Into<String>,
        args: serde_json::Value,
    ) -> SchedulerResult<bool> {
        let job_id = job_id.into();
        let handler = handler.into();

        if !self.has_handler(&handler).await {
            return Err(SchedulerError::UnknownHandler(handler));
        }

        self.shared.set_state(&job_id, JobState::Pending).await;

        let job = ScheduledJob::new(job_id.clone(), handler, args, fire_at);
        let replaced = match self.shared.store.upsert(job).await {
            Ok(replaced) => replaced,
            Err(e) => {
                self.shared.states.write().await.remove(&job_id);
                return Err(e);
            }
        };

        self.shared.wakeup.notify_one();

        match replaced {
            Some(previous) => {
                debug!(
                    job_id = %job_id,
                    previous_fire_at = %previous.fire_at,
                    fire_at = %fire_at,
                    "Replaced pending job"
                );
                Ok(true)
            }
            None => {
                debug!(job_id = %job_id, fire_at = %fire_at, "Job scheduled");
                Ok(false)
            }
        }
    }

    /// Schedule `handler` to run after `delay`.
    pub async fn schedule_in(
        &self,
        job_id: impl Into<String>,
        delay: Duration,
        handler: impl Into<String>,
        args: serde_json::Value,
    ) -> SchedulerResult<bool> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| SchedulerError::Config(format!("delay out of range: {}", e)))?;
        self.schedule_at(job_id, Utc::now() + delay, handler, args)
            .await
    }

    /// Cancel a pending job. Returns `false` when nothing was pending.
    pub async fn cancel(&self, job_id: &str) -> SchedulerResult<bool> {
        match self.shared.store.remove(job_id).await? {
            Some(_) => {
                self.shared.set_state(job_id, JobState::Cancelled).await;
                self.shared.wakeup.notify_one();
                debug!(job_id = %job_id, "Job cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Get the state of a job id.
    ///
    /// `None` when the id was never scheduled in this process and is not
    /// pending in the store.
    pub async fn job_state(&self, job_id: &str) -> SchedulerResult<Option<JobState>> {
        if self.shared.store.get(job_id).await?.is_some() {
            return Ok(Some(JobState::Pending));
        }
        Ok(self.shared.states.read().await.get(job_id).copied())
    }

    /// Get a pending job.
    pub async fn pending(&self, job_id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        self.shared.store.get(job_id).await
    }

    /// Number of pending jobs.
    pub async fn pending_count(&self) -> SchedulerResult<usize> {
        self.shared.store.len().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start the timer.
    ///
    /// Jobs already in the store, including jobs persisted before a
    /// restart, fire as soon as they are due.
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Delay scheduler already running");
            return Err(SchedulerError::AlreadyRunning);
        }

        let pending = self.shared.store.len().await?;

        self.shared.tracker.reopen();
        let cancel = CancellationToken::new();
        let timer = tokio::spawn(run_timer(self.shared.clone(), cancel.clone()));
        *running = Some(Running { cancel, timer });

        info!(
            workers = self.config.workers,
            mode = %self.config.mode,
            pending,
            "Delay scheduler started"
        );
        Ok(())
    }

    /// Stop the timer and wait for in-flight handlers.
    ///
    /// Pending jobs stay in the store. Handlers still running after the
    /// shutdown timeout are abandoned with a warning.
    pub async fn stop(&self) -> SchedulerResult<()> {
        let Some(Running { cancel, timer }) = self.running.lock().await.take() else {
            return Err(SchedulerError::NotRunning);
        };

        info!("Stopping delay scheduler");
        cancel.cancel();

        let timeout = self.config.shutdown_timeout;
        let abort = timer.abort_handle();
        if tokio::time::timeout(timeout, timer).await.is_err() {
            warn!("Timer task did not stop in time, aborting");
            abort.abort();
        }

        self.shared.tracker.close();
        if tokio::time::timeout(timeout, self.shared.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.shared.tracker.len(),
                "Abandoning delayed handlers that did not finish in time"
            );
        }

        info!("Delay scheduler stopped");
        Ok(())
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

impl Shared {
    async fn set_state(&self, job_id: &str, state: JobState) {
        let mut states = self.states.write().await;
        if states.len() >= MAX_STATE_HISTORY && !states.contains_key(job_id) {
            states.retain(|_, s| *s == JobState::Pending);
        }
        states.insert(job_id.to_string(), state);
    }

    async fn dispatch(&self, job: ScheduledJob) {
        let handler = self.handlers.read().await.get(&job.handler).cloned();
        self.set_state(&job.id, JobState::Fired).await;

        let Some(handler) = handler else {
            error!(
                job_id = %job.id,
                handler = %job.handler,
                "No handler registered for due job, discarding"
            );
            return;
        };

        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let ctx = JobContext {
                job_id: job.id.clone(),
                scheduled_for: job.fire_at,
                fired_at: Utc::now(),
                args: job.args,
            };
            let job_id = job.id;

            debug!(
                job_id = %job_id,
                lateness_ms = ctx.lateness().num_milliseconds(),
                "Running delayed job"
            );

            match AssertUnwindSafe(async move { handler(ctx).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => debug!(job_id = %job_id, "Delayed job finished"),
                Ok(Err(e)) => error!(job_id = %job_id, error = %e, "Delayed job failed"),
                Err(panic) => error!(
                    job_id = %job_id,
                    panic = %panic_message(panic.as_ref()),
                    "Delayed job panicked"
                ),
            }
        });
    }

    /// How long the timer may sleep before the next store read.
    async fn next_wait(&self) -> Duration {
        match self.store.next_fire_time().await {
            Ok(Some(fire_at)) => (fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval),
            Ok(None) => self.poll_interval,
            Err(e) => {
                error!(error = %e, "Failed to read next fire time");
                self.poll_interval
            }
        }
    }
}

async fn run_timer(shared: Arc<Shared>, cancel: CancellationToken) {
    debug!("Timer loop started");

    loop {
        let wait = match shared.store.take_due(Utc::now()).await {
            Ok(due) => {
                for job in due {
                    shared.dispatch(job).await;
                }
                shared.next_wait().await
            }
            Err(e) => {
                error!(error = %e, "Failed to claim due jobs");
                shared.poll_interval
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.wakeup.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!("Timer loop stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_secs(1))
    }

    async fn counting(scheduler: &DelayScheduler, name: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .register_handler(name, move |_ctx| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        count
    }

    #[tokio::test]
    async fn test_unknown_handler_is_rejected() {
        let scheduler = DelayScheduler::new(fast_config());
        let result = scheduler
            .schedule_in("a", Duration::from_millis(10), "missing", serde_json::Value::Null)
            .await;

        assert!(matches!(result, Err(SchedulerError::UnknownHandler(ref h)) if h == "missing"));
        assert_eq!(scheduler.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_same_id_keeps_one_pending_job() {
        let scheduler = DelayScheduler::new(fast_config());
        let _count = counting(&scheduler, "h").await;

        let now = Utc::now();
        let first = now + chrono::Duration::seconds(30);
        let second = now + chrono::Duration::seconds(60);

        assert!(!scheduler.schedule_at("job", first, "h", serde_json::Value::Null).await.unwrap());
        assert!(scheduler.schedule_at("job", second, "h", serde_json::Value::Null).await.unwrap());

        assert_eq!(scheduler.pending_count().await.unwrap(), 1);
        let pending = scheduler.pending("job").await.unwrap().unwrap();
        assert_eq!(pending.fire_at, second);
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_idle() {
        let scheduler = DelayScheduler::new(fast_config());

        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn test_job_fires_once() {
        let scheduler = DelayScheduler::new(fast_config());
        let count = counting(&scheduler, "h").await;
        scheduler.start().await.unwrap();

        scheduler
            .schedule_in("once", Duration::from_millis(50), "h", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(scheduler.job_state("once").await.unwrap(), Some(JobState::Pending));

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.job_state("once").await.unwrap(), Some(JobState::Fired));
        assert_eq!(scheduler.pending_count().await.unwrap(), 0);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel() {
        let scheduler = DelayScheduler::new(fast_config());
        let count = counting(&scheduler, "h").await;
        scheduler.start().await.unwrap();

        scheduler
            .schedule_in("c", Duration::from_millis(100), "h", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(scheduler.cancel("c").await.unwrap());
        assert!(!scheduler.cancel("c").await.unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.job_state("c").await.unwrap(), Some(JobState::Cancelled));
        assert_eq!(scheduler.job_state("never").await.unwrap(), None);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_timer() {
        let scheduler = DelayScheduler::new(fast_config());
        scheduler
            .register_handler("boom", |ctx| async move {
                if ctx.job_id == "p" {
                    panic!("handler exploded");
                }
                Ok(())
            })
            .await;
        let count = counting(&scheduler, "ok").await;
        scheduler.start().await.unwrap();

        scheduler
            .schedule_in("p", Duration::from_millis(20), "boom", serde_json::Value::Null)
            .await
            .unwrap();
        scheduler
            .schedule_in("q", Duration::from_millis(60), "ok", serde_json::Value::Null)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.stop().await.unwrap();
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
