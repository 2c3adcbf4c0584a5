//! Event consumer: turns primary-queue events into delayed jobs and drains
//! the dead-letter queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use catbus_events::{CatEvent, EventKind};
use catbus_scheduler::{DelayScheduler, JobContext, SchedulerError, SchedulerResult};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::dead_letter::{HEADER_ERROR_REASON, HEADER_ORIGINAL_ROUTING_KEY};
use crate::error::{MessagingError, MessagingResult};
use crate::message::{Delivery, preview};
use crate::publisher::PREVIEW_CHARS;
use crate::topology::{Topology, TopologyManager};
use crate::transport::{BrokerConnection, BrokerConnector, DeliveryStream};

/// Delayed handler for one event kind.
pub type EventHandler =
    Arc<dyn Fn(CatEvent) -> Pin<Box<dyn Future<Output = SchedulerResult<()>> + Send>> + Send + Sync>;

/// How a primary-queue delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Job scheduled, delivery acked
    Scheduled {
        /// Job id
        job_id: String,
        /// A pending job with the same id was replaced
        replaced: bool,
    },
    /// Unknown event type, acked and ignored
    Ignored(String),
    /// Undecodable or unschedulable, rejected without requeue
    Rejected(String),
}

enum Decoded {
    Event(CatEvent, Value),
    Unknown(String),
    Malformed(String),
}

fn decode(body: &[u8]) -> Decoded {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => return Decoded::Malformed(format!("invalid JSON: {}", e)),
    };

    let Some(event_type) = value.get("event_type").and_then(Value::as_str) else {
        return Decoded::Malformed("missing event_type".to_string());
    };

    if EventKind::from_event_type(event_type).is_none() {
        return Decoded::Unknown(event_type.to_string());
    }

    match CatEvent::from_envelope(&value) {
        Ok(event) => Decoded::Event(event, value),
        Err(e) => Decoded::Malformed(e.to_string()),
    }
}

/// Schedule the delayed job for one primary-queue delivery and settle it.
pub async fn handle_primary(
    delivery: &Delivery,
    scheduler: &DelayScheduler,
    delay: Duration,
) -> Disposition {
    let disposition = match decode(&delivery.body) {
        Decoded::Event(event, envelope) => {
            let kind = event.kind();
            let job_id = event.job_id();

            match scheduler
                .schedule_in(job_id.clone(), delay, kind.handler_name(), envelope)
                .await
            {
                Ok(replaced) => {
                    info!(
                        event_type = %kind,
                        cat_id = event.cat_id(),
                        job_id = %job_id,
                        delay_ms = delay.as_millis() as u64,
                        replaced,
                        "Delayed job scheduled"
                    );
                    Disposition::Scheduled { job_id, replaced }
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Failed to schedule delayed job");
                    Disposition::Rejected(e.to_string())
                }
            }
        }
        Decoded::Unknown(event_type) => {
            warn!(event_type = %event_type, "Ignoring unknown event type");
            Disposition::Ignored(event_type)
        }
        Decoded::Malformed(reason) => {
            warn!(
                routing_key = %delivery.routing_key,
                reason = %reason,
                payload = %preview(&delivery.body_text(), PREVIEW_CHARS),
                "Rejecting malformed message"
            );
            Disposition::Rejected(reason)
        }
    };

    let settled = match disposition {
        Disposition::Rejected(_) => delivery.reject(false).await,
        _ => delivery.ack().await,
    };
    if let Err(e) = settled {
        error!(error = %e, "Failed to settle delivery");
    }

    disposition
}

/// Log and acknowledge one dead-letter delivery. Never parses or retries.
pub async fn handle_dead_letter(delivery: &Delivery) {
    let reason = delivery
        .header(HEADER_ERROR_REASON)
        .or_else(|| delivery.header("x-first-death-reason"))
        .unwrap_or("unknown");
    let original_routing_key = delivery
        .header(HEADER_ORIGINAL_ROUTING_KEY)
        .unwrap_or(delivery.routing_key.as_str());

    warn!(
        reason,
        original_routing_key,
        payload = %preview(&delivery.body_text(), PREVIEW_CHARS),
        "Dead-lettered message"
    );

    if let Err(e) = delivery.ack().await {
        error!(error = %e, "Failed to ack dead-letter delivery");
    }
}

struct Running {
    connection: Arc<dyn BrokerConnection>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Subscribes to the primary and dead-letter queues.
///
/// Each recognized event schedules its kind's delayed handler under the
/// event's job id, so repeated events for one cat inside the delay window
/// run the handler once.
pub struct Consumer {
    connector: Arc<dyn BrokerConnector>,
    topology: TopologyManager,
    scheduler: Arc<DelayScheduler>,
    config: ConsumerConfig,
    prefetch: u16,
    handlers: HashMap<EventKind, EventHandler>,
    running: Mutex<Option<Running>>,
}

impl Consumer {
    /// Create a consumer.
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: Topology,
        scheduler: Arc<DelayScheduler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            connector,
            topology: TopologyManager::new(topology),
            scheduler,
            config,
            prefetch: 10,
            handlers: HashMap::new(),
            running: Mutex::new(None),
        }
    }

    /// Create a consumer for RabbitMQ.
    #[cfg(feature = "rabbitmq")]
    pub fn rabbitmq(
        settings: &crate::config::RabbitMqSettings,
        scheduler: Arc<DelayScheduler>,
        config: ConsumerConfig,
    ) -> Self {
        Self::new(
            Arc::new(crate::rabbitmq::RabbitMqConnector::new(settings.clone())),
            Topology::from_settings(settings),
            scheduler,
            config,
        )
        .with_prefetch(settings.prefetch)
    }

    /// Set the per-subscription prefetch.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Replace the default delayed handler for a kind.
    pub fn on_event<F, Fut>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(CatEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SchedulerResult<()>> + Send + 'static,
    {
        let wrapped: EventHandler = Arc::new(
            move |event: CatEvent| -> Pin<Box<dyn Future<Output = SchedulerResult<()>> + Send>> {
                Box::pin(handler(event))
            },
        );
        self.handlers.insert(kind, wrapped);
        self
    }

    /// Get the scheduler jobs are submitted to.
    pub fn scheduler(&self) -> &Arc<DelayScheduler> {
        &self.scheduler
    }

    /// Get the topology.
    pub fn topology(&self) -> &Topology {
        self.topology.topology()
    }

    /// Check if the consumer is running.
    ///
    /// Turns `false` on its own when a subscription is lost.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.cancel.is_cancelled())
    }

    /// Bind the delayed handlers for every event kind on the scheduler.
    ///
    /// Call this before starting the scheduler so that jobs resumed from a
    /// durable store find their handler. `start` calls it too; registering
    /// again replaces the same handlers.
    pub async fn register_handlers(&self) {
        for kind in EventKind::ALL {
            let handler = self
                .handlers
                .get(&kind)
                .cloned()
                .unwrap_or_else(|| default_handler(kind));

            self.scheduler
                .register_handler(kind.handler_name(), move |ctx: JobContext| {
                    let handler = handler.clone();
                    async move {
                        let event = CatEvent::from_envelope(&ctx.args)
                            .map_err(|e| SchedulerError::Handler(e.to_string()))?;
                        handler(event).await
                    }
                })
                .await;
        }
    }

    /// Register the delayed handlers, connect, declare the topology and
    /// start both subscriptions.
    pub async fn start(&self) -> MessagingResult<()> {
        let mut running = self.running.lock().await;
        match running.take() {
            Some(current) if !current.cancel.is_cancelled() => {
                *running = Some(current);
                warn!("Consumer already running");
                return Err(MessagingError::AlreadyRunning);
            }
            Some(lost) => {
                info!("Restarting consumer after lost subscription");
                self.shutdown(lost).await;
            }
            None => {}
        }

        self.register_handlers().await;

        let connection = self.connector.connect().await.map_err(|e| {
            error!(broker = %self.connector.describe(), error = %e, "Consumer failed to connect");
            e
        })?;

        let subscribed = self.subscribe(connection.as_ref()).await;
        let (primary, dead_letter) = match subscribed {
            Ok(streams) => streams,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Error closing consumer connection");
                }
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let tasks = vec![
            (
                "primary",
                tokio::spawn(run_primary(
                    primary,
                    self.scheduler.clone(),
                    self.config.delay,
                    cancel.clone(),
                )),
            ),
            (
                "dead-letter",
                tokio::spawn(run_dead_letter(dead_letter, cancel.clone())),
            ),
        ];

        let t = self.topology.topology();
        info!(
            queue = %t.queue,
            dead_letter_queue = %t.dead_letter_queue,
            delay_ms = self.config.delay.as_millis() as u64,
            "Consumer started"
        );

        *running = Some(Running {
            connection,
            cancel,
            tasks,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        connection: &dyn BrokerConnection,
    ) -> MessagingResult<(DeliveryStream, DeliveryStream)> {
        self.topology.ensure_topology(connection).await?;

        let t = self.topology.topology();
        let primary = connection.consume(&t.queue, self.prefetch).await?;
        let dead_letter = connection
            .consume(&t.dead_letter_queue, self.prefetch)
            .await?;
        Ok((primary, dead_letter))
    }

    /// Cancel both subscriptions, close the connection and wait for the
    /// subscription tasks.
    ///
    /// A task still running after the shutdown timeout is abandoned with a
    /// warning.
    pub async fn stop(&self) -> MessagingResult<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(MessagingError::NotRunning);
        };

        info!("Stopping consumer");
        self.shutdown(running).await;
        info!("Consumer stopped");
        Ok(())
    }

    async fn shutdown(&self, running: Running) {
        running.cancel.cancel();

        if let Err(e) = running.connection.close().await {
            warn!(error = %e, "Error closing consumer connection");
        }

        let timeout = self.config.shutdown_timeout;
        for (name, task) in running.tasks {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => debug!(subscription = name, "Subscription task stopped"),
                Ok(Err(e)) => error!(subscription = name, error = %e, "Subscription task failed"),
                Err(_) => warn!(
                    subscription = name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Subscription task did not stop in time, abandoning it"
                ),
            }
        }
    }
}

// Ends the consumer's run when a subscription stops without being cancelled.
fn subscription_lost(subscription: &str, cancel: &CancellationToken, reason: &str) {
    if !cancel.is_cancelled() {
        error!(subscription, reason, "Subscription lost, consumer is no longer running");
        cancel.cancel();
    }
}

async fn run_primary(
    mut stream: DeliveryStream,
    scheduler: Arc<DelayScheduler>,
    delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    subscription_lost("primary", &cancel, &e.to_string());
                    break;
                }
                None => {
                    subscription_lost("primary", &cancel, "stream ended");
                    break;
                }
            },
        };

        handle_primary(&delivery, &scheduler, delay).await;
    }
}

async fn run_dead_letter(mut stream: DeliveryStream, cancel: CancellationToken) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    subscription_lost("dead-letter", &cancel, &e.to_string());
                    break;
                }
                None => {
                    subscription_lost("dead-letter", &cancel, "stream ended");
                    break;
                }
            },
        };

        handle_dead_letter(&delivery).await;
    }
}

fn default_handler(kind: EventKind) -> EventHandler {
    Arc::new(
        move |event: CatEvent| -> Pin<Box<dyn Future<Output = SchedulerResult<()>> + Send>> {
            Box::pin(async move {
                match event {
                    CatEvent::Created(cat) => info!(
                        cat_id = cat.cat_id,
                        name = %cat.name,
                        age = cat.age,
                        color = %cat.color,
                        breed = %cat.breed,
                        "Displaying new cat"
                    ),
                    CatEvent::Updated(cat) => info!(
                        cat_id = cat.cat_id,
                        name = %cat.name,
                        age = cat.age,
                        color = %cat.color,
                        breed = %cat.breed,
                        "Cat updated"
                    ),
                    CatEvent::Deleted(cat) => info!(cat_id = cat.cat_id, "Cat removed"),
                }
                debug!(event_type = %kind, "Default handler finished");
                Ok(())
            })
        },
    )
}
