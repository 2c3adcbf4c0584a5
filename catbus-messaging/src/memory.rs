//! In-process broker.
//!
//! Implements enough of AMQP topic semantics for the publisher and consumer
//! to run without RabbitMQ: durable topic exchanges with `*` / `#` binding
//! patterns, the default exchange, mandatory returns, and dead-lettering on
//! reject-without-requeue. Prefetch is not enforced.
//!
//! Tests use the inspection helpers and failure switches; the CLI uses it
//! for its `--in-memory` demo mode.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MessagingError, MessagingResult};
use crate::message::{Acker, Delivery, OutgoingMessage, PublishConfirm};
use crate::transport::{
    BrokerConnection, BrokerConnector, DeliveryStream, ExchangeSpec, QueueSpec,
};

/// How an injected publish failure shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFailure {
    /// The publish call fails with a transport error
    Error,
    /// The broker nacks the publish
    Nack,
}

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Exchange it was published to
    pub exchange: String,
    /// Routing key it was published under
    pub routing_key: String,
    /// Body
    pub body: Vec<u8>,
    /// Content type
    pub content_type: String,
    /// Persistent delivery mode
    pub persistent: bool,
    /// Headers
    pub headers: BTreeMap<String, String>,
    /// Delivered before and requeued
    pub redelivered: bool,
}

impl StoredMessage {
    /// Body as text.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn from_outgoing(message: &OutgoingMessage) -> Self {
        Self {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            content_type: message.content_type.clone(),
            persistent: message.persistent,
            headers: message.headers.clone(),
            redelivered: false,
        }
    }
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
    acked: usize,
    rejected: usize,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unreachable: bool,
    publish_failures: HashMap<String, PublishFailure>,
    connections_opened: usize,
    connections_closed: usize,
    live: Vec<CancellationToken>,
}

impl BrokerState {
    fn route(&mut self, message: StoredMessage) -> usize {
        let mut targets: Vec<String> = if message.exchange.is_empty() {
            self.queues
                .contains_key(&message.routing_key)
                .then(|| message.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            self.bindings
                .iter()
                .filter(|b| {
                    b.exchange == message.exchange && topic_matches(&b.pattern, &message.routing_key)
                })
                .map(|b| b.queue.clone())
                .collect()
        };
        targets.sort();
        targets.dedup();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_one();
            }
        }

        targets.len()
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            message.redelivered = true;
            q.ready.push_front(message);
            q.notify.notify_one();
        }
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let Some(target) = self
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter.clone())
        else {
            debug!(queue, "Rejected message dropped, queue has no dead-letter exchange");
            return;
        };

        message
            .headers
            .insert("x-first-death-reason".to_string(), "rejected".to_string());
        message
            .headers
            .insert("x-first-death-queue".to_string(), queue.to_string());
        message.exchange = target.exchange;
        message.routing_key = target.routing_key;
        message.redelivered = false;

        self.route(message);
    }
}

/// Topic pattern match: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((first, rest)) if *first == "#" => (0..=key.len()).any(|i| words_match(rest, &key[i..])),
        Some((first, rest)) if *first == "*" => !key.is_empty() && words_match(rest, &key[1..]),
        Some((first, rest)) => key.first() == Some(first) && words_match(rest, &key[1..]),
    }
}

/// An in-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate an outage: new connections fail and open ones report closed.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Make publishes to `exchange` fail.
    pub fn fail_publishes_to(&self, exchange: impl Into<String>, failure: PublishFailure) {
        self.lock().publish_failures.insert(exchange.into(), failure);
    }

    /// Remove all injected publish failures.
    pub fn clear_publish_failures(&self) {
        self.lock().publish_failures.clear();
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// Connections opened and not yet closed by their owner.
    pub fn open_connections(&self) -> usize {
        let state = self.lock();
        state.connections_opened - state.connections_closed
    }

    /// Drop every open connection from the broker side, ending their
    /// subscriptions. Owners still have to close them.
    pub fn drop_connections(&self) {
        for token in self.lock().live.drain(..) {
            token.cancel();
        }
    }

    /// Whether an exchange is declared.
    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Get a queue's declaration.
    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.lock().queues.get(name).map(|q| q.spec.clone())
    }

    /// Whether `queue` is bound to `exchange` under exactly `pattern`.
    pub fn is_bound(&self, queue: &str, exchange: &str, pattern: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern)
    }

    /// Messages waiting in a queue.
    pub fn queue_len(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.ready.len())
    }

    /// Remove and return every waiting message in a queue.
    pub fn drain(&self, name: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get_mut(name)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    /// Deliveries acknowledged on a queue.
    pub fn acked(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.acked)
    }

    /// Deliveries rejected on a queue.
    pub fn rejected(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.rejected)
    }

    /// Publish raw bytes without a connection, as another producer would.
    ///
    /// Returns the number of queues the message reached.
    pub fn inject(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> usize {
        let message = OutgoingMessage::new(exchange, routing_key, body);
        self.lock().route(StoredMessage::from_outgoing(&message))
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(MessagingError::Connection("broker unreachable".to_string()));
        }
        let token = CancellationToken::new();
        state.connections_opened += 1;
        state.live.push(token.clone());
        drop(state);

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            token,
            closed: AtomicBool::new(false),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    token: CancellationToken,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check_open(&self) -> MessagingResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MessagingError::Connection("connection closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        !self.token.is_cancelled() && !self.broker.lock().unreachable
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> MessagingResult<()> {
        self.check_open()?;
        let mut state = self.broker.lock();

        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(MessagingError::Broker(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> MessagingResult<()> {
        self.check_open()?;
        let mut state = self.broker.lock();

        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(MessagingError::Broker(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                        acked: 0,
                        rejected: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.check_open()?;
        let mut state = self.broker.lock();

        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::Broker(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Broker(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, message: &OutgoingMessage) -> MessagingResult<PublishConfirm> {
        self.check_open()?;
        let mut state = self.broker.lock();

        match state.publish_failures.get(&message.exchange) {
            Some(PublishFailure::Error) => {
                return Err(MessagingError::Broker("injected publish failure".to_string()));
            }
            Some(PublishFailure::Nack) => return Ok(PublishConfirm::Nacked),
            None => {}
        }

        if !message.exchange.is_empty() && !state.exchanges.contains_key(&message.exchange) {
            return Err(MessagingError::Broker(format!(
                "NOT_FOUND - no exchange '{}'",
                message.exchange
            )));
        }

        let routed = state.route(StoredMessage::from_outgoing(message));
        if routed == 0 && message.mandatory {
            return Ok(PublishConfirm::Returned);
        }
        Ok(PublishConfirm::Acked)
    }

    async fn consume(&self, queue: &str, _prefetch: u16) -> MessagingResult<DeliveryStream> {
        self.check_open()?;

        let notify = self
            .broker
            .lock()
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| MessagingError::Subscribe(format!("NOT_FOUND - no queue '{}'", queue)))?;

        let source = QueueSource {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            notify,
            token: self.token.clone(),
        };

        let stream = futures_util::stream::unfold(source, |source| async move {
            let delivery = source.next_delivery().await?;
            Some((Ok::<_, MessagingError>(delivery), source))
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> MessagingResult<()> {
        self.token.cancel();
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.broker.lock();
            state.connections_closed += 1;
            state.live.retain(|token| !token.is_cancelled());
        }
        Ok(())
    }
}

struct QueueSource {
    broker: MemoryBroker,
    queue: String,
    notify: Arc<Notify>,
    token: CancellationToken,
}

impl QueueSource {
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }

            let popped = {
                let mut state = self.broker.lock();
                if state.unreachable {
                    return None;
                }
                state.queues.get_mut(&self.queue).and_then(|q| q.ready.pop_front())
            };

            if let Some(message) = popped {
                let acker = MemoryAcker {
                    broker: self.broker.clone(),
                    queue: self.queue.clone(),
                    message: message.clone(),
                    token: self.token.clone(),
                };
                return Some(Delivery::new(
                    message.body,
                    message.routing_key,
                    message.headers,
                    message.redelivered,
                    Box::new(acker),
                ));
            }

            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    message: StoredMessage,
    token: CancellationToken,
}

impl MemoryAcker {
    // Unsettled deliveries go back to the queue when their connection closes.
    fn check_open(&self) -> MessagingResult<()> {
        if self.token.is_cancelled() {
            self.broker.lock().requeue(&self.queue, self.message.clone());
            return Err(MessagingError::ChannelClosed("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.check_open()?;
        if let Some(q) = self.broker.lock().queues.get_mut(&self.queue) {
            q.acked += 1;
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> MessagingResult<()> {
        self.check_open()?;
        let mut state = self.broker.lock();
        if let Some(q) = state.queues.get_mut(&self.queue) {
            q.rejected += 1;
        }

        if requeue {
            state.requeue(&self.queue, self.message.clone());
        } else {
            state.dead_letter(&self.queue, self.message.clone());
        }
        Ok(())
    }
}
