//! Publisher and consumer behaviour against the in-memory broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use catbus_events::{
    CatCreatedEvent, CatDeletedEvent, CatEvent, EventError, EventKind, EventResult, OutboundEvent,
};
use catbus_messaging::*;
use catbus_scheduler::{
    DelayScheduler, JobState, JobStore, MemoryJobStore, ScheduledJob, SchedulerConfig,
};
use chrono::Utc;
use serde_json::{Map, Value};

#[derive(Debug)]
struct Unserializable;

impl OutboundEvent for Unserializable {
    fn type_name(&self) -> &str {
        "CatCreatedEvent"
    }

    fn routing_key(&self) -> Option<&str> {
        Some("cat.created")
    }

    fn to_envelope(&self) -> Option<EventResult<Map<String, Value>>> {
        Some(Err(EventError::Serialization(
            "name is not valid UTF-8".to_string(),
        )))
    }
}

#[derive(Debug)]
struct Keyless;

impl OutboundEvent for Keyless {
    fn type_name(&self) -> &str {
        "KeylessEvent"
    }

    fn to_envelope(&self) -> Option<EventResult<Map<String, Value>>> {
        let mut map = Map::new();
        map.insert("event_type".to_string(), Value::from("keyless"));
        Some(Ok(map))
    }
}

fn tom() -> CatCreatedEvent {
    CatCreatedEvent::new(42, "Tom", 3, "grey", "Siamese", Some(1))
}

fn publisher(broker: &MemoryBroker) -> Publisher {
    Publisher::new(Arc::new(broker.clone()), Topology::default())
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ========== Publisher ==========

#[tokio::test]
async fn test_publish_delivers_to_primary_queue() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker);

    let outcome = publisher.publish(&tom(), None).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Delivered);

    let delivered = broker.drain("cat_created_queue");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].routing_key, "cat.created");
    assert_eq!(delivered[0].content_type, "application/json");
    assert!(delivered[0].persistent);

    let event = CatEvent::from_slice(&delivered[0].body).unwrap();
    assert_eq!(event, CatEvent::Created(tom_with(&event)));
    assert_eq!(broker.queue_len("dlq.cat_created_queue"), 0);
}

// Timestamps are stamped at construction; compare everything else.
fn tom_with(event: &CatEvent) -> CatCreatedEvent {
    let mut expected = tom();
    if let CatEvent::Created(cat) = event {
        expected.created_at = cat.created_at;
    }
    expected
}

#[tokio::test]
async fn test_serialization_error_is_dead_lettered_once() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker);

    let outcome = publisher.publish(&Unserializable, None).await.unwrap();
    assert!(matches!(
        outcome,
        PublishOutcome::DeadLettered(DeadLetterReason::Serialization(_))
    ));

    let dead = broker.drain("dlq.cat_created_queue");
    assert_eq!(dead.len(), 1);
    assert!(dead[0].headers["x-error-reason"].starts_with("serialization error"));
    assert_eq!(dead[0].headers["original-routing-key"], "cat.created");
    assert_eq!(dead[0].content_type, "text/plain");
    assert_eq!(dead[0].body_text(), "Unserializable");
    assert_eq!(broker.queue_len("cat_created_queue"), 0);
}

#[tokio::test]
async fn test_unroutable_key_is_dead_lettered() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker);

    let outcome = publisher.publish(&tom(), Some("cat.adopted")).await.unwrap();
    assert_eq!(outcome, PublishOutcome::DeadLettered(DeadLetterReason::Unroutable));

    assert_eq!(broker.queue_len("cat_created_queue"), 0);
    let dead = broker.drain("dlq.cat_created_queue");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].headers["x-error-reason"], "unroutable");
    assert_eq!(dead[0].headers["original-routing-key"], "cat.adopted");

    // The original JSON is preserved verbatim
    let event = CatEvent::from_slice(&dead[0].body).unwrap();
    assert_eq!(event.cat_id(), 42);
}

#[tokio::test]
async fn test_event_without_routing_key_is_dead_lettered() {
    let broker = MemoryBroker::new();

    let outcome = publisher(&broker).publish(&Keyless, None).await.unwrap();
    assert_eq!(
        outcome,
        PublishOutcome::DeadLettered(DeadLetterReason::MissingRoutingKey)
    );

    let dead = broker.drain("dlq.cat_created_queue");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].headers["x-error-reason"], "missing routing key");
    assert_eq!(dead[0].body_text(), r#"{"event_type":"keyless"}"#);
}

#[tokio::test]
async fn test_nacked_publish_is_dead_lettered() {
    let broker = MemoryBroker::new();
    broker.fail_publishes_to("cats_events", PublishFailure::Nack);

    let outcome = publisher(&broker).publish(&tom(), None).await.unwrap();
    assert_eq!(outcome, PublishOutcome::DeadLettered(DeadLetterReason::Nacked));

    let dead = broker.drain("dlq.cat_created_queue");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].headers["x-error-reason"], "nacked");
}

#[tokio::test]
async fn test_transport_error_fails_and_reconnects() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker);
    publisher.connect().await.unwrap();

    broker.fail_publishes_to("cats_events", PublishFailure::Error);
    let result = publisher.publish(&tom(), None).await;
    assert!(matches!(result, Err(MessagingError::Publish(_))));

    let dead = broker.drain("dlq.cat_created_queue");
    assert_eq!(dead.len(), 1);
    assert!(dead[0].headers["x-error-reason"].starts_with("transport error"));
    assert!(!publisher.is_connected().await);

    broker.clear_publish_failures();
    let outcome = publisher.publish(&tom(), None).await.unwrap();
    assert!(outcome.is_delivered());
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn test_dead_letter_failure_is_swallowed() {
    let broker = MemoryBroker::new();
    broker.fail_publishes_to("dlx.cats.events", PublishFailure::Error);

    let outcome = publisher(&broker)
        .publish(&tom(), Some("cat.adopted"))
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::DeadLettered(DeadLetterReason::Unroutable));
    assert_eq!(broker.queue_len("dlq.cat_created_queue"), 0);
}

#[tokio::test]
async fn test_conflicting_topology_is_rejected() {
    let broker = MemoryBroker::new();

    // Someone declared the primary queue without a dead-letter exchange
    let conn = broker.connect().await.unwrap();
    conn.declare_queue(&QueueSpec::durable("cat_created_queue"))
        .await
        .unwrap();

    let result = publisher(&broker).connect().await;
    assert!(matches!(result, Err(MessagingError::Topology(_))));
}

#[tokio::test]
async fn test_topology_failure_closes_connection() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    conn.declare_queue(&QueueSpec::durable("cat_created_queue"))
        .await
        .unwrap();

    let publisher = publisher(&broker);
    for _ in 0..3 {
        let result = publisher.publish(&tom(), None).await;
        assert!(matches!(result, Err(MessagingError::Topology(_))));
    }

    assert_eq!(broker.connections_opened(), 4);
    assert_eq!(broker.open_connections(), 1);
    assert!(!publisher.is_connected().await);
}

#[tokio::test]
async fn test_reconnect_after_outage() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker);
    publisher.connect().await.unwrap();

    broker.set_unreachable(true);
    let result = publisher.publish(&tom(), None).await;
    assert!(matches!(result, Err(MessagingError::Connection(_))));

    broker.set_unreachable(false);
    assert!(publisher.publish(&tom(), None).await.unwrap().is_delivered());
    assert_eq!(broker.queue_len("cat_created_queue"), 1);
}

// ========== Consumer ==========

struct Fixture {
    broker: MemoryBroker,
    scheduler: Arc<DelayScheduler>,
    consumer: Consumer,
    calls: Arc<AtomicUsize>,
}

async fn consumer_fixture(delay: Duration) -> Fixture {
    let broker = MemoryBroker::new();
    let scheduler = Arc::new(DelayScheduler::new(
        SchedulerConfig::default().with_poll_interval(Duration::from_millis(20)),
    ));
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        Topology::default(),
        scheduler.clone(),
        ConsumerConfig::default().with_delay(delay),
    )
    .on_event(EventKind::CatCreated, move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    consumer.register_handlers().await;
    scheduler.start().await.unwrap();
    consumer.start().await.unwrap();

    Fixture {
        broker,
        scheduler,
        consumer,
        calls,
    }
}

#[tokio::test]
async fn test_consumer_schedules_delayed_job() {
    let fx = consumer_fixture(Duration::from_secs(60)).await;

    publisher(&fx.broker).publish(&tom(), None).await.unwrap();

    let scheduler = fx.scheduler.clone();
    let mut scheduled = false;
    for _ in 0..200 {
        if scheduler.pending("cat_created_delay_42").await.unwrap().is_some() {
            scheduled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(scheduled);

    let job = scheduler.pending("cat_created_delay_42").await.unwrap().unwrap();
    assert_eq!(job.handler, "cat_created_handler");
    assert_eq!(job.args["name"], "Tom");
    assert!(wait_until(|| fx.broker.acked("cat_created_queue") == 1).await);
    assert_eq!(fx.calls.load(Ordering::SeqCst), 0);

    fx.consumer.stop().await.unwrap();
    fx.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_runs_handler_after_delay() {
    let fx = consumer_fixture(Duration::from_millis(100)).await;

    publisher(&fx.broker).publish(&tom(), None).await.unwrap();

    let calls = fx.calls.clone();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1).await);
    assert_eq!(
        fx.scheduler.job_state("cat_created_delay_42").await.unwrap(),
        Some(JobState::Fired)
    );

    fx.consumer.stop().await.unwrap();
    fx.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_message_is_rejected_to_dead_letter_queue() {
    let fx = consumer_fixture(Duration::from_secs(60)).await;

    assert_eq!(fx.broker.inject("cats_events", "cat.created", "{not json"), 1);

    let broker = fx.broker.clone();
    assert!(wait_until(|| broker.rejected("cat_created_queue") == 1).await);
    // The dead-letter subscription logs and acks it
    assert!(wait_until(|| broker.acked("dlq.cat_created_queue") == 1).await);
    assert_eq!(fx.scheduler.pending_count().await.unwrap(), 0);

    fx.consumer.stop().await.unwrap();
    fx.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_event_type_is_acked() {
    let fx = consumer_fixture(Duration::from_secs(60)).await;

    fx.broker.inject(
        "cats_events",
        "cat.created",
        r#"{"event_type": "cat.adopted", "cat_id": 42}"#,
    );

    let broker = fx.broker.clone();
    assert!(wait_until(|| broker.acked("cat_created_queue") == 1).await);
    assert_eq!(broker.rejected("cat_created_queue"), 0);
    assert_eq!(fx.scheduler.pending_count().await.unwrap(), 0);

    fx.consumer.stop().await.unwrap();
    fx.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_other_kinds_use_their_own_job_ids() {
    let fx = consumer_fixture(Duration::from_secs(60)).await;

    let event = CatEvent::from(CatDeletedEvent::new(7));
    let body = event.to_json().unwrap();
    fx.broker.inject("cats_events", "cat.created", body);

    let scheduler = fx.scheduler.clone();
    let mut found = None;
    for _ in 0..200 {
        found = scheduler.pending("cat_deleted_delay_7").await.unwrap();
        if found.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(found.unwrap().handler, "cat_deleted_handler");

    fx.consumer.stop().await.unwrap();
    fx.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_lifecycle_errors() {
    let fx = consumer_fixture(Duration::from_secs(60)).await;

    assert!(fx.consumer.is_running().await);
    assert!(matches!(
        fx.consumer.start().await,
        Err(MessagingError::AlreadyRunning)
    ));

    fx.consumer.stop().await.unwrap();
    assert!(!fx.consumer.is_running().await);
    assert!(matches!(
        fx.consumer.stop().await,
        Err(MessagingError::NotRunning)
    ));

    fx.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_stops_running_when_connection_drops() {
    let fx = consumer_fixture(Duration::from_millis(50)).await;
    assert!(fx.consumer.is_running().await);

    fx.broker.drop_connections();

    let mut stopped = false;
    for _ in 0..200 {
        if !fx.consumer.is_running().await {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped);

    // A lost consumer can be started again and keeps handling events
    fx.consumer.start().await.unwrap();
    assert!(fx.consumer.is_running().await);
    publisher(&fx.broker).publish(&tom(), None).await.unwrap();

    let calls = fx.calls.clone();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1).await);

    fx.consumer.stop().await.unwrap();
    fx.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_resumed_due_job_runs_registered_handler() {
    let store = Arc::new(MemoryJobStore::new());
    let envelope = CatEvent::from(tom()).to_envelope().unwrap();
    store
        .upsert(ScheduledJob::new(
            "cat_created_delay_42",
            "cat_created_handler",
            Value::Object(envelope),
            Utc::now() - chrono::Duration::seconds(5),
        ))
        .await
        .unwrap();

    let broker = MemoryBroker::new();
    let scheduler = Arc::new(DelayScheduler::with_store(
        SchedulerConfig::default().with_poll_interval(Duration::from_millis(20)),
        store,
    ));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        Topology::default(),
        scheduler.clone(),
        ConsumerConfig::default(),
    )
    .on_event(EventKind::CatCreated, move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    consumer.register_handlers().await;
    scheduler.start().await.unwrap();
    // Let the timer pick the job up before the consumer connects
    tokio::time::sleep(Duration::from_millis(200)).await;
    consumer.start().await.unwrap();

    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1).await);
    assert_eq!(
        scheduler.job_state("cat_created_delay_42").await.unwrap(),
        Some(JobState::Fired)
    );

    consumer.stop().await.unwrap();
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_start_fails_when_broker_unreachable() {
    let broker = MemoryBroker::new();
    broker.set_unreachable(true);
    let scheduler = Arc::new(DelayScheduler::new(SchedulerConfig::default()));

    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        Topology::default(),
        scheduler,
        ConsumerConfig::default(),
    );

    assert!(matches!(
        consumer.start().await,
        Err(MessagingError::Connection(_))
    ));
    assert!(!consumer.is_running().await);
}
