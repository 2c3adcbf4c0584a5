//! RabbitMQ transport

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind, acker,
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RabbitMqSettings;
use crate::error::{MessagingError, MessagingResult};
use crate::message::{Acker, Delivery, OutgoingMessage, PublishConfirm};
use crate::transport::{
    BrokerConnection, BrokerConnector, DeliveryStream, ExchangeSpec, QueueSpec,
};

/// Opens RabbitMQ connections.
#[derive(Debug, Clone)]
pub struct RabbitMqConnector {
    settings: RabbitMqSettings,
}

impl RabbitMqConnector {
    /// Create a connector.
    pub fn new(settings: RabbitMqSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        info!(uri = %self.settings.redacted_uri(), "Connecting to RabbitMQ");

        let uri = self.settings.amqp_uri();
        let timeout = self.settings.connection_timeout;

        let connection =
            tokio::time::timeout(timeout, Connection::connect(&uri, ConnectionProperties::default()))
                .await
                .map_err(|_| {
                    MessagingError::Connection(format!("timed out after {:?}", timeout))
                })?
                .map_err(|e| MessagingError::Connection(e.to_string()))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        // Confirms are what surface returned and nacked publishes
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!("Connected to RabbitMQ successfully");

        Ok(Arc::new(RabbitMqConnection {
            connection,
            publish_channel,
            consume_channels: Mutex::new(Vec::new()),
        }))
    }

    fn describe(&self) -> String {
        self.settings.redacted_uri()
    }
}

/// An open RabbitMQ connection.
///
/// Declarations and publishes share one confirm-mode channel; each
/// subscription gets its own channel.
pub struct RabbitMqConnection {
    connection: Connection,
    publish_channel: Channel,
    consume_channels: Mutex<Vec<Channel>>,
}

fn string_table(values: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        table.insert(
            key.clone().into(),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

fn headers_of(props: &BasicProperties) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            match value {
                AMQPValue::LongString(s) => {
                    headers.insert(key.to_string(), s.to_string());
                }
                AMQPValue::ShortString(s) => {
                    headers.insert(key.to_string(), s.to_string());
                }
                _ => {}
            }
        }
    }
    headers
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> MessagingResult<()> {
        self.publish_channel
            .exchange_declare(
                spec.name.as_str().into(),
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(exchange = %spec.name, "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> MessagingResult<()> {
        let mut arguments = BTreeMap::new();
        if let Some(target) = &spec.dead_letter {
            arguments.insert("x-dead-letter-exchange".to_string(), target.exchange.clone());
            arguments.insert(
                "x-dead-letter-routing-key".to_string(),
                target.routing_key.clone(),
            );
        }

        self.publish_channel
            .queue_declare(
                spec.name.as_str().into(),
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                string_table(&arguments),
            )
            .await?;
        debug!(queue = %spec.name, "Queue declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.publish_channel
            .queue_bind(
                queue.into(),
                exchange.into(),
                routing_key.into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(
            queue = queue,
            exchange = exchange,
            routing_key = routing_key,
            "Queue bound to exchange"
        );
        Ok(())
    }

    async fn publish(&self, message: &OutgoingMessage) -> MessagingResult<PublishConfirm> {
        let mut props = BasicProperties::default()
            .with_message_id(message.id.clone().into())
            .with_content_type(message.content_type.clone().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        if message.persistent {
            props = props.with_delivery_mode(2);
        }

        if !message.headers.is_empty() {
            props = props.with_headers(string_table(&message.headers));
        }

        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            message_id = %message.id,
            mandatory = message.mandatory,
            "Publishing message"
        );

        let confirm = self
            .publish_channel
            .basic_publish(
                message.exchange.as_str().into(),
                message.routing_key.as_str().into(),
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    ..Default::default()
                },
                &message.body,
                props,
            )
            .await?
            .await?;

        Ok(match confirm {
            Confirmation::Ack(Some(_)) => PublishConfirm::Returned,
            Confirmation::Nack(_) => PublishConfirm::Nacked,
            _ => PublishConfirm::Acked,
        })
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> MessagingResult<DeliveryStream> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer_tag = format!("catbus-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue.into(),
                consumer_tag.as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

        self.consume_channels.lock().await.push(channel);
        info!(queue, consumer_tag = %consumer_tag, "Subscribed to queue");

        let stream = consumer.map(|result| {
            result.map_err(MessagingError::from).map(|delivery| {
                let headers = headers_of(&delivery.properties);
                Delivery::new(
                    delivery.data,
                    delivery.routing_key.to_string(),
                    headers,
                    delivery.redelivered,
                    Box::new(LapinAcker(delivery.acker)),
                )
            })
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> MessagingResult<()> {
        info!("Closing RabbitMQ connection");

        for channel in self.consume_channels.lock().await.drain(..) {
            if let Err(e) = channel.close(200, "Normal shutdown".into()).await {
                warn!(error = %e, "Error closing channel");
            }
        }

        if !self.connection.status().connected() {
            return Ok(());
        }

        self.connection
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

struct LapinAcker(acker::Acker);

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::Acknowledge(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> MessagingResult<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::Acknowledge(e.to_string()))
    }
}
