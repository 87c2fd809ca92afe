//! AMQP channel backed by `lapin`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use super::channel::{
    BrokerChannel, Delivery, MessageHeaders, OutgoingMessage, QueueArguments, QueueOptions,
    Subscription,
};
use crate::error::{QueueError, Result};

const HEADER_CORRELATION_ID: &str = "correlation_id";
const HEADER_REPLY_TO: &str = "reply_to";

/// Errors raised while establishing the AMQP connection.
#[derive(Debug, Error)]
pub enum AmqpConnectionError {
    #[error("amqp connect: {0}")]
    Connect(#[source] lapin::Error),

    #[error("amqp channel: {0}")]
    Channel(#[source] lapin::Error),
}

/// One AMQP connection and the channel all queues share.
#[derive(Clone)]
pub struct LapinChannel {
    _connection: std::sync::Arc<Connection>,
    channel: Channel,
}

impl LapinChannel {
    pub async fn connect(uri: &str) -> std::result::Result<Self, AmqpConnectionError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(AmqpConnectionError::Connect)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(AmqpConnectionError::Channel)?;

        tracing::info!(channel_id = channel.id(), "AMQP channel opened");

        Ok(Self {
            _connection: std::sync::Arc::new(connection),
            channel,
        })
    }

    /// Wrap a channel opened elsewhere.
    pub fn from_parts(connection: Connection, channel: Channel) -> Self {
        Self {
            _connection: std::sync::Arc::new(connection),
            channel,
        }
    }
}

fn declare_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(ttl) = arguments.message_ttl_ms {
        table.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongInt(i32::try_from(ttl).unwrap_or(i32::MAX)),
        );
    }
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }
    table
}

fn header_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(correlation_id) = &headers.correlation_id {
        table.insert(
            ShortString::from(HEADER_CORRELATION_ID),
            AMQPValue::LongString(LongString::from(correlation_id.as_str())),
        );
    }
    if let Some(reply_to) = &headers.reply_to {
        table.insert(
            ShortString::from(HEADER_REPLY_TO),
            AMQPValue::LongString(LongString::from(reply_to.as_str())),
        );
    }
    table
}

/// Header values may arrive as strings or numbers depending on the producer.
fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::LongUInt(n) => Some(n.to_string()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        AMQPValue::ShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortUInt(n) => Some(n.to_string()),
        _ => None,
    }
}

fn read_headers(properties: &BasicProperties) -> MessageHeaders {
    let Some(table) = properties.headers().as_ref() else {
        return MessageHeaders::default();
    };
    let get = |key: &str| {
        table
            .inner()
            .get(&ShortString::from(key))
            .and_then(header_value)
    };
    MessageHeaders {
        correlation_id: get(HEADER_CORRELATION_ID),
        reply_to: get(HEADER_REPLY_TO),
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    #[instrument(level = "debug", skip(self, arguments))]
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                declare_arguments(&arguments),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    #[instrument(level = "debug", skip(self))]
    async fn exchange_declare_fanout(&self, name: &str, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn queue_bind(&self, queue: &str, exchange: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, message))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        let mut properties = BasicProperties::default().with_headers(header_table(&message.headers));
        if message.persistent {
            properties = properties.with_delivery_mode(2);
        }
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn consume(&self, queue: &str) -> Result<Subscription> {
        let consumer_tag = format!("queue-bridge-{}", Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer
            .map(|delivery| {
                let d = delivery.map_err(QueueError::from)?;
                Ok(Delivery {
                    delivery_tag: d.delivery_tag,
                    redelivered: d.redelivered,
                    headers: read_headers(&d.properties),
                    body: d.data,
                })
            })
            .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    #[instrument(level = "debug", skip(self))]
    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn purge(&self, queue: &str) -> Result<u32> {
        let purged = self
            .channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_arguments() {
        let table = declare_arguments(&QueueArguments {
            message_ttl_ms: Some(5000),
            dead_letter_exchange: Some("ex_jobs".into()),
        });
        let inner = table.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongInt(5000))
        );
        assert!(inner.contains_key(&ShortString::from("x-dead-letter-exchange")));
    }

    #[test]
    fn test_empty_arguments() {
        assert!(declare_arguments(&QueueArguments::default()).inner().is_empty());
    }

    #[test]
    fn test_headers_round_trip() {
        let headers = MessageHeaders {
            correlation_id: Some("abc123".into()),
            reply_to: Some("amq.gen-1".into()),
        };
        let properties = BasicProperties::default().with_headers(header_table(&headers));

        assert_eq!(read_headers(&properties), headers);
    }

    #[test]
    fn test_numeric_header_values() {
        assert_eq!(header_value(&AMQPValue::LongLongInt(42)), Some("42".into()));
        assert_eq!(header_value(&AMQPValue::Boolean(true)), None);
    }
}
