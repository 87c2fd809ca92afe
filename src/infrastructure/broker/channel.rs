//! Transport seam between the push queues and an AMQP channel.
//!
//! The queue engines only need a handful of channel operations. Keeping them
//! behind [`BrokerChannel`] lets the same engines run against a real broker
//! ([`LapinChannel`](super::LapinChannel)) or the in-process
//! [`InMemoryBroker`](super::InMemoryBroker).

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Flags for a queue declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Survives broker restarts; shared between connections.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Private to the declaring connection and removed with it.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Optional `x-*` arguments of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-message-ttl`, in milliseconds
    pub message_ttl_ms: Option<u32>,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
}

/// Application headers carried by queue messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// A message about to be published.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
    /// Delivery mode 2
    pub persistent: bool,
}

/// A message pushed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}

/// An active consumer on one queue.
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: BoxStream<'static, Result<Delivery>>,
}

/// Channel operations used by the push queues.
///
/// Implementations are shared between queues (one channel, many queues).
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue and return its name. An empty `name` asks the broker
    /// to generate one.
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<String>;

    /// Declare a durable or transient fanout exchange.
    async fn exchange_declare_fanout(&self, name: &str, durable: bool) -> Result<()>;

    /// Bind `queue` to a fanout `exchange`.
    async fn queue_bind(&self, queue: &str, exchange: &str) -> Result<()>;

    /// Publish through `exchange` (empty for the default exchange).
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutgoingMessage)
        -> Result<()>;

    /// Start pushing deliveries from `queue`.
    async fn consume(&self, queue: &str) -> Result<Subscription>;

    /// Stop a consumer started by [`BrokerChannel::consume`].
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Drop every ready message in `queue`, returning how many were removed.
    async fn purge(&self, queue: &str) -> Result<u32>;
}
