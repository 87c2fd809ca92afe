//! AMQP push queue.
//!
//! Publishing goes straight to the broker. Consumption is the broker's own
//! push delivery, so the polling-style consume/ack surface is unsupported.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::broker::{
    BrokerChannel, DeclaredQueues, ManagementApi, MessageHeaders, OutgoingMessage,
    QueueArguments, QueueOptions,
};
use crate::error::{validate_queue_name, QueueError, Result};
use crate::metrics::PUBLISHED_TOTAL;
use crate::queue::envelope::non_empty;
use crate::queue::{Envelope, Handler, PublishReceipt, Queue};

pub(crate) const BACKEND: &str = "amqp";

/// Declare a durable queue once per registry.
pub(super) async fn declare_durable(
    channel: &dyn BrokerChannel,
    declared: &DeclaredQueues,
    name: &str,
    arguments: QueueArguments,
) -> Result<()> {
    if !declared.mark(name) {
        return Ok(());
    }
    if let Err(e) = channel
        .queue_declare(name, QueueOptions::durable(), arguments)
        .await
    {
        declared.forget(name);
        return Err(e);
    }
    tracing::info!(queue = %name, "Broker queue declared");
    Ok(())
}

/// Warn when a message carries only half of the RPC header pair.
pub(super) fn check_rpc_headers(queue: &str, envelope: &Envelope) {
    let correlation_id = non_empty(envelope.correlation_id());
    let reply_to = non_empty(envelope.reply_to());

    if correlation_id.is_some() != reply_to.is_some() {
        tracing::warn!(
            queue = %queue,
            correlation_id = ?correlation_id,
            reply_to = ?reply_to,
            "Message carries only one of correlation_id and reply_to"
        );
    }
}

/// Serialize an envelope into a persistent broker message.
pub(super) fn outgoing_message(
    envelope: &Envelope,
    correlation_id: Option<&str>,
) -> Result<OutgoingMessage> {
    Ok(OutgoingMessage {
        body: serde_json::to_vec(envelope.payload())?,
        headers: MessageHeaders {
            correlation_id: non_empty(correlation_id).map(str::to_string),
            reply_to: non_empty(envelope.reply_to()).map(str::to_string),
        },
        persistent: true,
    })
}

/// Read `messages_ready` for `queue`, logging instead of failing.
pub(super) async fn ready_count(
    management: Option<&ManagementApi>,
    queue: &str,
) -> Option<u64> {
    let Some(management) = management else {
        tracing::debug!(queue = %queue, "No management API configured, message count unknown");
        return None;
    };
    match management.messages_ready(queue).await {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(queue = %queue, error = %e, "Failed to read queue depth from management API");
            None
        }
    }
}

/// A durable broker queue addressed through the default exchange.
#[derive(Clone)]
pub struct AmqpQueue {
    name: String,
    channel: Arc<dyn BrokerChannel>,
    management: Option<ManagementApi>,
}

impl AmqpQueue {
    /// Open a queue, declaring it unless `declared` already has it.
    pub async fn new(
        channel: Arc<dyn BrokerChannel>,
        declared: &DeclaredQueues,
        management: Option<ManagementApi>,
        name: &str,
    ) -> Result<Self> {
        validate_queue_name(name)?;
        declare_durable(channel.as_ref(), declared, name, QueueArguments::default()).await?;

        Ok(Self {
            name: name.to_string(),
            channel,
            management,
        })
    }
}

#[async_trait]
impl Queue for AmqpQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn publish(
        &self,
        envelope: Envelope,
        visible_at: Option<DateTime<Utc>>,
    ) -> Result<PublishReceipt> {
        if visible_at.is_some() {
            return Err(QueueError::UnsupportedOperation(
                "per-message delay on a broker queue",
            ));
        }

        check_rpc_headers(&self.name, &envelope);
        let message = outgoing_message(&envelope, envelope.correlation_id())?;
        self.channel.publish("", &self.name, message).await?;

        PUBLISHED_TOTAL.with_label_values(&[BACKEND]).inc();
        tracing::debug!(queue = %self.name, "Message published");
        Ok(PublishReceipt::Accepted)
    }

    async fn consume(
        &self,
        _handler: &mut (dyn Handler<dyn Queue> + '_),
        _timeout: Duration,
        _poll_interval: Duration,
    ) -> Result<()> {
        Err(QueueError::UnsupportedOperation("consume on a broker queue"))
    }

    async fn drain(&self, _handler: &mut (dyn Handler<dyn Queue> + '_)) -> Result<()> {
        Err(QueueError::UnsupportedOperation("drain on a broker queue"))
    }

    async fn ack(&self, _envelope: &Envelope) -> Result<()> {
        Err(QueueError::UnsupportedOperation("ack on a broker queue"))
    }

    async fn nack(&self, _envelope: &Envelope) -> Result<()> {
        Err(QueueError::UnsupportedOperation("nack on a broker queue"))
    }

    async fn message_count(&self) -> Result<Option<u64>> {
        Ok(ready_count(self.management.as_ref(), &self.name).await)
    }

    async fn total_message_count(&self) -> Result<Option<u64>> {
        Err(QueueError::UnsupportedOperation(
            "total message count on a broker queue",
        ))
    }

    async fn empty_queue(&self) -> Result<()> {
        let purged = self.channel.purge(&self.name).await?;
        tracing::info!(queue = %self.name, purged = purged, "Queue emptied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use serde_json::json;

    async fn open(broker: &InMemoryBroker, declared: &DeclaredQueues, name: &str) -> AmqpQueue {
        AmqpQueue::new(Arc::new(broker.clone()), declared, None, name)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_declares_durable_queue_once() {
        let broker = InMemoryBroker::new();
        let declared = DeclaredQueues::new();

        open(&broker, &declared, "jobs").await;
        open(&broker, &declared, "jobs").await;

        assert_eq!(broker.declare_calls(), 1);
        assert_eq!(broker.queue_options("jobs"), Some(QueueOptions::durable()));
    }

    #[tokio::test]
    async fn test_name_length_limit() {
        let broker = InMemoryBroker::new();
        let declared = DeclaredQueues::new();

        let name = "a".repeat(62);
        open(&broker, &declared, &name).await;
        assert!(broker.queue_exists(&name));

        let too_long = "a".repeat(63);
        let err = AmqpQueue::new(Arc::new(broker.clone()), &declared, None, &too_long)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::InvalidName { .. }));
        assert!(!broker.queue_exists(&too_long));
        assert_eq!(broker.declare_calls(), 1);

        let empty = AmqpQueue::new(Arc::new(broker.clone()), &declared, None, "").await;
        assert!(matches!(empty, Err(QueueError::InvalidName { .. })));
    }

    #[tokio::test]
    async fn test_failed_declare_is_retried() {
        let broker = InMemoryBroker::new();
        let declared = DeclaredQueues::new();
        broker
            .queue_declare(
                "jobs",
                QueueOptions::exclusive(),
                QueueArguments::default(),
            )
            .await
            .unwrap();

        let err = AmqpQueue::new(Arc::new(broker.clone()), &declared, None, "jobs").await;
        assert!(err.is_err());
        assert!(!declared.contains("jobs"));
    }

    #[tokio::test]
    async fn test_publish_sets_headers_and_persistence() {
        let broker = InMemoryBroker::new();
        let queue = open(&broker, &DeclaredQueues::new(), "jobs").await;

        let envelope = Envelope::new(json!({"n": 1}))
            .with_correlation_id(Some("c1".into()))
            .with_reply_to(Some("answers".into()));
        let receipt = queue.publish(envelope, None).await.unwrap();
        assert!(receipt.is_accepted());

        let mut sub = broker.consume("jobs").await.unwrap();
        let delivery = futures::StreamExt::next(&mut sub.deliveries)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.headers.correlation_id.as_deref(), Some("c1"));
        assert_eq!(delivery.headers.reply_to.as_deref(), Some("answers"));
        let body: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(body, json!({"n": 1}));
    }

    #[test]
    fn test_outgoing_message_is_persistent() {
        let message = outgoing_message(&Envelope::new(json!("x")), None).unwrap();
        assert!(message.persistent);
        assert_eq!(message.headers, MessageHeaders::default());
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let broker = InMemoryBroker::new();
        let queue = open(&broker, &DeclaredQueues::new(), "jobs").await;
        let envelope = Envelope::new(json!(1));

        let explicit = queue.publish(envelope.clone(), Some(Utc::now())).await;
        assert!(matches!(explicit, Err(QueueError::UnsupportedOperation(_))));
        assert_eq!(broker.depth("jobs"), 0);

        let mut sink: Vec<Envelope> = Vec::new();
        assert!(matches!(
            queue.consume(&mut sink, Duration::from_millis(1), Duration::from_millis(1)).await,
            Err(QueueError::UnsupportedOperation(_))
        ));
        assert!(matches!(queue.drain(&mut sink).await, Err(QueueError::UnsupportedOperation(_))));
        assert!(matches!(queue.ack(&envelope).await, Err(QueueError::UnsupportedOperation(_))));
        assert!(matches!(queue.nack(&envelope).await, Err(QueueError::UnsupportedOperation(_))));
        assert!(matches!(
            queue.total_message_count().await,
            Err(QueueError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_count_without_management_is_unknown() {
        let broker = InMemoryBroker::new();
        let queue = open(&broker, &DeclaredQueues::new(), "jobs").await;
        assert_eq!(queue.message_count().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_queue_purges() {
        let broker = InMemoryBroker::new();
        let queue = open(&broker, &DeclaredQueues::new(), "jobs").await;
        queue.publish(Envelope::new(json!(1)), None).await.unwrap();
        queue.publish(Envelope::new(json!(2)), None).await.unwrap();

        queue.empty_queue().await.unwrap();
        assert_eq!(broker.depth("jobs"), 0);
    }
}
