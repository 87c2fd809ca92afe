//! Request/reply over a publish queue and a reply channel.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::queue::{Envelope, Handler, PublishReceipt, Queue, QueueFactory, ReplyQueue};

/// Publishes requests stamped with the reply channel's address and collects
/// the responses.
///
/// The reply channel is created through the factory on first use, so a
/// publisher that never waits for answers never declares one.
pub struct RpcQueue {
    queue: Arc<dyn Queue>,
    factory: Option<Arc<dyn QueueFactory>>,
    reply: Option<Box<dyn ReplyQueue>>,
    pending_expected: Option<u32>,
}

impl RpcQueue {
    pub fn new(queue: Arc<dyn Queue>, factory: Arc<dyn QueueFactory>) -> Self {
        Self {
            queue,
            factory: Some(factory),
            reply: None,
            pending_expected: None,
        }
    }

    /// Use an existing reply channel instead of creating one.
    pub fn with_reply_queue(queue: Arc<dyn Queue>, reply: Box<dyn ReplyQueue>) -> Self {
        Self {
            queue,
            factory: None,
            reply: Some(reply),
            pending_expected: None,
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    /// The queue requests are published to.
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// The reply channel, created on first call.
    pub async fn reply_queue(&mut self) -> Result<&mut (dyn ReplyQueue + 'static)> {
        let reply = match self.reply.take() {
            Some(reply) => reply,
            None => self.open_reply().await?,
        };
        Ok(self.reply.insert(reply).as_mut())
    }

    async fn open_reply(&mut self) -> Result<Box<dyn ReplyQueue>> {
        let factory = self.factory.as_ref().ok_or(QueueError::UnsupportedOperation(
            "reply channel without a factory",
        ))?;
        let mut reply = factory.rpc_reply(None).await?;
        reply.set_expected_response_count(self.pending_expected.take());

        tracing::debug!(
            queue = %self.queue.name(),
            reply_to = %reply.name(),
            correlation_id = ?reply.correlation_id(),
            "Reply channel opened"
        );
        Ok(reply)
    }

    /// Correlation id of the reply channel, if it exists yet.
    pub fn correlation_id(&self) -> Option<&str> {
        self.reply.as_deref().and_then(|reply| reply.correlation_id())
    }

    /// Publish a request addressed to this caller's reply channel.
    pub async fn publish(&mut self, envelope: Envelope) -> Result<PublishReceipt> {
        let (reply_to, correlation_id) = {
            let reply = self.reply_queue().await?;
            (
                reply.name().to_string(),
                reply.correlation_id().map(str::to_string),
            )
        };
        let correlation_id =
            correlation_id.or_else(|| envelope.correlation_id().map(str::to_string));

        let request = envelope
            .with_reply_to(Some(reply_to))
            .with_correlation_id(correlation_id);
        self.queue.publish(request, None).await
    }

    /// Wait for responses on the reply channel.
    pub async fn consume(
        &mut self,
        handler: &mut (dyn Handler<dyn ReplyQueue> + '_),
        timeout: Duration,
    ) -> Result<()> {
        self.reply_queue().await?.consume(handler, timeout).await
    }

    pub fn set_expected_response_count(&mut self, count: Option<u32>) {
        match self.reply.as_deref_mut() {
            Some(reply) => reply.set_expected_response_count(count),
            None => self.pending_expected = count,
        }
    }

    /// An unset count becomes `by`.
    pub fn increment_expected_response_count(&mut self, by: u32) {
        match self.reply.as_deref_mut() {
            Some(reply) => reply.increment_expected_response_count(by),
            None => {
                self.pending_expected = Some(self.pending_expected.unwrap_or(0).saturating_add(by))
            }
        }
    }

    pub fn expected_response_count(&self) -> Option<u32> {
        match self.reply.as_deref() {
            Some(reply) => reply.expected_response_count(),
            None => self.pending_expected,
        }
    }

    pub fn responses(&self) -> u32 {
        self.reply.as_deref().map_or(0, |reply| reply.responses())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerChannel, InMemoryBroker};
    use crate::queue::amqp::AmqpQueueFactory;
    use serde_json::json;

    fn factory(broker: &InMemoryBroker) -> Arc<dyn QueueFactory> {
        Arc::new(AmqpQueueFactory::new(Arc::new(broker.clone()), None))
    }

    #[tokio::test]
    async fn test_reply_channel_is_lazy() {
        let broker = InMemoryBroker::new();
        let rpc = factory(&broker).create_rpc("work").await.unwrap();

        assert_eq!(rpc.name(), "work");
        assert_eq!(rpc.correlation_id(), None);
        assert_eq!(broker.declare_calls(), 1);
    }

    #[tokio::test]
    async fn test_pending_expected_count_applies_on_creation() {
        let broker = InMemoryBroker::new();
        let mut rpc = factory(&broker).create_rpc("work").await.unwrap();

        rpc.increment_expected_response_count(2);
        rpc.increment_expected_response_count(1);
        assert_eq!(rpc.expected_response_count(), Some(3));

        let reply = rpc.reply_queue().await.unwrap();
        assert_eq!(reply.expected_response_count(), Some(3));
    }

    #[tokio::test]
    async fn test_publish_stamps_reply_address() {
        let broker = InMemoryBroker::new();
        let mut rpc = factory(&broker).create_rpc("work").await.unwrap();

        rpc.publish(Envelope::new(json!({"q": 1}))).await.unwrap();

        let reply_name = rpc.reply_queue().await.unwrap().name().to_string();
        let correlation_id = rpc.correlation_id().unwrap().to_string();

        let mut sub = broker.consume("work").await.unwrap();
        let delivery = futures::StreamExt::next(&mut sub.deliveries)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.headers.reply_to, Some(reply_name));
        assert_eq!(delivery.headers.correlation_id, Some(correlation_id));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let broker = InMemoryBroker::new();
        let factory = factory(&broker);
        let mut rpc = factory.create_rpc("work").await.unwrap();
        rpc.publish(Envelope::new(json!({"q": 2}))).await.unwrap();

        // Responder side
        let mut sub = broker.consume("work").await.unwrap();
        let request = futures::StreamExt::next(&mut sub.deliveries)
            .await
            .unwrap()
            .unwrap();
        let responder = factory
            .rpc_reply(request.headers.reply_to.as_deref())
            .await
            .unwrap();
        let answer = Envelope::new(json!({"a": 4}))
            .with_correlation_id(request.headers.correlation_id.clone());
        assert!(responder.publish(answer).await.unwrap().is_accepted());

        rpc.set_expected_response_count(Some(1));
        let mut responses: Vec<Envelope> = Vec::new();
        rpc.consume(&mut responses, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].payload(), &json!({"a": 4}));
        assert_eq!(rpc.responses(), 1);
    }
}
