//! Reply channel on a broker queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::{timeout_at, Instant};

use super::queue::{outgoing_message, BACKEND};
use crate::broker::{BrokerChannel, Delivery, QueueArguments, QueueOptions, Subscription};
use crate::error::{validate_queue_name, Result};
use crate::metrics::{ACKED_TOTAL, PUBLISHED_TOTAL, REPLIES_DISCARDED_TOTAL};
use crate::queue::envelope::non_empty;
use crate::queue::reply::{new_correlation_id, ReplyState};
use crate::queue::{Envelope, Handler, PublishReceipt, ReplyQueue};

/// Responses delivered by the broker to one reply queue.
///
/// Without a name the channel declares a private, server-named queue and a
/// fresh correlation id. A named channel attaches to a queue its owner
/// declared, which is how responders publish. Deliveries for other
/// correlation ids are acked and dropped.
pub struct AmqpReplyQueue {
    name: String,
    channel: Arc<dyn BrokerChannel>,
    state: ReplyState,
}

impl AmqpReplyQueue {
    pub async fn new(channel: Arc<dyn BrokerChannel>, name: Option<&str>) -> Result<Self> {
        let (name, correlation_id) = match non_empty(name) {
            Some(name) => {
                validate_queue_name(name)?;
                (name.to_string(), None)
            }
            None => {
                let name = channel
                    .queue_declare("", QueueOptions::exclusive(), QueueArguments::default())
                    .await?;
                tracing::info!(queue = %name, "Private reply queue declared");
                (name, Some(new_correlation_id()))
            }
        };

        Ok(Self {
            name,
            channel,
            state: ReplyState::new(correlation_id),
        })
    }

    fn envelope(delivery: &Delivery) -> Result<Envelope> {
        let payload: serde_json::Value = serde_json::from_slice(&delivery.body)?;
        Ok(Envelope::new(payload)
            .with_id(delivery.delivery_tag)
            .with_attempts(u32::from(delivery.redelivered))
            .with_reply_to(delivery.headers.reply_to.clone())
            .with_correlation_id(delivery.headers.correlation_id.clone()))
    }

    async fn receive(
        &mut self,
        subscription: &mut Subscription,
        handler: &mut (dyn Handler<dyn ReplyQueue> + '_),
        deadline: Instant,
    ) -> Result<()> {
        while !self.state.is_satisfied() {
            let delivery = match timeout_at(deadline, subscription.deliveries.next()).await {
                Err(_elapsed) => break,
                Ok(None) => break,
                Ok(Some(delivery)) => delivery?,
            };

            if !self.state.matches(delivery.headers.correlation_id.as_deref()) {
                self.channel.ack(delivery.delivery_tag).await?;
                REPLIES_DISCARDED_TOTAL.inc();
                tracing::debug!(
                    queue = %self.name,
                    correlation_id = ?delivery.headers.correlation_id,
                    "Discarded reply for another caller"
                );
                continue;
            }

            let envelope = Self::envelope(&delivery)?;
            handler.handle(&*self, envelope).await?;
            self.channel.ack(delivery.delivery_tag).await?;
            ACKED_TOTAL.with_label_values(&[BACKEND]).inc();

            self.state.record_response();
            tracing::trace!(
                queue = %self.name,
                responses = self.state.responses(),
                expected = ?self.state.expected(),
                "Reply delivered"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ReplyQueue for AmqpReplyQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn correlation_id(&self) -> Option<&str> {
        self.state.correlation_id()
    }

    fn set_correlation_id(&mut self, correlation_id: String) {
        self.state.set_correlation_id(correlation_id);
    }

    async fn publish(&self, envelope: Envelope) -> Result<PublishReceipt> {
        let correlation_id = self.state.outgoing_correlation_id(&envelope)?;
        let message = outgoing_message(&envelope, Some(correlation_id.as_str()))?;
        self.channel.publish("", &self.name, message).await?;

        PUBLISHED_TOTAL.with_label_values(&[BACKEND]).inc();
        tracing::debug!(queue = %self.name, correlation_id = %correlation_id, "Reply published");
        Ok(PublishReceipt::Accepted)
    }

    async fn consume(
        &mut self,
        handler: &mut (dyn Handler<dyn ReplyQueue> + '_),
        timeout: Duration,
    ) -> Result<()> {
        if self.state.is_satisfied() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut subscription = self.channel.consume(&self.name).await?;
        let result = self.receive(&mut subscription, handler, deadline).await;

        if let Err(e) = self.channel.cancel(&subscription.consumer_tag).await {
            tracing::warn!(queue = %self.name, error = %e, "Failed to cancel reply consumer");
        }
        result
    }

    fn set_expected_response_count(&mut self, count: Option<u32>) {
        self.state.set_expected(count);
    }

    fn increment_expected_response_count(&mut self, by: u32) {
        self.state.increment_expected(by);
    }

    fn expected_response_count(&self) -> Option<u32> {
        self.state.expected()
    }

    fn responses(&self) -> u32 {
        self.state.responses()
    }
}
