//! Fixed-delay broker queue built from TTL and dead-lettering.
//!
//! Topology for destination `jobs` with a 30 second delay:
//!
//! ```text
//! publish -> jobs_wait (x-message-ttl=30000, x-dead-letter-exchange=ex_jobs)
//!              -- expiry --> ex_jobs (fanout) -> jobs
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::queue::{check_rpc_headers, declare_durable, outgoing_message, ready_count, BACKEND};
use crate::broker::{BrokerChannel, DeclaredQueues, ManagementApi, QueueArguments};
use crate::error::{validate_queue_name, QueueError, Result};
use crate::metrics::PUBLISHED_TOTAL;
use crate::queue::{Envelope, Handler, PublishReceipt, Queue};

/// Name of the fanout exchange feeding `destination`.
pub fn delay_exchange_name(destination: &str) -> String {
    format!("ex_{}", destination)
}

/// Name of the queue holding messages until their delay expires.
pub fn wait_queue_name(destination: &str) -> String {
    format!("{}_wait", destination)
}

#[derive(Clone)]
pub struct AmqpDelayedQueue {
    destination: String,
    wait_queue: String,
    delay_seconds: u32,
    channel: Arc<dyn BrokerChannel>,
    management: Option<ManagementApi>,
}

impl AmqpDelayedQueue {
    /// Declare the destination, its exchange and binding, and the wait queue.
    pub async fn new(
        channel: Arc<dyn BrokerChannel>,
        declared: &DeclaredQueues,
        management: Option<ManagementApi>,
        destination: &str,
        delay_seconds: u32,
    ) -> Result<Self> {
        validate_queue_name(destination)?;

        let exchange = delay_exchange_name(destination);
        let wait_queue = wait_queue_name(destination);

        declare_durable(channel.as_ref(), declared, destination, QueueArguments::default())
            .await?;
        channel.exchange_declare_fanout(&exchange, true).await?;
        channel.queue_bind(destination, &exchange).await?;
        declare_durable(
            channel.as_ref(),
            declared,
            &wait_queue,
            QueueArguments {
                message_ttl_ms: Some(delay_seconds.saturating_mul(1000)),
                dead_letter_exchange: Some(exchange.clone()),
            },
        )
        .await?;

        tracing::info!(
            destination = %destination,
            wait_queue = %wait_queue,
            exchange = %exchange,
            delay_seconds = delay_seconds,
            "Delayed queue topology declared"
        );

        Ok(Self {
            destination: destination.to_string(),
            wait_queue,
            delay_seconds,
            channel,
            management,
        })
    }

    pub fn wait_queue(&self) -> &str {
        &self.wait_queue
    }

    pub fn delay_seconds(&self) -> u32 {
        self.delay_seconds
    }
}

#[async_trait]
impl Queue for AmqpDelayedQueue {
    /// The destination the delayed messages end up in.
    fn name(&self) -> &str {
        &self.destination
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
                "explicit delay on a fixed-delay queue",
            ));
        }

        check_rpc_headers(&self.wait_queue, &envelope);
        let message = outgoing_message(&envelope, envelope.correlation_id())?;
        self.channel.publish("", &self.wait_queue, message).await?;

        PUBLISHED_TOTAL.with_label_values(&[BACKEND]).inc();
        tracing::debug!(
            queue = %self.wait_queue,
            delay_seconds = self.delay_seconds,
            "Delayed message published"
        );
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

    /// Messages still waiting out their delay.
    async fn message_count(&self) -> Result<Option<u64>> {
        Ok(ready_count(self.management.as_ref(), &self.wait_queue).await)
    }

    async fn total_message_count(&self) -> Result<Option<u64>> {
        Err(QueueError::UnsupportedOperation(
            "total message count on a broker queue",
        ))
    }

    /// Drop messages that have not reached the destination yet.
    async fn empty_queue(&self) -> Result<()> {
        let purged = self.channel.purge(&self.wait_queue).await?;
        tracing::info!(queue = %self.wait_queue, purged = purged, "Queue emptied");
        Ok(())
    }
}
