//! Fixed-delay decorator over [`PgQueue`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::PgQueue;
use crate::error::{QueueError, Result};
use crate::queue::{Envelope, Handler, PublishReceipt, Queue};

/// Every published message becomes visible `delay_seconds` after publish.
#[derive(Debug, Clone)]
pub struct PgDelayedQueue {
    inner: PgQueue,
    delay_seconds: u32,
}

impl PgDelayedQueue {
    pub fn new(inner: PgQueue, delay_seconds: u32) -> Self {
        Self {
            inner,
            delay_seconds,
        }
    }

    pub fn delay_seconds(&self) -> u32 {
        self.delay_seconds
    }

    pub fn inner(&self) -> &PgQueue {
        &self.inner
    }
}

#[async_trait]
impl Queue for PgDelayedQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn backend(&self) -> &'static str {
        self.inner.backend()
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
        let visible_at = Utc::now() + chrono::Duration::seconds(i64::from(self.delay_seconds));
        self.inner.publish(envelope, Some(visible_at)).await
    }

    async fn consume(
        &self,
        handler: &mut (dyn Handler<dyn Queue> + '_),
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        self.inner.consume(handler, timeout, poll_interval).await
    }

    async fn drain(&self, handler: &mut (dyn Handler<dyn Queue> + '_)) -> Result<()> {
        self.inner.drain(handler).await
    }

    async fn ack(&self, envelope: &Envelope) -> Result<()> {
        self.inner.ack(envelope).await
    }

    async fn nack(&self, envelope: &Envelope) -> Result<()> {
        self.inner.nack(envelope).await
    }

    async fn message_count(&self) -> Result<Option<u64>> {
        self.inner.message_count().await
    }

    async fn total_message_count(&self) -> Result<Option<u64>> {
        self.inner.total_message_count().await
    }

    async fn empty_queue(&self) -> Result<()> {
        self.inner.empty_queue().await
    }
}
