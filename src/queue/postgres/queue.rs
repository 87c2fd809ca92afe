//! PostgreSQL polling queue.
//!
//! Consumers claim one row at a time with a single conditional update, so
//! any number of processes can consume the same queue concurrently.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::table::QueueTable;
use crate::error::{validate_queue_name, Result};
use crate::metrics::{ACKED_TOTAL, CLAIMED_TOTAL, NACKED_TOTAL, PUBLISHED_TOTAL};
use crate::queue::polling::PollTimer;
use crate::queue::{Envelope, Handler, PublishReceipt, Queue};

pub(crate) const BACKEND: &str = "postgres";

/// A polling queue stored in table `"q_<name>"`.
#[derive(Debug, Clone)]
pub struct PgQueue {
    name: String,
    table: QueueTable,
    pool: PgPool,
}

impl PgQueue {
    /// Open a queue, creating its table if needed.
    pub async fn new(pool: PgPool, name: &str) -> Result<Self> {
        let queue = Self::attach(pool, name)?;
        queue.declare().await?;
        Ok(queue)
    }

    /// Open a queue without touching the database.
    ///
    /// Fails with `InvalidName` when `name` cannot be mapped to a table.
    pub fn attach(pool: PgPool, name: &str) -> Result<Self> {
        validate_queue_name(name)?;
        Ok(Self {
            name: name.to_string(),
            table: QueueTable::new(name),
            pool,
        })
    }

    /// Create the queue table and status index if missing.
    pub async fn declare(&self) -> Result<()> {
        self.table.create(&self.pool, false).await?;
        tracing::info!(queue = %self.name, table = %self.table.ident(), "Queue table declared");
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Envelope>> {
        let envelope = self.table.claim(&self.pool, None).await?;
        if let Some(envelope) = &envelope {
            CLAIMED_TOTAL.inc();
            tracing::trace!(
                queue = %self.name,
                id = ?envelope.id(),
                attempts = envelope.attempts(),
                "Message claimed"
            );
        }
        Ok(envelope)
    }
}

#[async_trait]
impl Queue for PgQueue {
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
        let queueid = self
            .table
            .insert(&self.pool, &envelope, envelope.correlation_id(), visible_at)
            .await?;

        PUBLISHED_TOTAL.with_label_values(&[BACKEND]).inc();
        tracing::debug!(
            queue = %self.name,
            id = queueid,
            scheduled = ?visible_at,
            "Message published"
        );

        Ok(PublishReceipt::Accepted)
    }

    async fn consume(
        &self,
        handler: &mut (dyn Handler<dyn Queue> + '_),
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let timer = PollTimer::start(timeout, poll_interval);
        loop {
            match self.claim().await? {
                Some(envelope) => {
                    handler.handle(self, envelope).await?;
                    if timer.expired() {
                        break;
                    }
                }
                None => {
                    if !timer.idle().await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn drain(&self, handler: &mut (dyn Handler<dyn Queue> + '_)) -> Result<()> {
        while let Some(envelope) = self.claim().await? {
            handler.handle(self, envelope).await?;
        }
        Ok(())
    }

    async fn ack(&self, envelope: &Envelope) -> Result<()> {
        let Some(id) = envelope.id() else {
            tracing::debug!(queue = %self.name, "Ack of an unclaimed message ignored");
            return Ok(());
        };

        if self.table.delete(&self.pool, id).await? {
            ACKED_TOTAL.with_label_values(&[BACKEND]).inc();
            tracing::trace!(queue = %self.name, id = id, "Message acked");
        } else {
            tracing::debug!(queue = %self.name, id = id, "Message already acked");
        }
        Ok(())
    }

    async fn nack(&self, envelope: &Envelope) -> Result<()> {
        let Some(id) = envelope.id() else {
            tracing::debug!(queue = %self.name, "Nack of an unclaimed message ignored");
            return Ok(());
        };

        if self.table.release(&self.pool, id).await? {
            NACKED_TOTAL.inc();
            tracing::debug!(
                queue = %self.name,
                id = id,
                attempts = envelope.attempts() + 1,
                "Message returned to queue"
            );
        }
        Ok(())
    }

    async fn message_count(&self) -> Result<Option<u64>> {
        Ok(Some(self.table.count_ready(&self.pool).await?))
    }

    async fn total_message_count(&self) -> Result<Option<u64>> {
        Ok(Some(self.table.count_total(&self.pool).await?))
    }

    async fn empty_queue(&self) -> Result<()> {
        self.table.truncate(&self.pool).await?;
        tracing::info!(queue = %self.name, "Queue emptied");
        Ok(())
    }
}
