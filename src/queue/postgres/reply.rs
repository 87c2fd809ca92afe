//! Reply channel stored in a polling table.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use super::queue::BACKEND;
use super::table::{is_undefined_table, QueueTable};
use crate::error::{validate_queue_name, QueueError, Result};
use crate::metrics::{ACKED_TOTAL, PUBLISHED_TOTAL};
use crate::queue::envelope::non_empty;
use crate::queue::polling::{PollTimer, DEFAULT_REPLY_POLL_INTERVAL};
use crate::queue::reply::{new_correlation_id, ReplyState};
use crate::queue::{Envelope, Handler, PublishReceipt, ReplyQueue};

/// Table shared by all self-named reply channels.
pub const SHARED_REPLY_QUEUE: &str = "_rpc_replies";

/// Responses for one caller, claimed by correlation id.
///
/// A channel opened without a name uses [`SHARED_REPLY_QUEUE`] and a fresh
/// correlation id; many callers share the table and only ever claim their
/// own rows. Delivered replies are deleted once the handler returns.
pub struct PgReplyQueue {
    name: String,
    table: QueueTable,
    pool: PgPool,
    state: ReplyState,
    poll_interval: Duration,
}

impl PgReplyQueue {
    /// Open a reply channel, creating its table if needed.
    pub async fn new(pool: PgPool, name: Option<&str>) -> Result<Self> {
        let queue = Self::attach(pool, name)?;
        queue.declare().await?;
        Ok(queue)
    }

    /// Open a reply channel without touching the database.
    ///
    /// Responders use this to publish into a caller's channel; publishing
    /// into a channel nobody declared yields
    /// [`PublishReceipt::QueueNotDeclared`].
    pub fn attach(pool: PgPool, name: Option<&str>) -> Result<Self> {
        let (name, correlation_id) = match non_empty(name) {
            Some(name) => (name.to_string(), None),
            None => (SHARED_REPLY_QUEUE.to_string(), Some(new_correlation_id())),
        };
        validate_queue_name(&name)?;

        Ok(Self {
            table: QueueTable::new(&name),
            name,
            pool,
            state: ReplyState::new(correlation_id),
            poll_interval: DEFAULT_REPLY_POLL_INTERVAL,
        })
    }

    /// Sleep between empty claims while waiting for replies.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Create the table with its status and correlation indexes.
    pub async fn declare(&self) -> Result<()> {
        self.table.create(&self.pool, true).await?;
        tracing::info!(queue = %self.name, "Reply table declared");
        Ok(())
    }

    /// Replies stored under this channel's correlation id (or all rows when
    /// the channel has none) that are not yet claimed.
    pub async fn pending(&self) -> Result<u64> {
        match self.state.correlation_id() {
            None => self.table.count_total(&self.pool).await,
            Some(correlation_id) => {
                let sql = format!(
                    "SELECT COUNT(*) FROM {} WHERE locked = FALSE AND correlation_id = $1",
                    self.table.ident()
                );
                match sqlx::query_scalar::<_, i64>(&sql)
                    .bind(correlation_id)
                    .fetch_one(&self.pool)
                    .await
                {
                    Ok(count) => Ok(count.max(0) as u64),
                    Err(e) if is_undefined_table(&e) => Ok(0),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

#[async_trait]
impl ReplyQueue for PgReplyQueue {
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

        match self
            .table
            .insert(&self.pool, &envelope, Some(correlation_id.as_str()), None)
            .await
        {
            Ok(queueid) => {
                PUBLISHED_TOTAL.with_label_values(&[BACKEND]).inc();
                tracing::debug!(
                    queue = %self.name,
                    id = queueid,
                    correlation_id = %correlation_id,
                    "Reply published"
                );
                Ok(PublishReceipt::Accepted)
            }
            Err(QueueError::Database(e)) if is_undefined_table(&e) => {
                tracing::debug!(queue = %self.name, "Reply channel not declared");
                Ok(PublishReceipt::QueueNotDeclared)
            }
            Err(e) => Err(e),
        }
    }

    async fn consume(
        &mut self,
        handler: &mut (dyn Handler<dyn ReplyQueue> + '_),
        timeout: Duration,
    ) -> Result<()> {
        let timer = PollTimer::start(timeout, self.poll_interval);

        while !self.state.is_satisfied() {
            let claimed = self
                .table
                .claim(&self.pool, self.state.correlation_id())
                .await?;

            match claimed {
                Some(envelope) => {
                    let id = envelope.id();
                    handler.handle(&*self, envelope).await?;

                    if let Some(id) = id {
                        self.table.delete(&self.pool, id).await?;
                        ACKED_TOTAL.with_label_values(&[BACKEND]).inc();
                    }
                    self.state.record_response();
                    tracing::trace!(
                        queue = %self.name,
                        responses = self.state.responses(),
                        expected = ?self.state.expected(),
                        "Reply delivered"
                    );

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

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn lazy_pool() -> PgPool {
        PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap()
    }

    #[tokio::test]
    async fn test_self_named_channel() {
        let reply = PgReplyQueue::attach(lazy_pool(), None).unwrap();
        assert_eq!(reply.name(), SHARED_REPLY_QUEUE);
        assert_eq!(reply.correlation_id().map(str::len), Some(32));

        let other = PgReplyQueue::attach(lazy_pool(), Some("")).unwrap();
        assert_eq!(other.name(), SHARED_REPLY_QUEUE);
        assert_ne!(reply.correlation_id(), other.correlation_id());
    }

    #[tokio::test]
    async fn test_named_channel_has_no_correlation_id() {
        let reply = PgReplyQueue::attach(lazy_pool(), Some("answers")).unwrap();
        assert_eq!(reply.name(), "answers");
        assert_eq!(reply.correlation_id(), None);
    }

    #[tokio::test]
    async fn test_publish_without_correlation_fails_before_database() {
        let reply = PgReplyQueue::attach(lazy_pool(), Some("answers")).unwrap();
        let err = reply
            .publish(Envelope::new(serde_json::json!("r")))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::MissingCorrelationId));
    }

    #[tokio::test]
    async fn test_expected_count() {
        let mut reply = PgReplyQueue::attach(lazy_pool(), None).unwrap();
        assert_eq!(reply.expected_response_count(), None);
        reply.increment_expected_response_count(2);
        reply.increment_expected_response_count(1);
        assert_eq!(reply.expected_response_count(), Some(3));
        reply.set_expected_response_count(None);
        assert_eq!(reply.expected_response_count(), None);
    }

    #[tokio::test]
    async fn test_consume_with_satisfied_count_returns_immediately() {
        let mut reply = PgReplyQueue::attach(lazy_pool(), None).unwrap();
        reply.set_expected_response_count(Some(0));

        let mut received: Vec<Envelope> = Vec::new();
        reply
            .consume(&mut received, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(received.is_empty());
    }
}
