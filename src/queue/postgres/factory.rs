use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use super::{PgDelayedQueue, PgQueue, PgReplyQueue, BACKEND};
use crate::error::Result;
use crate::queue::polling::DEFAULT_REPLY_POLL_INTERVAL;
use crate::queue::{Queue, QueueFactory, ReplyQueue, RpcQueue};

/// Builds PostgreSQL queues sharing one pool.
#[derive(Debug, Clone)]
pub struct PgQueueFactory {
    pool: PgPool,
    reply_poll_interval: Duration,
}

impl PgQueueFactory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            reply_poll_interval: DEFAULT_REPLY_POLL_INTERVAL,
        }
    }

    pub fn with_reply_poll_interval(mut self, interval: Duration) -> Self {
        self.reply_poll_interval = interval;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueFactory for PgQueueFactory {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, name: &str) -> Result<Arc<dyn Queue>> {
        Ok(Arc::new(PgQueue::new(self.pool.clone(), name).await?))
    }

    async fn create_delayed(&self, name: &str, delay_seconds: u32) -> Result<Arc<dyn Queue>> {
        let inner = PgQueue::new(self.pool.clone(), name).await?;
        Ok(Arc::new(PgDelayedQueue::new(inner, delay_seconds)))
    }

    /// Any polling queue accepts a per-message visibility time.
    async fn create_schedulable(&self, name: &str) -> Result<Arc<dyn Queue>> {
        self.create(name).await
    }

    async fn rpc_reply(&self, name: Option<&str>) -> Result<Box<dyn ReplyQueue>> {
        let reply = PgReplyQueue::new(self.pool.clone(), name)
            .await?
            .with_poll_interval(self.reply_poll_interval);
        Ok(Box::new(reply))
    }

    async fn create_rpc(&self, name: &str) -> Result<RpcQueue> {
        let queue = self.create(name).await?;
        Ok(RpcQueue::new(queue, Arc::new(self.clone())))
    }
}
