use std::sync::Arc;

use async_trait::async_trait;

use super::{AmqpDelayedQueue, AmqpQueue, AmqpReplyQueue, BACKEND};
use crate::broker::{BrokerChannel, DeclaredQueues, ManagementApi};
use crate::error::{QueueError, Result};
use crate::queue::{Queue, QueueFactory, ReplyQueue, RpcQueue};

/// Builds broker queues over one shared channel.
///
/// Every queue created here shares one [`DeclaredQueues`] registry, so each
/// physical queue is declared at most once per factory.
#[derive(Clone)]
pub struct AmqpQueueFactory {
    channel: Arc<dyn BrokerChannel>,
    declared: DeclaredQueues,
    management: Option<ManagementApi>,
}

impl AmqpQueueFactory {
    pub fn new(channel: Arc<dyn BrokerChannel>, management: Option<ManagementApi>) -> Self {
        Self {
            channel,
            declared: DeclaredQueues::new(),
            management,
        }
    }

    pub fn declared(&self) -> &DeclaredQueues {
        &self.declared
    }
}

#[async_trait]
impl QueueFactory for AmqpQueueFactory {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, name: &str) -> Result<Arc<dyn Queue>> {
        let queue = AmqpQueue::new(
            self.channel.clone(),
            &self.declared,
            self.management.clone(),
            name,
        )
        .await?;
        Ok(Arc::new(queue))
    }

    async fn create_delayed(&self, name: &str, delay_seconds: u32) -> Result<Arc<dyn Queue>> {
        let queue = AmqpDelayedQueue::new(
            self.channel.clone(),
            &self.declared,
            self.management.clone(),
            name,
            delay_seconds,
        )
        .await?;
        Ok(Arc::new(queue))
    }

    /// Broker queues have no per-message visibility time.
    async fn create_schedulable(&self, _name: &str) -> Result<Arc<dyn Queue>> {
        Err(QueueError::UnsupportedOperation(
            "schedulable queues on the broker backend",
        ))
    }

    async fn rpc_reply(&self, name: Option<&str>) -> Result<Box<dyn ReplyQueue>> {
        let reply = AmqpReplyQueue::new(self.channel.clone(), name).await?;
        Ok(Box::new(reply))
    }

    async fn create_rpc(&self, name: &str) -> Result<RpcQueue> {
        let queue = self.create(name).await?;
        Ok(RpcQueue::new(queue, Arc::new(self.clone())))
    }
}
