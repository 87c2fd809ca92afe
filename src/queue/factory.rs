//! Queue factories.
//!
//! A [`QueueFactory`] builds every queue flavour for one backend.
//! [`ConfigurableFactory`] routes each role to its own factory, and
//! [`create_queue_factory`] wires one up from [`Settings`].

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use super::amqp::AmqpQueueFactory;
use super::postgres::PgQueueFactory;
use super::{Queue, ReplyQueue, RpcQueue};
use crate::broker::{BrokerChannel, ManagementApi};
use crate::config::{BackendKind, Settings};
use crate::error::{QueueError, Result};

/// Builds the queues of one backend.
#[async_trait]
pub trait QueueFactory: Send + Sync {
    /// Backend identifier used in logs.
    fn backend(&self) -> &'static str;

    async fn create(&self, name: &str) -> Result<Arc<dyn Queue>>;

    /// A queue whose messages become visible `delay_seconds` after publish.
    async fn create_delayed(&self, name: &str, delay_seconds: u32) -> Result<Arc<dyn Queue>>;

    /// A queue accepting a per-message visibility time on publish.
    async fn create_schedulable(&self, name: &str) -> Result<Arc<dyn Queue>>;

    /// A reply channel; `None` or an empty name opens a private one.
    async fn rpc_reply(&self, name: Option<&str>) -> Result<Box<dyn ReplyQueue>>;

    async fn create_rpc(&self, name: &str) -> Result<RpcQueue>;
}

/// The queue roles a [`ConfigurableFactory`] can route separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Normal,
    Delayed,
    Rpc,
    Schedulable,
}

/// Routes each queue role to its own factory, falling back to a default.
#[derive(Clone)]
pub struct ConfigurableFactory {
    default: Arc<dyn QueueFactory>,
    normal: Option<Arc<dyn QueueFactory>>,
    delayed: Option<Arc<dyn QueueFactory>>,
    rpc: Option<Arc<dyn QueueFactory>>,
    schedulable: Option<Arc<dyn QueueFactory>>,
}

impl ConfigurableFactory {
    pub fn new(default: Arc<dyn QueueFactory>) -> Self {
        Self {
            default,
            normal: None,
            delayed: None,
            rpc: None,
            schedulable: None,
        }
    }

    pub fn with_normal(mut self, factory: Arc<dyn QueueFactory>) -> Self {
        self.normal = Some(factory);
        self
    }

    pub fn with_delayed(mut self, factory: Arc<dyn QueueFactory>) -> Self {
        self.delayed = Some(factory);
        self
    }

    pub fn with_rpc(mut self, factory: Arc<dyn QueueFactory>) -> Self {
        self.rpc = Some(factory);
        self
    }

    pub fn with_schedulable(mut self, factory: Arc<dyn QueueFactory>) -> Self {
        self.schedulable = Some(factory);
        self
    }

    /// The factory serving `role`.
    pub fn factory_for(&self, role: QueueRole) -> &Arc<dyn QueueFactory> {
        let routed = match role {
            QueueRole::Normal => &self.normal,
            QueueRole::Delayed => &self.delayed,
            QueueRole::Rpc => &self.rpc,
            QueueRole::Schedulable => &self.schedulable,
        };
        routed.as_ref().unwrap_or(&self.default)
    }
}

#[async_trait]
impl QueueFactory for ConfigurableFactory {
    fn backend(&self) -> &'static str {
        self.default.backend()
    }

    async fn create(&self, name: &str) -> Result<Arc<dyn Queue>> {
        self.factory_for(QueueRole::Normal).create(name).await
    }

    async fn create_delayed(&self, name: &str, delay_seconds: u32) -> Result<Arc<dyn Queue>> {
        self.factory_for(QueueRole::Delayed)
            .create_delayed(name, delay_seconds)
            .await
    }

    async fn create_schedulable(&self, name: &str) -> Result<Arc<dyn Queue>> {
        self.factory_for(QueueRole::Schedulable)
            .create_schedulable(name)
            .await
    }

    async fn rpc_reply(&self, name: Option<&str>) -> Result<Box<dyn ReplyQueue>> {
        self.factory_for(QueueRole::Rpc).rpc_reply(name).await
    }

    async fn create_rpc(&self, name: &str) -> Result<RpcQueue> {
        self.factory_for(QueueRole::Rpc).create_rpc(name).await
    }
}

/// Build a [`ConfigurableFactory`] from settings and the available backends.
///
/// Roles without an explicit backend use `queues.roles.default`; without a
/// default, PostgreSQL is preferred when both backends are connected.
///
/// # Example
///
/// ```rust,ignore
/// let factory = create_queue_factory(&settings, Some(pool.pool().clone()), None)?;
/// let queue = factory.create("emails").await?;
/// ```
pub fn create_queue_factory(
    settings: &Settings,
    postgres_pool: Option<PgPool>,
    amqp_channel: Option<Arc<dyn BrokerChannel>>,
) -> Result<ConfigurableFactory> {
    let postgres: Option<Arc<dyn QueueFactory>> = postgres_pool.map(|pool| {
        let factory = PgQueueFactory::new(pool)
            .with_reply_poll_interval(settings.queues.reply_poll_interval());
        Arc::new(factory) as Arc<dyn QueueFactory>
    });

    let amqp: Option<Arc<dyn QueueFactory>> = match amqp_channel {
        Some(channel) => {
            let management = settings
                .management
                .as_ref()
                .map(ManagementApi::new)
                .transpose()?;
            Some(Arc::new(AmqpQueueFactory::new(channel, management)) as Arc<dyn QueueFactory>)
        }
        None => None,
    };

    let resolve = |kind: Option<BackendKind>| -> Result<Arc<dyn QueueFactory>> {
        match kind {
            Some(BackendKind::Postgres) => postgres
                .clone()
                .ok_or(QueueError::BackendUnavailable("postgres")),
            Some(BackendKind::Amqp) => amqp.clone().ok_or(QueueError::BackendUnavailable("amqp")),
            None => postgres
                .clone()
                .or_else(|| amqp.clone())
                .ok_or(QueueError::BackendUnavailable("postgres or amqp")),
        }
    };

    let roles = &settings.queues.roles;
    let mut factory = ConfigurableFactory::new(resolve(roles.default)?);
    if roles.normal.is_some() {
        factory = factory.with_normal(resolve(roles.normal)?);
    }
    if roles.delayed.is_some() {
        factory = factory.with_delayed(resolve(roles.delayed)?);
    }
    if roles.rpc.is_some() {
        factory = factory.with_rpc(resolve(roles.rpc)?);
    }
    if roles.schedulable.is_some() {
        factory = factory.with_schedulable(resolve(roles.schedulable)?);
    }

    tracing::info!(
        normal = factory.factory_for(QueueRole::Normal).backend(),
        delayed = factory.factory_for(QueueRole::Delayed).backend(),
        rpc = factory.factory_for(QueueRole::Rpc).backend(),
        schedulable = factory.factory_for(QueueRole::Schedulable).backend(),
        "Queue factory configured"
    );

    Ok(factory)
}
