//! Capability traits shared by every queue implementation.
//!
//! PostgreSQL polling queues and AMQP push queues expose the same surface.
//! Operations a backend cannot provide return
//! [`QueueError::UnsupportedOperation`](crate::error::QueueError::UnsupportedOperation)
//! at call time instead of being silently skipped.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Envelope;
use crate::error::Result;

/// Outcome of a successful publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReceipt {
    /// The message was stored or handed to the broker
    Accepted,
    /// The destination does not exist (yet); nothing was stored
    QueueNotDeclared,
}

impl PublishReceipt {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Callback invoked once per delivered message.
///
/// `C` is the queue (or reply channel) the message came from, so a handler
/// can ack or nack through it. Returning an error aborts the consume loop;
/// the message's disposition is then the caller's responsibility.
#[async_trait]
pub trait Handler<C: ?Sized + Sync>: Send {
    async fn handle(&mut self, queue: &C, envelope: Envelope) -> Result<()>;
}

/// Collects deliveries so they can be acked or nacked after consume returns.
#[async_trait]
impl<C: ?Sized + Sync> Handler<C> for Vec<Envelope> {
    async fn handle(&mut self, _queue: &C, envelope: Envelope) -> Result<()> {
        self.push(envelope);
        Ok(())
    }
}

/// Publish/consume/ack contract over one logical queue.
///
/// # Thread Safety
///
/// Implementations are shared across tasks; correctness under concurrent
/// consumers comes from the backend (one atomic conditional update, or one
/// broker ack), never from in-process locking.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Logical queue name.
    fn name(&self) -> &str;

    /// Backend identifier used in logs and metrics.
    fn backend(&self) -> &'static str;

    /// Publish a message, optionally invisible until `visible_at`.
    async fn publish(
        &self,
        envelope: Envelope,
        visible_at: Option<DateTime<Utc>>,
    ) -> Result<PublishReceipt>;

    /// Claim and hand messages to `handler` until `timeout` elapses.
    ///
    /// Claims back-to-back while messages are available and sleeps
    /// `poll_interval` after an empty claim. The handler does not ack.
    async fn consume(
        &self,
        handler: &mut (dyn Handler<dyn Queue> + '_),
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()>;

    /// Claim and hand messages to `handler` until the queue is empty.
    async fn drain(&self, handler: &mut (dyn Handler<dyn Queue> + '_)) -> Result<()>;

    /// Permanently remove a claimed message. Acking twice is a no-op.
    async fn ack(&self, envelope: &Envelope) -> Result<()>;

    /// Return a claimed message to the queue with one more attempt recorded.
    async fn nack(&self, envelope: &Envelope) -> Result<()>;

    /// Messages ready now and not claimed. `None` when unknown.
    async fn message_count(&self) -> Result<Option<u64>>;

    /// Messages ready now or scheduled for later, excluding claimed ones.
    async fn total_message_count(&self) -> Result<Option<u64>>;

    /// Remove every message from the queue.
    async fn empty_queue(&self) -> Result<()>;
}

/// A correlation-scoped channel receiving RPC responses.
#[async_trait]
pub trait ReplyQueue: Send + Sync {
    /// Address requests should name as their reply destination.
    fn name(&self) -> &str;

    fn correlation_id(&self) -> Option<&str>;

    fn set_correlation_id(&mut self, correlation_id: String);

    /// Publish a response into this channel.
    ///
    /// Fails with `MissingCorrelationId` when neither the envelope nor the
    /// channel carries a correlation id.
    async fn publish(&self, envelope: Envelope) -> Result<PublishReceipt>;

    /// Deliver matching responses to `handler`, acking each one after the
    /// handler returns.
    ///
    /// Stops at the expected response count, or when `timeout` elapses.
    async fn consume(
        &mut self,
        handler: &mut (dyn Handler<dyn ReplyQueue> + '_),
        timeout: Duration,
    ) -> Result<()>;

    /// `None` waits for the full timeout.
    fn set_expected_response_count(&mut self, count: Option<u32>);

    fn increment_expected_response_count(&mut self, by: u32);

    fn expected_response_count(&self) -> Option<u32>;

    /// Responses delivered to handlers so far.
    fn responses(&self) -> u32;
}
