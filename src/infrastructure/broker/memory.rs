//! In-process AMQP broker.
//!
//! Implements the subset of broker behaviour the push queues rely on: named
//! and server-named queues, fanout exchanges, per-queue message TTL with
//! dead-lettering, push consumers and acknowledgements. Used by the test
//! suites and handy for local development without a running broker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;

use super::channel::{
    BrokerChannel, Delivery, MessageHeaders, OutgoingMessage, QueueArguments, QueueOptions,
    Subscription,
};
use crate::error::{QueueError, Result};

const CONSUMER_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    headers: MessageHeaders,
    redelivered: bool,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
}

impl QueueState {
    fn enqueue(&mut self, mut message: StoredMessage, now: Instant) {
        message.expires_at = self
            .arguments
            .message_ttl_ms
            .map(|ttl| now + Duration::from_millis(u64::from(ttl)));
        self.ready.push_back(message);
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// exchange name -> bound queues
    exchanges: HashMap<String, Vec<String>>,
    /// delivery tag -> (queue, message)
    unacked: HashMap<u64, (String, StoredMessage)>,
    /// consumer tag -> queue
    consumers: HashMap<String, String>,
    next_delivery_tag: u64,
    generated_names: u64,
    declare_calls: usize,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<()> {
        let now = Instant::now();
        if exchange.is_empty() {
            // Unroutable messages are dropped, as on a real broker.
            if let Some(queue) = self.queues.get_mut(routing_key) {
                queue.enqueue(message, now);
            }
            return Ok(());
        }

        let bound = self.exchanges.get(exchange).cloned().ok_or_else(|| {
            QueueError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        for name in bound {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.enqueue(message.clone(), now);
            }
        }
        Ok(())
    }

    /// Move expired head messages to their dead-letter exchange.
    fn expire(&mut self) {
        let now = Instant::now();
        // Bounded so a dead-letter cycle cannot spin forever.
        for _ in 0..16 {
            let mut dead: Vec<(String, StoredMessage)> = Vec::new();
            for queue in self.queues.values_mut() {
                while queue
                    .ready
                    .front()
                    .and_then(|m| m.expires_at)
                    .is_some_and(|at| at <= now)
                {
                    if let Some(message) = queue.ready.pop_front() {
                        if let Some(exchange) = &queue.arguments.dead_letter_exchange {
                            dead.push((exchange.clone(), message));
                        }
                    }
                }
            }
            if dead.is_empty() {
                return;
            }
            for (exchange, message) in dead {
                if let Err(e) = self.route(&exchange, "", message) {
                    tracing::warn!(error = %e, "Dropping dead-lettered message");
                }
            }
        }
    }

    fn next_delivery(&mut self, consumer_tag: &str) -> Option<Option<Delivery>> {
        let queue_name = self.consumers.get(consumer_tag)?.clone();
        self.expire();
        let Some(queue) = self.queues.get_mut(&queue_name) else {
            return None;
        };
        let Some(message) = queue.ready.pop_front() else {
            return Some(None);
        };

        self.next_delivery_tag += 1;
        let delivery_tag = self.next_delivery_tag;
        let delivery = Delivery {
            delivery_tag,
            redelivered: message.redelivered,
            body: message.body.clone(),
            headers: message.headers.clone(),
        };
        self.unacked.insert(delivery_tag, (queue_name, message));
        Some(Some(delivery))
    }
}

/// An AMQP broker living in process memory.
///
/// Cloning shares the broker, so a test can keep one handle for inspection
/// while queues hold another.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ready messages in `queue`, after applying TTL expiry.
    pub fn depth(&self, queue: &str) -> usize {
        let mut state = self.lock();
        state.expire();
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet acknowledged messages, across all queues.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.lock().queues.get(queue).map(|q| q.options)
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<QueueArguments> {
        self.lock().queues.get(queue).map(|q| q.arguments.clone())
    }

    /// Queues bound to `exchange`, or `None` if it was never declared.
    pub fn bindings(&self, exchange: &str) -> Option<Vec<String>> {
        self.lock().exchanges.get(exchange).cloned()
    }

    /// Number of `queue_declare` calls received, including redeclarations.
    pub fn declare_calls(&self) -> usize {
        self.lock().declare_calls
    }

    pub fn active_consumers(&self) -> usize {
        self.lock().consumers.len()
    }

    /// Return every unacknowledged message to its queue flagged as
    /// redelivered, as a broker does when the consuming channel closes.
    pub fn requeue_unacked(&self) {
        let mut state = self.lock();
        let mut unacked: Vec<_> = state.unacked.drain().collect();
        unacked.sort_by_key(|(tag, _)| *tag);
        for (_, (queue_name, mut message)) in unacked {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<String> {
        let mut state = self.lock();
        state.declare_calls += 1;

        let name = if name.is_empty() {
            state.generated_names += 1;
            format!("amq.gen-{}", state.generated_names)
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.options != options || existing.arguments != arguments {
                return Err(QueueError::Broker(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    name
                )));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                arguments,
                ready: VecDeque::new(),
            },
        );
        Ok(name)
    }

    async fn exchange_declare_fanout(&self, name: &str, _durable: bool) -> Result<()> {
        self.lock().exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(QueueError::Broker(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let bound = state.exchanges.get_mut(exchange).ok_or_else(|| {
            QueueError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        let mut state = self.lock();
        state.expire();
        state.route(
            exchange,
            routing_key,
            StoredMessage {
                body: message.body,
                headers: message.headers,
                redelivered: false,
                expires_at: None,
            },
        )
    }

    async fn consume(&self, queue: &str) -> Result<Subscription> {
        let consumer_tag = {
            let mut state = self.lock();
            if !state.queues.contains_key(queue) {
                return Err(QueueError::Broker(format!("NOT_FOUND - no queue '{}'", queue)));
            }
            let tag = format!("ctag-{}", uuid::Uuid::new_v4().simple());
            state.consumers.insert(tag.clone(), queue.to_string());
            tag
        };

        let broker = self.clone();
        let tag = consumer_tag.clone();
        let deliveries = futures::stream::unfold((broker, tag), |(broker, tag)| async move {
            loop {
                let next = broker.lock().next_delivery(&tag);
                match next {
                    // Cancelled or queue gone
                    None => return None,
                    Some(Some(delivery)) => return Some((Ok(delivery), (broker, tag))),
                    Some(None) => tokio::time::sleep(CONSUMER_POLL).await,
                }
            }
        })
        .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.lock().consumers.remove(consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        match self.lock().unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(QueueError::Broker(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))),
        }
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::Broker(format!("NOT_FOUND - no queue '{}'", queue)))?;
        let purged = queue.ready.len();
        queue.ready.clear();
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }
}
