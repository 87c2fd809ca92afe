//! AMQP push backend.
//!
//! Queues publish through a shared [`BrokerChannel`](crate::broker::BrokerChannel).
//! Fixed delays use a TTL wait queue that dead-letters into the destination;
//! reply channels subscribe and filter by correlation id.

mod delayed;
mod factory;
mod queue;
mod reply;

pub use delayed::{delay_exchange_name, wait_queue_name, AmqpDelayedQueue};
pub use factory::AmqpQueueFactory;
pub use queue::AmqpQueue;
pub use reply::AmqpReplyQueue;

pub(crate) use queue::BACKEND;
