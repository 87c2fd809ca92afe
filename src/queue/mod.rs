//! Queue abstraction over a PostgreSQL polling backend and an AMQP push
//! backend.
//!
//! This module provides:
//! - [`Envelope`]: a payload plus its delivery metadata
//! - [`Queue`] and [`ReplyQueue`]: the capability traits every backend implements
//! - Fixed-delay queues, reply channels and [`RpcQueue`] request/reply
//! - [`QueueFactory`] implementations selecting a backend per queue role
//!
//! # Example
//!
//! ```rust,ignore
//! let factory = create_queue_factory(&settings, Some(pool), None)?;
//! let queue = factory.create("emails").await?;
//! queue.publish(Envelope::encode(&email)?, None).await?;
//!
//! let mut batch: Vec<Envelope> = Vec::new();
//! queue.consume(&mut batch, Duration::from_secs(5), DEFAULT_POLL_INTERVAL).await?;
//! for envelope in &batch {
//!     queue.ack(envelope).await?;
//! }
//! ```

pub mod amqp;
mod backend;
mod envelope;
mod factory;
mod polling;
pub mod postgres;
mod reply;
mod rpc;

pub use backend::{Handler, PublishReceipt, Queue, ReplyQueue};
pub use envelope::Envelope;
pub use factory::{create_queue_factory, ConfigurableFactory, QueueFactory, QueueRole};
pub use polling::{DEFAULT_POLL_INTERVAL, DEFAULT_REPLY_POLL_INTERVAL};
pub use reply::new_correlation_id;
pub use rpc::RpcQueue;
