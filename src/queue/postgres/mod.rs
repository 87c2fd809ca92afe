//! PostgreSQL polling backend.
//!
//! Each logical queue maps to its own table; consumers poll it with an
//! atomic claim. Reply channels share one table and are separated by
//! correlation id.

mod delayed;
mod factory;
mod queue;
mod reply;
mod table;

pub use delayed::PgDelayedQueue;
pub use factory::PgQueueFactory;
pub use queue::PgQueue;
pub use reply::{PgReplyQueue, SHARED_REPLY_QUEUE};

pub(crate) use queue::BACKEND;
