//! AMQP broker plumbing used by the push queues.

mod channel;
mod declared;
mod lapin_channel;
mod management;
mod memory;

pub use channel::{
    BrokerChannel, Delivery, MessageHeaders, OutgoingMessage, QueueArguments, QueueOptions,
    Subscription,
};
pub use declared::DeclaredQueues;
pub use lapin_channel::{AmqpConnectionError, LapinChannel};
pub use management::ManagementApi;
pub use memory::InMemoryBroker;
