// Infrastructure layer (connections)
pub mod infrastructure;

pub use infrastructure::broker;
pub use infrastructure::postgres;

// Shared components
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Queue engines
pub mod queue;
