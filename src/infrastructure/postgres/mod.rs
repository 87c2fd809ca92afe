//! PostgreSQL persistence module.
//!
//! Provides connection pooling for the polling queue backend.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
