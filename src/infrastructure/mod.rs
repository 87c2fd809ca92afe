//! Infrastructure layer modules
//!
//! This module contains the connections the queue engines run on:
//! - `broker`: AMQP channel seam, lapin and in-memory implementations,
//!   management API client
//! - `postgres`: PostgreSQL connection pool

pub mod broker;
pub mod postgres;
