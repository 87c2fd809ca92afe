//! Prometheus metrics for queue operations.
//!
//! - Publish counts per backend
//! - Claims, acks and nacks
//! - Replies discarded because their correlation id did not match

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "queue_bridge";

lazy_static! {
    /// Messages accepted by publish, by backend
    pub static ref PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_published_total", METRIC_PREFIX),
        "Total messages published",
        &["backend"]
    ).unwrap();

    /// Rows claimed by polling consumers
    pub static ref CLAIMED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_claimed_total", METRIC_PREFIX),
        "Total messages claimed from polling queues"
    ).unwrap();

    /// Messages acknowledged, by backend
    pub static ref ACKED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_acked_total", METRIC_PREFIX),
        "Total messages acknowledged",
        &["backend"]
    ).unwrap();

    /// Messages returned to their queue
    pub static ref NACKED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_nacked_total", METRIC_PREFIX),
        "Total messages negatively acknowledged"
    ).unwrap();

    /// Replies acked and dropped because they belonged to another caller
    pub static ref REPLIES_DISCARDED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_replies_discarded_total", METRIC_PREFIX),
        "Total replies discarded due to correlation id mismatch"
    ).unwrap();
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_counters() {
        PUBLISHED_TOTAL.with_label_values(&["postgres"]).inc();
        CLAIMED_TOTAL.inc();

        let text = encode_metrics().unwrap();
        assert!(text.contains("queue_bridge_published_total"));
        assert!(text.contains("queue_bridge_claimed_total"));
    }
}
