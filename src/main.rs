use std::sync::Arc;

use anyhow::{bail, Result};

use queue_bridge::broker::{BrokerChannel, LapinChannel};
use queue_bridge::config::Settings;
use queue_bridge::error::QueueError;
use queue_bridge::postgres::PostgresPool;
use queue_bridge::queue::{create_queue_factory, Queue, QueueFactory};
use queue_bridge::telemetry::init_tracing;

/// Print ready and total counts for each queue named on the command line.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let queue_names: Vec<String> = std::env::args().skip(1).collect();
    if queue_names.is_empty() {
        bail!("usage: queue-bridge <queue> [<queue> ...]");
    }

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let postgres = match &settings.database {
        Some(database) => Some(PostgresPool::new(database).await?),
        None => None,
    };

    let amqp: Option<Arc<dyn BrokerChannel>> = match &settings.amqp {
        Some(amqp) => Some(Arc::new(LapinChannel::connect(&amqp.uri).await?)),
        None => None,
    };

    let factory = create_queue_factory(
        &settings,
        postgres.as_ref().map(|pool| pool.pool().clone()),
        amqp,
    )?;

    for name in &queue_names {
        let queue = factory.create(name).await?;
        let ready = queue.message_count().await?;
        let total = match queue.total_message_count().await {
            Ok(total) => total,
            Err(QueueError::UnsupportedOperation(_)) => None,
            Err(e) => return Err(e.into()),
        };

        println!(
            "{}",
            serde_json::json!({
                "queue": name,
                "backend": queue.backend(),
                "ready": ready,
                "total": total,
            })
        );
    }

    if let Some(pool) = postgres {
        pool.close().await;
    }
    Ok(())
}
