//! Redis-backed webhook queue.
//!
//! The receiver publishes envelopes to the main list (guarded by a circuit
//! breaker), the worker pool drains it with BRPOP, and exhausted messages
//! land in the dead letter queue for inspection and replay.

pub mod admin;
pub mod breaker;
pub mod consumer;
pub mod producer;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

pub use admin::DlqAdmin;
pub use breaker::{BreakerSnapshot, RedisCircuitBreaker};
pub use consumer::{ConsumerPool, RedisWebhookConsumer, WorkerStatsSnapshot};
pub use producer::{PublishOutcome, QueueStats, WebhookQueueProducer};

/// Main envelope FIFO (LPUSH by producers, BRPOP by workers).
pub const QUEUE_MAIN: &str = "shopee:webhooks:main";
/// Envelopes whose processing exhausted retries.
pub const QUEUE_DLQ: &str = "shopee:webhooks:dead_letter";
/// Hash of counters: total_enqueued, total_processed, total_failed.
pub const QUEUE_STATS: &str = "shopee:webhooks:stats";

/// Opens a dedicated connection manager. Consumers each get their own so a
/// BRPOP never starves other commands on a shared multiplexed connection.
pub async fn connect(client: &redis::Client) -> Result<ConnectionManager> {
    client
        .get_connection_manager()
        .await
        .context("Failed to connect to Redis")
}

/// Best-effort increment of a stats hash counter. Stats are advisory; a
/// failure is logged and swallowed.
pub async fn bump_stat(con: &mut ConnectionManager, field: &str, delta: i64) {
    let result: redis::RedisResult<i64> = redis::AsyncCommands::hincr(con, QUEUE_STATS, field, delta).await;
    if let Err(e) = result {
        tracing::warn!(field, error = %e, "Failed to update queue stats");
    }
}
