//! Redis queue producer for publishing webhooks.
//!
//! Publish path for the receiver: build an envelope, LPUSH to the main list,
//! bump stats. The circuit breaker gates every attempt; on a broker failure
//! the outcome carries a fallback hint so the dispatcher can POST the raw
//! event over HTTP instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use super::{bump_stat, BreakerSnapshot, RedisCircuitBreaker, QUEUE_DLQ, QUEUE_MAIN, QUEUE_STATS};
use crate::models::WebhookEnvelope;

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PublishOutcome {
    fn fallback(error: impl Into<String>) -> Self {
        Self {
            success: false,
            queue_id: None,
            fallback_used: true,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_depth: i64,
    pub dlq_depth: i64,
    pub total_enqueued: i64,
    pub total_processed: i64,
    pub total_failed: i64,
    pub circuit_breaker: BreakerSnapshot,
}

pub struct WebhookQueueProducer {
    con: ConnectionManager,
    breaker: Arc<RedisCircuitBreaker>,
    max_retries: u32,
}

impl WebhookQueueProducer {
    pub fn new(con: ConnectionManager, breaker: Arc<RedisCircuitBreaker>, max_retries: u32) -> Self {
        Self {
            con,
            breaker,
            max_retries,
        }
    }

    /// Publishes a raw webhook event to the main queue.
    ///
    /// Never touches Redis while the breaker is open; any broker error is
    /// recorded against the breaker and reported with `fallback_used = true`.
    pub async fn publish(&self, event_payload: &Value) -> PublishOutcome {
        if !self.breaker.should_attempt() {
            warn!("Circuit breaker open, skipping Redis publish");
            return PublishOutcome::fallback("circuit breaker open");
        }

        let start = Instant::now();
        let envelope = WebhookEnvelope::new(event_payload.clone(), self.max_retries);
        let queue_id = envelope.id.clone();

        let message = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize webhook envelope");
                return PublishOutcome::fallback(format!("serialization error: {e}"));
            }
        };

        let mut con = self.con.clone();
        let pushed: redis::RedisResult<i64> = con.lpush(QUEUE_MAIN, &message).await;

        match pushed {
            Ok(_) => {
                bump_stat(&mut con, "total_enqueued", 1).await;
                self.breaker.record_success();

                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                info!(queue_id = %queue_id, latency_ms = format!("{latency_ms:.1}"), "Published to Redis queue");

                PublishOutcome {
                    success: true,
                    queue_id: Some(queue_id),
                    fallback_used: false,
                    latency_ms: Some(latency_ms),
                    error: None,
                }
            }
            Err(e) => {
                error!(error = %e, "Redis publish failed");
                self.breaker.record_failure();
                PublishOutcome::fallback(e.to_string())
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        let mut con = self.con.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut con).await;
        match pong {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Redis health check failed");
                false
            }
        }
    }

    pub async fn get_stats(&self) -> anyhow::Result<QueueStats> {
        let mut con = self.con.clone();

        let queue_depth: i64 = con.llen(QUEUE_MAIN).await?;
        let dlq_depth: i64 = con.llen(QUEUE_DLQ).await?;
        let stats: HashMap<String, String> = con.hgetall(QUEUE_STATS).await?;

        let counter = |field: &str| {
            stats
                .get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };

        Ok(QueueStats {
            queue_depth,
            dlq_depth,
            total_enqueued: counter("total_enqueued"),
            total_processed: counter("total_processed"),
            total_failed: counter("total_failed"),
            circuit_breaker: self.breaker.snapshot(),
        })
    }

    pub fn breaker(&self) -> &Arc<RedisCircuitBreaker> {
        &self.breaker
    }
}
