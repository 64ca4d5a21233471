//! Dead letter queue administration.
//!
//! Inspection, replay (DLQ back to main with reset metadata), clearing, and
//! counter resets. Every operation talks straight to Redis so it works from
//! either binary.

use std::collections::HashMap;

use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use super::{QUEUE_DLQ, QUEUE_MAIN, QUEUE_STATS};
use crate::models::WebhookEnvelope;

const STATS_SAMPLE_SIZE: isize = 5;

/// Summary line for one DLQ entry, shaped for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct DlqEntrySummary {
    pub order_sn: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_to_dlq_at: Option<f64>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub dlq_count: i64,
    pub total_enqueued: i64,
    pub total_processed: i64,
    pub total_failed: i64,
    pub sample_messages: Vec<DlqEntrySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqPage {
    pub total: i64,
    pub limit: usize,
    pub offset: usize,
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub retried: u64,
    pub failed: u64,
}

fn summarize(raw: &str) -> Option<DlqEntrySummary> {
    let envelope: WebhookEnvelope = serde_json::from_str(raw).ok()?;
    let data = envelope.payload.get("data");
    let field = |key: &str| {
        data.and_then(|d| d.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string()
    };

    Some(DlqEntrySummary {
        order_sn: field("ordersn"),
        status: field("status"),
        event_code: envelope.payload.get("code").and_then(|v| v.as_i64()),
        shop_id: envelope.payload.get("shop_id").and_then(|v| v.as_i64()),
        enqueued_at: Some(envelope.metadata.enqueued_at),
        moved_to_dlq_at: envelope.metadata.moved_to_dlq_at,
        retry_count: envelope.metadata.retry_count,
        max_retries: envelope.metadata.max_retries,
        worker_id: envelope.metadata.worker_id,
    })
}

#[derive(Clone)]
pub struct DlqAdmin {
    con: ConnectionManager,
}

impl DlqAdmin {
    pub fn new(con: ConnectionManager) -> Self {
        Self { con }
    }

    /// DLQ length, global counters, and a sample of the head entries.
    pub async fn stats(&self) -> Result<DlqStats> {
        let mut con = self.con.clone();

        let dlq_count: i64 = con.llen(QUEUE_DLQ).await?;
        let stats: HashMap<String, String> = con.hgetall(QUEUE_STATS).await?;
        let counter = |field: &str| {
            stats
                .get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };

        let head: Vec<String> = con.lrange(QUEUE_DLQ, 0, STATS_SAMPLE_SIZE - 1).await?;
        let sample_messages = head.iter().filter_map(|raw| summarize(raw)).collect();

        Ok(DlqStats {
            dlq_count,
            total_enqueued: counter("total_enqueued"),
            total_processed: counter("total_processed"),
            total_failed: counter("total_failed"),
            sample_messages,
        })
    }

    /// Paginated raw DLQ entries (full envelopes, for inspection and manual
    /// replay decisions).
    pub async fn list(&self, offset: usize, limit: usize) -> Result<DlqPage> {
        let mut con = self.con.clone();

        let total: i64 = con.llen(QUEUE_DLQ).await?;
        let stop = offset as isize + limit as isize - 1;
        let raw: Vec<String> = con.lrange(QUEUE_DLQ, offset as isize, stop).await?;

        let messages = raw
            .iter()
            .filter_map(|m| match serde_json::from_str::<Value>(m) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable DLQ message");
                    None
                }
            })
            .collect();

        Ok(DlqPage {
            total,
            limit,
            offset,
            messages,
        })
    }

    /// Pops every DLQ entry, resets its retry metadata, and pushes it back
    /// onto the main queue. Oldest entries are replayed first.
    pub async fn replay_all(&self) -> Result<ReplayOutcome> {
        let mut con = self.con.clone();
        let mut retried = 0u64;
        let mut failed = 0u64;

        loop {
            let raw: Option<String> = con.rpop(QUEUE_DLQ, None).await?;
            let Some(raw) = raw else { break };

            match serde_json::from_str::<WebhookEnvelope>(&raw) {
                Ok(mut envelope) => {
                    envelope.reset_for_replay();
                    match serde_json::to_string(&envelope) {
                        Ok(message) => {
                            let pushed: redis::RedisResult<i64> =
                                con.lpush(QUEUE_MAIN, &message).await;
                            match pushed {
                                Ok(_) => retried += 1,
                                Err(e) => {
                                    error!(error = %e, "Failed to requeue DLQ message");
                                    failed += 1;
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reserialize DLQ message");
                            failed += 1;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to parse DLQ message, dropping");
                    failed += 1;
                }
            }
        }

        info!(retried, failed, "DLQ replay completed");
        Ok(ReplayOutcome { retried, failed })
    }

    /// Deletes the DLQ list. Returns how many entries were discarded.
    pub async fn clear(&self) -> Result<i64> {
        let mut con = self.con.clone();
        let count: i64 = con.llen(QUEUE_DLQ).await?;
        let _: i64 = con.del(QUEUE_DLQ).await?;
        warn!(count, "DLQ cleared, messages permanently deleted");
        Ok(count)
    }

    /// Deletes the stats hash. DLQ entries are untouched.
    pub async fn reset_stats(&self) -> Result<()> {
        let mut con = self.con.clone();
        let _: i64 = con.del(QUEUE_STATS).await?;
        info!("Queue stats reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summarize_extracts_order_fields() {
        let envelope = WebhookEnvelope::new(
            json!({"code": 3, "shop_id": 42, "data": {"ordersn": "B2", "status": "READY_TO_SHIP"}}),
            3,
        );
        let raw = serde_json::to_string(&envelope).unwrap();

        let summary = summarize(&raw).unwrap();
        assert_eq!(summary.order_sn, "B2");
        assert_eq!(summary.status, "READY_TO_SHIP");
        assert_eq!(summary.event_code, Some(3));
        assert_eq!(summary.shop_id, Some(42));
    }

    #[test]
    fn summarize_tolerates_missing_data() {
        let envelope = WebhookEnvelope::new(json!({"code": 8}), 3);
        let raw = serde_json::to_string(&envelope).unwrap();

        let summary = summarize(&raw).unwrap();
        assert_eq!(summary.order_sn, "unknown");
        assert_eq!(summary.status, "unknown");
    }

    #[test]
    fn summarize_rejects_garbage() {
        assert!(summarize("not json").is_none());
    }
}
