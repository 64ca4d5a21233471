//! Core domain types shared by the receiver and the worker.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ORDER_EVENT_CODES;

/// Raw webhook event as pushed by the upstream platform. Decoding is
/// tolerant: unknown fields are preserved so the envelope payload stays
/// byte-faithful through a queue round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub shop_id: i64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data: EventData,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default, alias = "order_sn", skip_serializing_if = "Option::is_none")]
    pub ordersn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RawEvent {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn order_sn(&self) -> Option<&str> {
        self.data.ordersn.as_deref().filter(|s| !s.is_empty())
    }

    pub fn status(&self) -> Option<&str> {
        self.data.status.as_deref()
    }

    pub fn is_order_event(&self) -> bool {
        ORDER_EVENT_CODES.contains(&self.code)
    }
}

/// Queue message metadata. `moved_to_dlq_at` and `worker_id` are only set
/// when an envelope lands in the dead letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub enqueued_at: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_to_dlq_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
}

/// The queue message: `{id, payload, metadata}`. The payload is the verbatim
/// upstream event so a replay re-runs the same idempotent upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    pub payload: Value,
    pub metadata: EnvelopeMetadata,
}

impl WebhookEnvelope {
    pub fn new(payload: Value, max_retries: u32) -> Self {
        let order_sn = payload
            .get("data")
            .and_then(|d| d.get("ordersn"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown");
        let now = Utc::now();
        let id = format!("wh_{}_{}", now.timestamp(), order_sn);

        Self {
            id,
            payload,
            metadata: EnvelopeMetadata {
                enqueued_at: now.timestamp_millis() as f64 / 1000.0,
                retry_count: 0,
                max_retries,
                moved_to_dlq_at: None,
                worker_id: None,
            },
        }
    }

    /// Resets retry bookkeeping for a DLQ replay: the envelope goes back to
    /// the main list as if freshly enqueued.
    pub fn reset_for_replay(&mut self) {
        self.metadata.retry_count = 0;
        self.metadata.enqueued_at = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.metadata.moved_to_dlq_at = None;
        self.metadata.worker_id = None;
    }
}

/// One sink row. Upsert key is `(order_id, sku)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: String,
    pub date_time: String,
    pub buyer: String,
    pub platform: String,
    pub product_name: String,
    pub item_type: String,
    pub parent_sku: String,
    pub sku: String,
    pub quantity: i64,
    pub total_sale: f64,
    pub shopee_status: String,
    pub status: String,
}

/// Settlement line from the payment API. `selling_price` is already the line
/// total (price x quantity).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettlementItem {
    #[serde(default)]
    pub item_sku: Option<String>,
    #[serde(default)]
    pub model_sku: Option<String>,
    #[serde(default)]
    pub selling_price: f64,
    #[serde(default)]
    pub quantity_purchased: i64,
}

/// Settlement figures for one order. `escrow_amount` is the actual wallet
/// deposit and the ground truth for net income.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settlement {
    pub escrow_amount: f64,
    pub items: Vec<SettlementItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Startup,
    Scheduled,
    Daily,
    Manual,
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncType::Startup => "startup",
            SyncType::Scheduled => "scheduled",
            SyncType::Daily => "daily",
            SyncType::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Result of one reconciliation sweep; the history list keeps the 10 most
/// recent and at most 5 error strings per entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub sync_type: SyncType,
    pub started_at: f64,
    pub completed_at: f64,
    pub time_from: i64,
    pub time_to: i64,
    pub orders_fetched: u64,
    pub orders_processed: u64,
    pub orders_skipped: u64,
    pub errors: Vec<String>,
    pub success: bool,
}

/// Outcome of a single fan-out sink, recorded in the audit entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwarderStatus {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub method: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub telegram: DeliveryStatus,
    pub forwarder: ForwarderStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_id_embeds_order_sn() {
        let payload =
            json!({"code": 3, "shop_id": 10, "data": {"ordersn": "A1", "status": "READY_TO_SHIP"}});
        let env = WebhookEnvelope::new(payload, 3);
        assert!(env.id.starts_with("wh_"));
        assert!(env.id.ends_with("_A1"));
        assert_eq!(env.metadata.retry_count, 0);
        assert_eq!(env.metadata.max_retries, 3);
        assert!(env.metadata.moved_to_dlq_at.is_none());
    }

    #[test]
    fn envelope_id_falls_back_to_unknown() {
        let env = WebhookEnvelope::new(json!({"code": 8, "data": {}}), 3);
        assert!(env.id.ends_with("_unknown"));
    }

    #[test]
    fn replay_reset_clears_dlq_metadata() {
        let mut env = WebhookEnvelope::new(json!({"code": 3, "data": {"ordersn": "B2"}}), 3);
        env.metadata.retry_count = 3;
        env.metadata.moved_to_dlq_at = Some(1.0);
        env.metadata.worker_id = Some(2);

        env.reset_for_replay();

        assert_eq!(env.metadata.retry_count, 0);
        assert!(env.metadata.moved_to_dlq_at.is_none());
        assert!(env.metadata.worker_id.is_none());
    }

    #[test]
    fn raw_event_accepts_order_sn_alias_and_unknown_fields() {
        let event: RawEvent = serde_json::from_value(json!({
            "code": 3,
            "shop_id": 1,
            "timestamp": 1704337899,
            "data": {"order_sn": "X9", "status": "SHIPPED", "tracking_no": "SG123"},
            "region": "SG"
        }))
        .unwrap();

        assert_eq!(event.order_sn(), Some("X9"));
        assert_eq!(event.status(), Some("SHIPPED"));
        assert!(event.is_order_event());
        assert!(event.data.extra.contains_key("tracking_no"));
        assert!(event.extra.contains_key("region"));
    }

    #[test]
    fn envelope_payload_round_trips_verbatim() {
        let payload = json!({"code": 3, "data": {"ordersn": "A1"}, "custom": {"nested": [1, 2]}});
        let env = WebhookEnvelope::new(payload.clone(), 3);
        let json = serde_json::to_string(&env).unwrap();
        let back: WebhookEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, payload);
        assert_eq!(back.id, env.id);
    }
}
