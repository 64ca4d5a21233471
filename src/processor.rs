//! Webhook processing business rules.
//!
//! The worker-side core: decide whether an event matters, pull the full
//! order from the upstream API, and upsert one row per item into the sink.
//! "Handled by ignoring" counts as success so the queue does not retry
//! events that were correctly skipped.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{IGNORE_STATUSES, ORDER_EVENT_CODES};
use crate::models::RawEvent;
use crate::sink::OrderItemSink;
use crate::upstream::OrderService;

pub struct WebhookProcessor {
    order_service: Arc<OrderService>,
    sink: Arc<dyn OrderItemSink>,
}

impl WebhookProcessor {
    pub fn new(order_service: Arc<OrderService>, sink: Arc<dyn OrderItemSink>) -> Self {
        Self {
            order_service,
            sink,
        }
    }

    /// Processes one raw webhook event. Returns true when the event was
    /// handled, including the case where handling it correctly meant
    /// ignoring it.
    pub async fn process_webhook(&self, event_payload: &Value) -> bool {
        let Some(event) = RawEvent::from_value(event_payload) else {
            warn!("Webhook payload is not a recognizable event");
            return false;
        };

        info!(
            code = event.code,
            order = event.order_sn().unwrap_or("unknown"),
            status = event.status().unwrap_or(""),
            "Processing webhook"
        );

        // Orders that have not been paid never reach the sink.
        if let Some(status) = event.status() {
            if IGNORE_STATUSES.contains(&status) {
                info!(status, order = event.order_sn().unwrap_or("unknown"), "Ignoring order");
                return true;
            }
        }

        if !ORDER_EVENT_CODES.contains(&event.code) {
            info!(code = event.code, "Skipping non-order event");
            return true;
        }

        let Some(order_sn) = event.order_sn() else {
            warn!("No order SN in webhook data");
            return false;
        };

        let order = match self.order_service.fetch_order_details(order_sn).await {
            Ok(order) => order,
            Err(e) => {
                error!(order = order_sn, error = %e, "Failed to fetch order");
                return false;
            }
        };

        if order.items.is_empty() {
            warn!(order = order_sn, "No items found for order");
            return true;
        }

        // The webhook status may be stale; what the API says now decides.
        if IGNORE_STATUSES.contains(&order.status.as_str()) {
            info!(order = order_sn, status = %order.status, "Order status ignorable, skipping upsert");
            return true;
        }

        info!(order = order_sn, items = order.items.len(), "Upserting items");
        let success = self.sink.upsert_items(&order.items).await;

        if success {
            info!(order = order_sn, "Successfully processed order");
        } else {
            error!(order = order_sn, "Failed to upsert order");
        }

        success
    }
}
