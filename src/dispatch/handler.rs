//! Background webhook fan-out.
//!
//! Runs after the 200-empty ack has already been sent, so nothing here may
//! fail the request: every error becomes part of the audit entry instead.
//! Per event: attempt order assembly (codes 3/4), enqueue the chat
//! notification, forward to the queue/fallback, then append the audit line
//! with the aggregated processing status.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info};

use super::forwarder::WebhookForwarder;
use crate::config::ORDER_EVENT_CODES;
use crate::event_log::EventLog;
use crate::models::{DeliveryStatus, ForwarderStatus, ProcessingStatus, RawEvent};
use crate::notify::NotificationQueue;
use crate::queue::WebhookQueueProducer;
use crate::upstream::{AssembledOrder, OrderService};

pub struct WebhookDispatcher {
    order_service: Option<Arc<OrderService>>,
    notification_queue: Option<Arc<NotificationQueue>>,
    producer: Option<Arc<WebhookQueueProducer>>,
    forwarder: WebhookForwarder,
    event_log: Arc<EventLog>,
}

fn utc_now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

impl WebhookDispatcher {
    pub fn new(
        order_service: Option<Arc<OrderService>>,
        notification_queue: Option<Arc<NotificationQueue>>,
        producer: Option<Arc<WebhookQueueProducer>>,
        forwarder: WebhookForwarder,
        event_log: Arc<EventLog>,
    ) -> Self {
        Self {
            order_service,
            notification_queue,
            producer,
            forwarder,
            event_log,
        }
    }

    /// Processes one validated event end to end. Infallible by design: the
    /// caller has already acked.
    pub async fn handle_event(
        &self,
        event_payload: Value,
        authorization: Option<String>,
        body_size: usize,
    ) {
        let event = RawEvent::from_value(&event_payload).unwrap_or_else(|| RawEvent {
            code: 0,
            shop_id: 0,
            timestamp: 0,
            data: Default::default(),
            extra: Default::default(),
        });

        info!(code = event.code, shop_id = event.shop_id, "Processing webhook");

        // Order events get full detail attached to the notification when the
        // upstream fetch succeeds; a failure here never blocks fan-out.
        let order = self.assemble_order(&event).await;

        let telegram = self.notify(&event, order.as_ref());
        let forwarder = self.forward(&event_payload).await;

        let processing_status = ProcessingStatus {
            telegram,
            forwarder,
        };

        let event_data = event_payload
            .get("data")
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        if let Err(e) = self.event_log.log_event(
            event.code,
            event.shop_id,
            &event_data,
            authorization.as_deref(),
            body_size,
            Some(&processing_status),
        ) {
            error!(error = %e, "Error logging processing status");
        }

        info!(
            code = event.code,
            shop_id = event.shop_id,
            "Background processing completed"
        );
    }

    async fn assemble_order(&self, event: &RawEvent) -> Option<AssembledOrder> {
        let order_service = self.order_service.as_ref()?;
        if !ORDER_EVENT_CODES.contains(&event.code) {
            return None;
        }
        let order_sn = event.order_sn()?;

        match order_service.fetch_order_details(order_sn).await {
            Ok(order) => Some(order),
            Err(e) => {
                error!(order = order_sn, error = %e, "Error processing order webhook");
                None
            }
        }
    }

    fn notify(&self, event: &RawEvent, order: Option<&AssembledOrder>) -> DeliveryStatus {
        let Some(queue) = self.notification_queue.as_ref() else {
            return DeliveryStatus {
                success: false,
                error: Some("telegram not configured".to_string()),
                timestamp: Some(utc_now_iso()),
            };
        };

        let event_data = serde_json::to_value(&event.data).unwrap_or_default();
        let queued = queue.enqueue(event.code, event.shop_id, event_data, order.cloned());

        DeliveryStatus {
            success: queued,
            error: (!queued).then(|| "notification queue rejected message".to_string()),
            timestamp: Some(utc_now_iso()),
        }
    }

    async fn forward(&self, event_payload: &Value) -> ForwarderStatus {
        let outcome = self
            .forwarder
            .forward_webhook(self.producer.as_deref(), event_payload)
            .await;

        ForwarderStatus {
            success: outcome.success,
            error: (!outcome.success).then(|| {
                outcome
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string())
            }),
            method: outcome.method,
            attempts: outcome.attempts,
            timestamp: Some(utc_now_iso()),
        }
    }
}
