//! Integration tests for the webhook processing flow.
//!
//! Drives WebhookProcessor end to end against a scripted upstream API and
//! an in-memory sink: the ignore rules, the assemble-and-upsert happy path
//! with pro-rata settlement, and the failure paths that feed the queue's
//! retry machinery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use shopflow_backend::error::{ProcessError, ProcessResult};
use shopflow_backend::models::{Settlement, SettlementItem};
use shopflow_backend::processor::WebhookProcessor;
use shopflow_backend::sink::{MemoryOrderSink, OrderItemSink};
use shopflow_backend::upstream::client::{ApiOrderDetail, ApiOrderItem, OrderListEntry};
use shopflow_backend::upstream::{OrderService, ShopeeApi};

/// Upstream double: serves pre-scripted orders and settlements, counting
/// detail fetches so tests can assert which paths avoid the API.
#[derive(Default)]
struct ScriptedApi {
    orders: HashMap<String, ApiOrderDetail>,
    settlements: HashMap<String, Settlement>,
    detail_calls: AtomicUsize,
}

impl ScriptedApi {
    fn with_order(mut self, order: ApiOrderDetail) -> Self {
        self.orders.insert(order.order_sn.clone(), order);
        self
    }

    fn with_settlement(mut self, order_sn: &str, settlement: Settlement) -> Self {
        self.settlements.insert(order_sn.to_string(), settlement);
        self
    }

    fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShopeeApi for ScriptedApi {
    async fn get_order_detail(&self, order_sn_list: &[String]) -> ProcessResult<Vec<ApiOrderDetail>> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        Ok(order_sn_list
            .iter()
            .filter_map(|sn| self.orders.get(sn).cloned())
            .collect())
    }

    async fn get_escrow_detail(&self, order_sn: &str) -> ProcessResult<Settlement> {
        self.settlements
            .get(order_sn)
            .cloned()
            .ok_or_else(|| ProcessError::upstream("order has not settled yet"))
    }

    async fn get_order_list(
        &self,
        _time_from: i64,
        _time_to: i64,
    ) -> ProcessResult<Vec<OrderListEntry>> {
        Ok(Vec::new())
    }
}

fn order(order_sn: &str, status: &str, items: Vec<ApiOrderItem>) -> ApiOrderDetail {
    ApiOrderDetail {
        order_sn: order_sn.to_string(),
        shop_id: Some(10),
        buyer_username: Some("buyer1".to_string()),
        order_status: status.to_string(),
        create_time: 1_704_337_899,
        update_time: 1_704_337_899,
        total_amount: Some(100.0),
        currency: Some("SGD".to_string()),
        payment_method: None,
        shipping_carrier: None,
        item_list: items,
        recipient_address: None,
    }
}

fn item(model_sku: &str, name: &str) -> ApiOrderItem {
    ApiOrderItem {
        item_name: Some(name.to_string()),
        item_sku: Some("PARENT".to_string()),
        model_name: Some("variant".to_string()),
        model_sku: Some(model_sku.to_string()),
        model_quantity_purchased: Some(1),
        model_discounted_price: Some(50.0),
    }
}

fn settlement(escrow: f64, lines: &[(&str, f64)]) -> Settlement {
    Settlement {
        escrow_amount: escrow,
        items: lines
            .iter()
            .map(|(sku, price)| SettlementItem {
                item_sku: None,
                model_sku: Some(sku.to_string()),
                selling_price: *price,
                quantity_purchased: 1,
            })
            .collect(),
    }
}

fn build(api: ScriptedApi) -> (Arc<ScriptedApi>, Arc<MemoryOrderSink>, WebhookProcessor) {
    let api = Arc::new(api);
    let sink = Arc::new(MemoryOrderSink::new());
    let service = Arc::new(OrderService::new(api.clone()));
    let processor = WebhookProcessor::new(service, sink.clone());
    (api, sink, processor)
}

#[tokio::test]
async fn happy_path_upserts_pro_rata_items() {
    let api = ScriptedApi::default()
        .with_order(order(
            "A1",
            "READY_TO_SHIP",
            vec![item("X", "Widget"), item("Y", "Gadget")],
        ))
        .with_settlement("A1", settlement(100.0, &[("X", 60.0), ("Y", 40.0)]));
    let (api, sink, processor) = build(api);

    let payload = json!({
        "code": 3,
        "shop_id": 10,
        "timestamp": 1_704_337_899,
        "data": {"ordersn": "A1", "status": "READY_TO_SHIP"}
    });

    assert!(processor.process_webhook(&payload).await);
    assert_eq!(api.detail_calls(), 1);

    let rows = sink.get_by_order_id("A1").await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].sku, "X");
    assert_eq!(rows[0].total_sale, 60.0);
    assert_eq!(rows[1].sku, "Y");
    assert_eq!(rows[1].total_sale, 40.0);
    assert_eq!(rows[0].platform, "Shopee");
}

#[tokio::test]
async fn unsettled_order_upserts_with_zero_income() {
    let api = ScriptedApi::default().with_order(order("A2", "SHIPPED", vec![item("X", "Widget")]));
    let (_api, sink, processor) = build(api);

    let payload = json!({"code": 3, "shop_id": 10, "data": {"ordersn": "A2", "status": "SHIPPED"}});

    assert!(processor.process_webhook(&payload).await);
    let rows = sink.get_by_order_id("A2").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].total_sale, 0.0);
}

#[tokio::test]
async fn unpaid_event_is_ignored_without_api_call() {
    let (api, sink, processor) = build(ScriptedApi::default());

    let payload = json!({"code": 3, "shop_id": 10, "data": {"ordersn": "C3", "status": "UNPAID"}});

    // Handled correctly by being ignored: success, no fetch, no upsert.
    assert!(processor.process_webhook(&payload).await);
    assert_eq!(api.detail_calls(), 0);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn non_order_event_codes_are_skipped() {
    let (api, sink, processor) = build(ScriptedApi::default());

    let payload = json!({"code": 8, "shop_id": 10, "data": {"something": "else"}});

    assert!(processor.process_webhook(&payload).await);
    assert_eq!(api.detail_calls(), 0);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn missing_order_sn_fails() {
    let (_api, sink, processor) = build(ScriptedApi::default());

    let payload = json!({"code": 3, "shop_id": 10, "data": {"status": "READY_TO_SHIP"}});

    assert!(!processor.process_webhook(&payload).await);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn unknown_order_fails_processing() {
    let (_api, sink, processor) = build(ScriptedApi::default());

    let payload = json!({"code": 3, "shop_id": 10, "data": {"ordersn": "GONE", "status": "SHIPPED"}});

    // The upstream returns no detail; the worker must report failure so the
    // queue retries and eventually dead-letters.
    assert!(!processor.process_webhook(&payload).await);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn stale_webhook_defers_to_current_api_status() {
    let api = ScriptedApi::default().with_order(order("D4", "UNPAID", vec![item("X", "Widget")]));
    let (_api, sink, processor) = build(api);

    // Webhook claims READY_TO_SHIP but the API says the order is back to
    // UNPAID; nothing may reach the sink.
    let payload = json!({"code": 3, "shop_id": 10, "data": {"ordersn": "D4", "status": "READY_TO_SHIP"}});

    assert!(processor.process_webhook(&payload).await);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn sink_failure_propagates_as_processing_failure() {
    let api = ScriptedApi::default().with_order(order("E5", "SHIPPED", vec![item("X", "Widget")]));
    let (_api, sink, processor) = build(api);
    sink.set_failing(true);

    let payload = json!({"code": 3, "shop_id": 10, "data": {"ordersn": "E5", "status": "SHIPPED"}});

    assert!(!processor.process_webhook(&payload).await);
}

#[tokio::test]
async fn reprocessing_is_idempotent() {
    let api = ScriptedApi::default()
        .with_order(order("F6", "SHIPPED", vec![item("X", "Widget")]))
        .with_settlement("F6", settlement(50.0, &[("X", 50.0)]));
    let (_api, sink, processor) = build(api);

    let payload = json!({"code": 3, "shop_id": 10, "data": {"ordersn": "F6", "status": "SHIPPED"}});

    assert!(processor.process_webhook(&payload).await);
    assert!(processor.process_webhook(&payload).await);

    let rows = sink.get_by_order_id("F6").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].total_sale, 50.0);
}
