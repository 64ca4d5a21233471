//! In-memory sink for tests and local runs without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::OrderItemSink;
use crate::models::OrderItem;

#[derive(Default)]
pub struct MemoryOrderSink {
    rows: Mutex<HashMap<(String, String), OrderItem>>,
    fail_upserts: AtomicBool,
}

impl MemoryOrderSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent upsert fail; used to drive retry and DLQ paths
    /// in tests.
    pub fn set_failing(&self, failing: bool) {
        self.fail_upserts.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl OrderItemSink for MemoryOrderSink {
    async fn upsert_items(&self, items: &[OrderItem]) -> bool {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return false;
        }

        let mut rows = self.rows.lock();
        for item in items {
            rows.insert((item.order_id.clone(), item.sku.clone()), item.clone());
        }
        true
    }

    async fn get_by_order_id(&self, order_id: &str) -> Vec<OrderItem> {
        let mut items: Vec<OrderItem> = self
            .rows
            .lock()
            .values()
            .filter(|item| item.order_id == order_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.sku.cmp(&b.sku));
        items
    }

    async fn health_check(&self) -> bool {
        !self.fail_upserts.load(Ordering::SeqCst)
    }
}
