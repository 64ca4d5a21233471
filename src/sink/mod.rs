//! Order item sink abstraction.
//!
//! Storage backends are swappable; everything upstream only needs idempotent
//! upserts keyed by `(order_id, sku)`.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::models::OrderItem;

pub use memory::MemoryOrderSink;
pub use sqlite::SqliteOrderSink;

#[async_trait]
pub trait OrderItemSink: Send + Sync {
    /// Inserts or updates rows keyed by `(order_id, sku)`. Returns true only
    /// when the whole batch landed.
    async fn upsert_items(&self, items: &[OrderItem]) -> bool;

    async fn get_by_order_id(&self, order_id: &str) -> Vec<OrderItem>;

    async fn health_check(&self) -> bool;
}
