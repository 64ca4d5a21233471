//! SQLite-backed order item sink.
//!
//! Local tabular storage with the same contract the hosted backends honor:
//! one row per `(order_id, sku)`, last write wins. WAL mode keeps dashboard
//! reads cheap while workers upsert.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{error, info, warn};

use super::OrderItemSink;
use crate::models::OrderItem;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS order_items (
    order_id TEXT NOT NULL,
    date_time TEXT NOT NULL DEFAULT '',
    buyer TEXT NOT NULL DEFAULT '',
    platform TEXT NOT NULL DEFAULT '',
    product_name TEXT NOT NULL DEFAULT '',
    item_type TEXT NOT NULL DEFAULT '',
    parent_sku TEXT NOT NULL DEFAULT '',
    sku TEXT NOT NULL,
    quantity INTEGER NOT NULL DEFAULT 1,
    total_sale REAL NOT NULL DEFAULT 0,
    shopee_status TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT '',
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (order_id, sku)
);

CREATE INDEX IF NOT EXISTS idx_order_items_status
    ON order_items(status, updated_at DESC);
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO order_items (
    order_id, date_time, buyer, platform, product_name, item_type,
    parent_sku, sku, quantity, total_sale, shopee_status, status, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, strftime('%s', 'now'))
ON CONFLICT(order_id, sku) DO UPDATE SET
    date_time = excluded.date_time,
    buyer = excluded.buyer,
    platform = excluded.platform,
    product_name = excluded.product_name,
    item_type = excluded.item_type,
    parent_sku = excluded.parent_sku,
    quantity = excluded.quantity,
    total_sale = excluded.total_sale,
    shopee_status = excluded.shopee_status,
    status = excluded.status,
    updated_at = strftime('%s', 'now')
"#;

pub struct SqliteOrderSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteOrderSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open sink database {:?}", path.as_ref()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply sink schema")?;

        info!(path = %path.as_ref().display(), "Order sink database initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply sink schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn upsert_batch(&self, items: &[OrderItem]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for item in items {
                stmt.execute(params![
                    item.order_id,
                    item.date_time,
                    item.buyer,
                    item.platform,
                    item.product_name,
                    item.item_type,
                    item.parent_sku,
                    item.sku,
                    item.quantity,
                    item.total_sale,
                    item.shopee_status,
                    item.status,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query_by_order(&self, order_id: &str) -> Result<Vec<OrderItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, date_time, buyer, platform, product_name, item_type,
                    parent_sku, sku, quantity, total_sale, shopee_status, status
             FROM order_items WHERE order_id = ?1 ORDER BY sku",
        )?;

        let rows = stmt.query_map(params![order_id], |row| {
            Ok(OrderItem {
                order_id: row.get(0)?,
                date_time: row.get(1)?,
                buyer: row.get(2)?,
                platform: row.get(3)?,
                product_name: row.get(4)?,
                item_type: row.get(5)?,
                parent_sku: row.get(6)?,
                sku: row.get(7)?,
                quantity: row.get(8)?,
                total_sale: row.get(9)?,
                shopee_status: row.get(10)?,
                status: row.get(11)?,
            })
        })?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

#[async_trait]
impl OrderItemSink for SqliteOrderSink {
    async fn upsert_items(&self, items: &[OrderItem]) -> bool {
        if items.is_empty() {
            return true;
        }

        match self.upsert_batch(items) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to upsert order items");
                false
            }
        }
    }

    async fn get_by_order_id(&self, order_id: &str) -> Vec<OrderItem> {
        match self.query_by_order(order_id) {
            Ok(items) => items,
            Err(e) => {
                warn!(order_id, error = %e, "Failed to query order items");
                Vec::new()
            }
        }
    }

    async fn health_check(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|v| v == 1)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(order_id: &str, sku: &str, total_sale: f64, status: &str) -> OrderItem {
        OrderItem {
            order_id: order_id.to_string(),
            date_time: "2024-01-04T03:11:39".to_string(),
            buyer: "buyer1".to_string(),
            platform: "Shopee".to_string(),
            product_name: "Widget".to_string(),
            item_type: "variant".to_string(),
            parent_sku: "P".to_string(),
            sku: sku.to_string(),
            quantity: 1,
            total_sale,
            shopee_status: status.to_string(),
            status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let sink = SqliteOrderSink::in_memory().unwrap();
        let items = vec![item("A1", "X", 60.0, "READY_TO_SHIP"), item("A1", "Y", 40.0, "READY_TO_SHIP")];

        assert!(sink.upsert_items(&items).await);
        assert!(sink.upsert_items(&items).await);

        let stored = sink.get_by_order_id("A1").await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].total_sale, 60.0);
        assert_eq!(stored[1].total_sale, 40.0);
    }

    #[tokio::test]
    async fn upsert_updates_on_status_change() {
        let sink = SqliteOrderSink::in_memory().unwrap();

        assert!(sink.upsert_items(&[item("A1", "X", 0.0, "READY_TO_SHIP")]).await);
        assert!(sink.upsert_items(&[item("A1", "X", 60.0, "COMPLETED")]).await);

        let stored = sink.get_by_order_id("A1").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, "COMPLETED");
        assert_eq!(stored[0].total_sale, 60.0);
    }

    #[tokio::test]
    async fn orders_are_isolated_by_id() {
        let sink = SqliteOrderSink::in_memory().unwrap();

        sink.upsert_items(&[item("A1", "X", 1.0, "SHIPPED")]).await;
        sink.upsert_items(&[item("B2", "X", 2.0, "SHIPPED")]).await;

        assert_eq!(sink.get_by_order_id("A1").await.len(), 1);
        assert_eq!(sink.get_by_order_id("B2").await.len(), 1);
        assert!(sink.get_by_order_id("C3").await.is_empty());
    }

    #[tokio::test]
    async fn health_check_reports_ok() {
        let sink = SqliteOrderSink::in_memory().unwrap();
        assert!(sink.health_check().await);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op_success() {
        let sink = SqliteOrderSink::in_memory().unwrap();
        assert!(sink.upsert_items(&[]).await);
    }
}
