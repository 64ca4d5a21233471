//! Reconciliation service for order sync.
//!
//! Walks the upstream order list for a time window and re-runs the normal
//! assemble-and-upsert flow per order. A Redis `SET NX EX` lock keeps sweeps
//! single-flight across every process; its TTL doubles as the global sync
//! deadline. Results land in a bounded Redis history list.

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{Settings, IGNORE_STATUSES, TIMEZONE_OFFSET_HOURS};
use crate::models::{SyncResult, SyncType};
use crate::sink::OrderItemSink;
use crate::upstream::{OrderService, ShopeeApi};

pub const RECON_LAST_SYNC: &str = "shopee:reconciliation:last_sync_timestamp";
pub const RECON_LAST_FULL_SYNC: &str = "shopee:reconciliation:last_full_sync_timestamp";
pub const RECON_SYNC_HISTORY: &str = "shopee:reconciliation:sync_history";
pub const RECON_SYNC_LOCK: &str = "shopee:reconciliation:sync_in_progress";

const SYNC_HISTORY_LIMIT: isize = 10;
const MAX_STORED_ERRORS: usize = 5;
const MANUAL_SYNC_MAX_AGE_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub historical_days: i64,
    pub sync_overlap_hours: i64,
    pub sync_timeout_seconds: u64,
    pub api_call_delay_ms: u64,
    pub order_detail_batch_size: usize,
}

impl From<&Settings> for ReconciliationConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            historical_days: settings.historical_days,
            sync_overlap_hours: settings.sync_overlap_hours,
            sync_timeout_seconds: settings.sync_timeout_seconds,
            api_call_delay_ms: settings.api_call_delay_ms,
            order_detail_batch_size: settings.order_detail_batch_size,
        }
    }
}

/// Dashboard view of the sync state.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub last_sync_timestamp: Option<f64>,
    pub last_sync_time_formatted: Option<String>,
    pub last_full_sync_timestamp: Option<f64>,
    pub last_full_sync_time_formatted: Option<String>,
    pub next_scheduled_sync: Option<String>,
    pub sync_in_progress: bool,
    pub sync_history: Vec<Value>,
}

/// Startup catch-up window: resume from the last recorded sync, or reach
/// back `historical_days` when there is none.
fn startup_window(last_sync: Option<f64>, now: i64, historical_days: i64) -> (i64, i64) {
    let time_from = match last_sync {
        Some(ts) => ts as i64,
        None => now - historical_days * 24 * 60 * 60,
    };
    (time_from, now)
}

/// Manual window validation: the end may not be in the future and the start
/// may not reach back further than 30 days.
fn manual_window(time_from: i64, time_to: i64, now: i64) -> (i64, i64) {
    let time_to = time_to.min(now);
    let max_past = now - MANUAL_SYNC_MAX_AGE_DAYS * 24 * 60 * 60;
    let time_from = time_from.max(max_past);
    (time_from, time_to)
}

fn format_timestamp(ts: Option<f64>) -> Option<String> {
    let tz = FixedOffset::east_opt(TIMEZONE_OFFSET_HOURS * 3600).expect("valid fixed offset");
    ts.and_then(|ts| tz.timestamp_opt(ts as i64, 0).single())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn now_unix_f64() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct ReconciliationService {
    api: Arc<dyn ShopeeApi>,
    order_service: Arc<OrderService>,
    sink: Arc<dyn OrderItemSink>,
    con: ConnectionManager,
    config: ReconciliationConfig,
}

impl ReconciliationService {
    pub fn new(
        api: Arc<dyn ShopeeApi>,
        order_service: Arc<OrderService>,
        sink: Arc<dyn OrderItemSink>,
        con: ConnectionManager,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            api,
            order_service,
            sink,
            con,
            config,
        }
    }

    async fn acquire_sync_lock(&self) -> bool {
        let mut con = self.con.clone();
        let acquired: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(RECON_SYNC_LOCK)
            .arg(now_unix_f64().to_string())
            .arg("NX")
            .arg("EX")
            .arg(self.config.sync_timeout_seconds)
            .query_async(&mut con)
            .await;

        match acquired {
            Ok(reply) => reply.is_some(),
            Err(e) => {
                error!(error = %e, "Failed to acquire sync lock");
                false
            }
        }
    }

    async fn release_sync_lock(&self) {
        let mut con = self.con.clone();
        let released: redis::RedisResult<i64> = con.del(RECON_SYNC_LOCK).await;
        if let Err(e) = released {
            error!(error = %e, "Failed to release sync lock");
        }
    }

    async fn is_sync_in_progress(&self) -> bool {
        let mut con = self.con.clone();
        con.exists(RECON_SYNC_LOCK).await.unwrap_or(false)
    }

    /// Pushes the result onto the bounded history list and rolls the
    /// last-sync watermarks forward when the sweep succeeded.
    async fn record_sync_result(&self, result: &SyncResult) {
        let mut entry = result.clone();
        entry.errors.truncate(MAX_STORED_ERRORS);

        let mut con = self.con.clone();
        match serde_json::to_string(&entry) {
            Ok(json) => {
                let pushed: redis::RedisResult<i64> = con.lpush(RECON_SYNC_HISTORY, json).await;
                if pushed.is_ok() {
                    let trimmed: redis::RedisResult<()> =
                        con.ltrim(RECON_SYNC_HISTORY, 0, SYNC_HISTORY_LIMIT - 1).await;
                    if let Err(e) = trimmed {
                        warn!(error = %e, "Failed to trim sync history");
                    }
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize sync result"),
        }

        if result.success {
            let set: redis::RedisResult<()> = con
                .set(RECON_LAST_SYNC, result.completed_at.to_string())
                .await;
            if let Err(e) = set {
                error!(error = %e, "Failed to update last sync timestamp");
            }

            if result.sync_type == SyncType::Daily {
                let set: redis::RedisResult<()> = con
                    .set(RECON_LAST_FULL_SYNC, result.completed_at.to_string())
                    .await;
                if let Err(e) = set {
                    error!(error = %e, "Failed to update last full sync timestamp");
                }
            }
        }
    }

    /// Core sweep: fetch the order list for the window and run each order
    /// through the normal assemble-and-upsert flow.
    pub async fn sync_orders_in_range(
        &self,
        time_from: i64,
        time_to: i64,
        sync_type: SyncType,
    ) -> SyncResult {
        let started_at = now_unix_f64();

        info!(
            %sync_type,
            from = format_timestamp(Some(time_from as f64)).unwrap_or_default(),
            to = format_timestamp(Some(time_to as f64)).unwrap_or_default(),
            "Starting sync"
        );

        if !self.acquire_sync_lock().await {
            warn!("Sync already in progress, skipping");
            let result = SyncResult {
                sync_type,
                started_at,
                completed_at: now_unix_f64(),
                time_from,
                time_to,
                orders_fetched: 0,
                orders_processed: 0,
                orders_skipped: 0,
                errors: vec!["Sync already in progress".to_string()],
                success: false,
            };
            self.record_sync_result(&result).await;
            return result;
        }

        let result = self.run_sync(time_from, time_to, sync_type, started_at).await;
        self.record_sync_result(&result).await;
        self.release_sync_lock().await;

        info!(
            processed = result.orders_processed,
            fetched = result.orders_fetched,
            skipped = result.orders_skipped,
            errors = result.errors.len(),
            "Sync completed"
        );

        result
    }

    async fn run_sync(
        &self,
        time_from: i64,
        time_to: i64,
        sync_type: SyncType,
        started_at: f64,
    ) -> SyncResult {
        let mut orders_processed = 0u64;
        let mut orders_skipped = 0u64;
        let mut errors: Vec<String> = Vec::new();

        let order_list = match self.api.get_order_list(time_from, time_to).await {
            Ok(list) => list,
            Err(e) => {
                let error_msg = format!("Sync failed: {e}");
                error!(error = %e, "Failed to fetch order list");
                return SyncResult {
                    sync_type,
                    started_at,
                    completed_at: now_unix_f64(),
                    time_from,
                    time_to,
                    orders_fetched: 0,
                    orders_processed: 0,
                    orders_skipped: 0,
                    errors: vec![error_msg],
                    success: false,
                };
            }
        };

        let orders_fetched = order_list.len() as u64;
        info!(orders_fetched, "Fetched orders from upstream API");

        let batch_size = self.config.order_detail_batch_size.max(1);
        for (batch_idx, batch) in order_list.chunks(batch_size).enumerate() {
            info!(batch = batch_idx + 1, orders = batch.len(), "Processing batch");

            for entry in batch {
                let order_status = entry.order_status.as_deref().unwrap_or("");
                if IGNORE_STATUSES.contains(&order_status) {
                    orders_skipped += 1;
                    debug!(order = %entry.order_sn, status = order_status, "Skipping order");
                    continue;
                }

                match self.order_service.fetch_order_details(&entry.order_sn).await {
                    Ok(order) => {
                        if order.items.is_empty() {
                            debug!(order = %entry.order_sn, "No items found for order");
                        } else if self.sink.upsert_items(&order.items).await {
                            orders_processed += 1;
                        } else {
                            errors.push(format!("Failed to upsert order {}", entry.order_sn));
                        }
                    }
                    Err(e) => {
                        let error_msg = format!("Error processing order {}: {e}", entry.order_sn);
                        error!(order = %entry.order_sn, error = %e, "Order sync failed");
                        errors.push(error_msg);
                    }
                }

                // Pacing between upstream calls.
                tokio::time::sleep(Duration::from_millis(self.config.api_call_delay_ms)).await;
            }
        }

        let success = errors.is_empty() || orders_processed > 0;
        SyncResult {
            sync_type,
            started_at,
            completed_at: now_unix_f64(),
            time_from,
            time_to,
            orders_fetched,
            orders_processed,
            orders_skipped,
            errors,
            success,
        }
    }

    /// Startup catch-up: resume where the last recorded sync ended.
    pub async fn startup_catchup_sync(&self) -> SyncResult {
        info!("Running startup catch-up sync");

        let mut con = self.con.clone();
        let last_sync: Option<String> = con.get(RECON_LAST_SYNC).await.unwrap_or(None);
        let last_sync = last_sync.and_then(|v| v.parse::<f64>().ok());

        let now = Utc::now().timestamp();
        let (time_from, time_to) = startup_window(last_sync, now, self.config.historical_days);

        match last_sync {
            Some(_) => info!(
                from = format_timestamp(Some(time_from as f64)).unwrap_or_default(),
                "Catching up since last sync"
            ),
            None => info!(
                days = self.config.historical_days,
                "No previous sync found, syncing history"
            ),
        }

        self.sync_orders_in_range(time_from, time_to, SyncType::Startup)
            .await
    }

    /// Hourly sweep over the overlap window.
    pub async fn scheduled_sync(&self) -> SyncResult {
        info!("Running scheduled sync");
        let now = Utc::now().timestamp();
        let time_from = now - self.config.sync_overlap_hours * 60 * 60;
        self.sync_orders_in_range(time_from, now, SyncType::Scheduled)
            .await
    }

    /// Daily full sweep over `historical_days`.
    pub async fn daily_full_sync(&self) -> SyncResult {
        info!("Running daily full sync");
        let now = Utc::now().timestamp();
        let time_from = now - self.config.historical_days * 24 * 60 * 60;
        self.sync_orders_in_range(time_from, now, SyncType::Daily)
            .await
    }

    /// Operator-triggered range sync with clamped bounds.
    pub async fn manual_sync(&self, time_from: i64, time_to: i64) -> SyncResult {
        let now = Utc::now().timestamp();
        let (time_from, time_to) = manual_window(time_from, time_to, now);
        info!(time_from, time_to, "Running manual sync");
        self.sync_orders_in_range(time_from, time_to, SyncType::Manual)
            .await
    }

    pub async fn get_sync_status(&self, next_scheduled: Option<String>) -> SyncStatus {
        let mut con = self.con.clone();

        let last_sync: Option<String> = con.get(RECON_LAST_SYNC).await.unwrap_or(None);
        let last_full_sync: Option<String> = con.get(RECON_LAST_FULL_SYNC).await.unwrap_or(None);

        let last_sync_ts = last_sync.and_then(|v| v.parse::<f64>().ok());
        let last_full_sync_ts = last_full_sync.and_then(|v| v.parse::<f64>().ok());

        let history_raw: Vec<String> = con
            .lrange(RECON_SYNC_HISTORY, 0, SYNC_HISTORY_LIMIT - 1)
            .await
            .unwrap_or_default();
        let sync_history = history_raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect();

        SyncStatus {
            last_sync_timestamp: last_sync_ts,
            last_sync_time_formatted: format_timestamp(last_sync_ts),
            last_full_sync_timestamp: last_full_sync_ts,
            last_full_sync_time_formatted: format_timestamp(last_full_sync_ts),
            next_scheduled_sync: next_scheduled,
            sync_in_progress: self.is_sync_in_progress().await,
            sync_history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 24 * 60 * 60;

    #[test]
    fn startup_window_resumes_from_last_sync() {
        let now = 1_700_000_000;
        let (from, to) = startup_window(Some(1_699_990_000.0), now, 7);
        assert_eq!(from, 1_699_990_000);
        assert_eq!(to, now);
    }

    #[test]
    fn startup_window_defaults_to_historical_days() {
        let now = 1_700_000_000;
        let (from, to) = startup_window(None, now, 7);
        assert_eq!(from, now - 7 * DAY);
        assert_eq!(to, now);
    }

    #[test]
    fn manual_window_clamps_future_end() {
        let now = 1_700_000_000;
        let (from, to) = manual_window(now - DAY, now + DAY, now);
        assert_eq!(from, now - DAY);
        assert_eq!(to, now);
    }

    #[test]
    fn manual_window_clamps_old_start() {
        let now = 1_700_000_000;
        let (from, to) = manual_window(now - 60 * DAY, now - DAY, now);
        assert_eq!(from, now - 30 * DAY);
        assert_eq!(to, now - DAY);
    }

    #[test]
    fn manual_window_passes_valid_range_through() {
        let now = 1_700_000_000;
        let (from, to) = manual_window(now - 2 * DAY, now - DAY, now);
        assert_eq!(from, now - 2 * DAY);
        assert_eq!(to, now - DAY);
    }

    #[test]
    fn format_timestamp_uses_local_offset() {
        // 2023-11-14 22:13:20 UTC == 2023-11-15 06:13:20 UTC+8
        let formatted = format_timestamp(Some(1_700_000_000.0)).unwrap();
        assert_eq!(formatted, "2023-11-15 06:13:20");
        assert_eq!(format_timestamp(None), None);
    }
}
