//! Application configuration
//!
//! All settings come from environment variables (with .env support), in the
//! same shape the receiver and worker containers are deployed with. Business
//! constants shared by both binaries live at the bottom of this module.

use anyhow::{Context, Result};

/// Event codes that carry order information (3 = status update, 4 = tracking).
pub const ORDER_EVENT_CODES: &[i64] = &[3, 4];

/// Order statuses that are acknowledged but never stored.
pub const IGNORE_STATUSES: &[&str] = &["UNPAID"];

/// Platform tag written into every sink row.
pub const PLATFORM_NAME: &str = "Shopee";

/// Daily audit files and human-readable sync timestamps use this fixed offset
/// (Singapore, UTC+8).
pub const TIMEZONE_OFFSET_HOURS: i32 = 8;

#[derive(Debug, Clone)]
pub struct Settings {
    // Upstream API credentials
    pub partner_id: i64,
    pub partner_key: String,
    pub shop_id: i64,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub webhook_partner_key: Option<String>,
    pub host_api: String,

    // Receiver HTTP server
    pub host: String,
    pub port: u16,

    // Telegram notifier
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub messages_per_minute: u32,

    // HTTP fallback forwarding
    pub forward_webhook_url: Option<String>,

    // Dashboard auth
    pub dashboard_api_key: Option<String>,

    // Redis queue
    pub redis_enabled: bool,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: i64,
    pub redis_max_retries: u32,
    pub redis_num_workers: usize,
    pub redis_brpop_timeout: u64,

    // Reconciliation
    pub sync_interval_hours: u64,
    pub daily_sync_hour: u32,
    pub historical_days: i64,
    pub sync_overlap_hours: i64,
    pub sync_timeout_seconds: u64,
    pub api_call_delay_ms: u64,
    pub order_detail_batch_size: usize,

    // Persistent file locations
    pub config_dir: String,
    pub logs_dir: String,
    pub sink_db_path: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let partner_id = std::env::var("PARTNER_ID")
            .context("PARTNER_ID is required")?
            .parse()
            .context("PARTNER_ID must be an integer")?;

        let partner_key = std::env::var("PARTNER_KEY").context("PARTNER_KEY is required")?;

        let shop_id = std::env::var("SHOP_ID")
            .context("SHOP_ID is required")?
            .parse()
            .context("SHOP_ID must be an integer")?;

        let access_token = std::env::var("ACCESS_TOKEN").unwrap_or_default();
        let refresh_token = std::env::var("REFRESH_TOKEN").ok().filter(|v| !v.is_empty());
        let webhook_partner_key = std::env::var("WEBHOOK_PARTNER_KEY")
            .ok()
            .filter(|v| !v.is_empty());

        let host_api = std::env::var("HOST_API")
            .unwrap_or_else(|_| "https://partner.shopeemobile.com".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env_parse("PORT", 8000);

        let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        let telegram_chat_id = std::env::var("TELEGRAM_CHAT_ID")
            .ok()
            .filter(|v| !v.is_empty());
        let messages_per_minute = env_parse("TELEGRAM_MESSAGES_PER_MINUTE", 15u32).max(1);

        let forward_webhook_url = std::env::var("FORWARD_WEBHOOK_URL")
            .ok()
            .filter(|v| !v.is_empty());

        let dashboard_api_key = std::env::var("DASHBOARD_API_KEY")
            .ok()
            .filter(|v| !v.is_empty());

        Ok(Self {
            partner_id,
            partner_key,
            shop_id,
            access_token,
            refresh_token,
            webhook_partner_key,
            host_api,
            host,
            port,
            telegram_bot_token,
            telegram_chat_id,
            messages_per_minute,
            forward_webhook_url,
            dashboard_api_key,
            redis_enabled: env_bool("REDIS_ENABLED", true),
            redis_host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "redis".to_string()),
            redis_port: env_parse("REDIS_PORT", 6379),
            redis_db: env_parse("REDIS_DB", 0),
            redis_max_retries: env_parse("REDIS_MAX_RETRIES", 3u32),
            redis_num_workers: env_parse("REDIS_NUM_WORKERS", 3usize).max(1),
            redis_brpop_timeout: env_parse("REDIS_BRPOP_TIMEOUT", 30u64).max(1),
            sync_interval_hours: env_parse("SYNC_INTERVAL_HOURS", 1u64).max(1),
            daily_sync_hour: env_parse("DAILY_SYNC_HOUR", 3u32).min(23),
            historical_days: env_parse("HISTORICAL_DAYS", 7i64).max(1),
            sync_overlap_hours: env_parse("SYNC_OVERLAP_HOURS", 2i64).max(1),
            sync_timeout_seconds: env_parse("SYNC_TIMEOUT_SECONDS", 600u64).max(1),
            api_call_delay_ms: env_parse("API_CALL_DELAY_MS", 200u64),
            order_detail_batch_size: env_parse("ORDER_DETAIL_BATCH_SIZE", 50usize).max(1),
            config_dir: std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string()),
            logs_dir: std::env::var("LOGS_DIR").unwrap_or_else(|_| "logs".to_string()),
            sink_db_path: std::env::var("SINK_DB_PATH")
                .unwrap_or_else(|_| "shopflow_orders.db".to_string()),
        })
    }

    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }

    pub fn token_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.config_dir).join("shopee_tokens.json")
    }

    pub fn topics_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.config_dir).join("telegram_topics.json")
    }

    pub fn runtime_config_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.config_dir).join("runtime_config.json")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_recognizes_common_forms() {
        std::env::set_var("SHOPFLOW_TEST_BOOL", "on");
        assert!(env_bool("SHOPFLOW_TEST_BOOL", false));
        std::env::set_var("SHOPFLOW_TEST_BOOL", "0");
        assert!(!env_bool("SHOPFLOW_TEST_BOOL", true));
        std::env::remove_var("SHOPFLOW_TEST_BOOL");
        assert!(env_bool("SHOPFLOW_TEST_BOOL", true));
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("SHOPFLOW_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse("SHOPFLOW_TEST_PARSE", 42u64), 42);
        std::env::remove_var("SHOPFLOW_TEST_PARSE");
    }
}
