//! Runtime configuration with JSON file persistence.
//!
//! Dashboard-editable settings (notifier, forwarder, monitoring) that
//! survive restarts without a rebuild. Updates merge over the existing
//! section so callers can toggle `enabled` without resending secrets.
//! Writes go through a temp file and rename.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::config::Settings;

pub const SECTION_NOTIFIER: &str = "notifier";
pub const SECTION_FORWARDER: &str = "forwarder";
pub const SECTION_MONITORING: &str = "monitoring";

const SECTIONS: &[&str] = &[SECTION_NOTIFIER, SECTION_FORWARDER, SECTION_MONITORING];

pub struct RuntimeConfig {
    path: PathBuf,
    cache: RwLock<Map<String, Value>>,
}

fn empty_sections() -> Map<String, Value> {
    SECTIONS
        .iter()
        .map(|s| (s.to_string(), json!({})))
        .collect()
}

impl RuntimeConfig {
    /// Loads the config file, or seeds it from the environment on first run
    /// so the dashboard reflects the deployed configuration.
    pub fn load(path: PathBuf, settings: &Settings) -> Self {
        let config = Self {
            path,
            cache: RwLock::new(empty_sections()),
        };

        match std::fs::read_to_string(&config.path) {
            Ok(raw) => match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(parsed) => {
                    *config.cache.write() = parsed;
                    info!(path = %config.path.display(), "Loaded runtime config");
                }
                Err(e) => {
                    error!(error = %e, "Failed to parse runtime config, reinitializing");
                    config.initialize_from_env(settings);
                }
            },
            Err(_) => {
                info!("No runtime config file found, initializing from environment");
                config.initialize_from_env(settings);
            }
        }

        config
    }

    fn initialize_from_env(&self, settings: &Settings) {
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut sections = empty_sections();

        if let (Some(bot_token), Some(chat_id)) =
            (&settings.telegram_bot_token, &settings.telegram_chat_id)
        {
            sections.insert(
                SECTION_NOTIFIER.to_string(),
                json!({
                    "enabled": true,
                    "bot_token": bot_token,
                    "chat_id": chat_id,
                    "initialized_from": "environment",
                    "updated_at": now,
                }),
            );
            info!("Initialized notifier config from environment");
        }

        if let Some(url) = &settings.forward_webhook_url {
            sections.insert(
                SECTION_FORWARDER.to_string(),
                json!({
                    "enabled": true,
                    "url": url,
                    "initialized_from": "environment",
                    "updated_at": now,
                }),
            );
            info!("Initialized forwarder config from environment");
        }

        *self.cache.write() = sections;
        if let Err(e) = self.persist() {
            error!(error = %e, "Failed to save initial runtime config");
        }
    }

    pub fn is_known_section(section: &str) -> bool {
        SECTIONS.contains(&section)
    }

    /// Current contents of a section (empty object if never configured).
    pub fn get(&self, section: &str) -> Value {
        self.cache
            .read()
            .get(section)
            .cloned()
            .unwrap_or_else(|| json!({}))
    }

    /// Merges a partial update into a section and persists. Keys absent from
    /// `partial` keep their previous values, which is how secrets survive an
    /// enable/disable toggle from the dashboard.
    pub fn update(&self, section: &str, partial: Map<String, Value>) -> Result<Value> {
        anyhow::ensure!(
            Self::is_known_section(section),
            "unknown config section: {section}"
        );

        let merged = {
            let mut cache = self.cache.write();
            let existing = cache
                .entry(section.to_string())
                .or_insert_with(|| json!({}));

            let mut merged = existing.as_object().cloned().unwrap_or_default();
            for (key, value) in partial {
                if value.is_null() {
                    continue;
                }
                merged.insert(key, value);
            }
            merged.insert(
                "updated_at".to_string(),
                json!(Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
            );

            *existing = Value::Object(merged.clone());
            Value::Object(merged)
        };

        self.persist()?;
        info!(section, "Updated runtime config");
        Ok(merged)
    }

    /// Whole-file snapshot for the dashboard.
    pub fn all(&self) -> Map<String, Value> {
        self.cache.read().clone()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let snapshot = self.cache.read().clone();
        let content =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize runtime config")?;

        // Write-then-rename keeps readers from ever seeing a torn file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).context("Failed to write runtime config temp file")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace runtime config")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(bot_token: Option<&str>, url: Option<&str>) -> Settings {
        Settings {
            partner_id: 1,
            partner_key: "k".into(),
            shop_id: 2,
            access_token: "t".into(),
            refresh_token: None,
            webhook_partner_key: None,
            host_api: "https://example.invalid".into(),
            host: "0.0.0.0".into(),
            port: 8000,
            telegram_bot_token: bot_token.map(Into::into),
            telegram_chat_id: bot_token.map(|_| "-100123".into()),
            messages_per_minute: 15,
            forward_webhook_url: url.map(Into::into),
            dashboard_api_key: None,
            redis_enabled: false,
            redis_host: "redis".into(),
            redis_port: 6379,
            redis_db: 0,
            redis_max_retries: 3,
            redis_num_workers: 3,
            redis_brpop_timeout: 30,
            sync_interval_hours: 1,
            daily_sync_hour: 3,
            historical_days: 7,
            sync_overlap_hours: 2,
            sync_timeout_seconds: 600,
            api_call_delay_ms: 200,
            order_detail_batch_size: 50,
            config_dir: "config".into(),
            logs_dir: "logs".into(),
            sink_db_path: ":memory:".into(),
        }
    }

    #[test]
    fn first_run_seeds_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");

        let config = RuntimeConfig::load(path.clone(), &settings_with(Some("bot-123"), None));

        let notifier = config.get(SECTION_NOTIFIER);
        assert_eq!(notifier["enabled"], true);
        assert_eq!(notifier["bot_token"], "bot-123");
        assert!(path.exists());

        // Forwarder was not configured, so its section stays empty.
        assert!(config.get(SECTION_FORWARDER).as_object().unwrap().is_empty());
    }

    #[test]
    fn update_preserves_omitted_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let config = RuntimeConfig::load(path, &settings_with(Some("bot-123"), None));

        // Disable notifications without resending the token.
        let mut partial = Map::new();
        partial.insert("enabled".to_string(), json!(false));
        let merged = config.update(SECTION_NOTIFIER, partial).unwrap();

        assert_eq!(merged["enabled"], false);
        assert_eq!(merged["bot_token"], "bot-123");
        assert!(merged.get("updated_at").is_some());
    }

    #[test]
    fn update_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");

        {
            let config = RuntimeConfig::load(path.clone(), &settings_with(None, None));
            let mut partial = Map::new();
            partial.insert("enabled".to_string(), json!(true));
            partial.insert("url".to_string(), json!("https://worker.internal/webhook/process"));
            config.update(SECTION_FORWARDER, partial).unwrap();
        }

        let reloaded = RuntimeConfig::load(path, &settings_with(None, None));
        let forwarder = reloaded.get(SECTION_FORWARDER);
        assert_eq!(forwarder["enabled"], true);
        assert_eq!(forwarder["url"], "https://worker.internal/webhook/process");
    }

    #[test]
    fn unknown_section_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load(
            dir.path().join("runtime_config.json"),
            &settings_with(None, None),
        );

        assert!(config.update("nonsense", Map::new()).is_err());
    }

    #[test]
    fn null_values_do_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load(
            dir.path().join("runtime_config.json"),
            &settings_with(Some("bot-123"), None),
        );

        let mut partial = Map::new();
        partial.insert("bot_token".to_string(), Value::Null);
        partial.insert("enabled".to_string(), json!(true));
        let merged = config.update(SECTION_NOTIFIER, partial).unwrap();

        assert_eq!(merged["bot_token"], "bot-123");
    }
}
