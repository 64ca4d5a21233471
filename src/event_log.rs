//! Webhook audit log.
//!
//! Every received event is appended to a daily JSONL file named after the
//! local (UTC+8) calendar date. One JSON object per line; readers tolerate
//! partial or garbled lines so a crash mid-write never poisons a whole day.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::TIMEZONE_OFFSET_HOURS;
use crate::models::ProcessingStatus;

/// Authorization headers are truncated to this many characters in the log.
const AUTH_HEADER_PREFIX_LEN: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct EventStatistics {
    pub date: String,
    pub total_events: u64,
    pub events_by_code: BTreeMap<i64, u64>,
    pub unique_shops: usize,
    pub shops: Vec<i64>,
}

pub struct EventLog {
    dir: PathBuf,
    tz: FixedOffset,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "Failed to create logs directory");
        }

        Self {
            dir,
            tz: FixedOffset::east_opt(TIMEZONE_OFFSET_HOURS * 3600).expect("valid fixed offset"),
        }
    }

    fn today(&self) -> String {
        Utc::now().with_timezone(&self.tz).format("%Y-%m-%d").to_string()
    }

    pub fn file_for_date(&self, date: Option<&str>) -> PathBuf {
        let date = date.map(str::to_string).unwrap_or_else(|| self.today());
        self.dir.join(format!("webhook_events_{date}.json"))
    }

    /// Appends one event entry to today's file and returns the file path.
    pub fn log_event(
        &self,
        event_code: i64,
        shop_id: i64,
        event_data: &Value,
        authorization_header: Option<&str>,
        body_size: usize,
        processing_status: Option<&ProcessingStatus>,
    ) -> Result<PathBuf> {
        let log_file = self.file_for_date(None);

        let authorization = authorization_header.map(|h| {
            let prefix: String = h.chars().take(AUTH_HEADER_PREFIX_LEN).collect();
            format!("{prefix}...")
        });

        let mut entry = json!({
            "timestamp": Utc::now().with_timezone(&self.tz).to_rfc3339(),
            "event_code": event_code,
            "shop_id": shop_id,
            "event_data": event_data,
            "metadata": {
                "authorization": authorization,
                "body_size": body_size,
            },
        });

        if let Some(status) = processing_status {
            entry["processing_status"] = serde_json::to_value(status)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

        let line = serde_json::to_string(&entry)?;
        writeln!(file, "{line}").context("Failed to write webhook event")?;

        info!(event_code, shop_id, file = %log_file.display(), "Logged webhook event");
        Ok(log_file)
    }

    /// Reads all events for a date, skipping unparseable lines.
    pub fn read_events(&self, date: Option<&str>) -> Vec<Value> {
        let log_file = self.file_for_date(date);

        let file = match std::fs::File::open(&log_file) {
            Ok(file) => file,
            Err(_) => {
                warn!(file = %log_file.display(), "Log file does not exist");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for (line_num, line) in std::io::BufReader::new(file).lines().enumerate() {
            let Ok(line) = line else { break };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(line = line_num + 1, error = %e, "Failed to parse log line");
                }
            }
        }

        events
    }

    /// Per-day statistics for the dashboard: totals, counts by event code,
    /// and the set of shops seen.
    pub fn statistics(&self, date: Option<&str>) -> EventStatistics {
        let date = date.map(str::to_string).unwrap_or_else(|| self.today());
        let events = self.read_events(Some(&date));

        let mut events_by_code: BTreeMap<i64, u64> = BTreeMap::new();
        let mut shops: BTreeSet<i64> = BTreeSet::new();

        for event in &events {
            let code = event.get("event_code").and_then(|v| v.as_i64()).unwrap_or(-1);
            *events_by_code.entry(code).or_insert(0) += 1;

            if let Some(shop) = event.get("shop_id").and_then(|v| v.as_i64()) {
                shops.insert(shop);
            }
        }

        EventStatistics {
            date,
            total_events: events.len() as u64,
            events_by_code,
            unique_shops: shops.len(),
            shops: shops.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryStatus, ForwarderStatus};

    fn test_log() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        (dir, log)
    }

    #[test]
    fn entry_truncates_authorization_header() {
        let (_dir, log) = test_log();

        let long_header = "a".repeat(64);
        log.log_event(3, 42, &json!({"ordersn": "A1"}), Some(&long_header), 128, None)
            .unwrap();

        let events = log.read_events(None);
        assert_eq!(events.len(), 1);

        let auth = events[0]["metadata"]["authorization"].as_str().unwrap();
        assert_eq!(auth, format!("{}...", "a".repeat(20)));
        assert_eq!(events[0]["metadata"]["body_size"], 128);
        assert_eq!(events[0]["event_code"], 3);
    }

    #[test]
    fn entry_carries_processing_status() {
        let (_dir, log) = test_log();

        let status = ProcessingStatus {
            telegram: DeliveryStatus {
                success: true,
                error: None,
                timestamp: Some("t".to_string()),
            },
            forwarder: ForwarderStatus {
                success: true,
                error: None,
                method: "http_fallback".to_string(),
                attempts: 1,
                timestamp: Some("t".to_string()),
            },
        };

        log.log_event(3, 42, &json!({}), None, 10, Some(&status)).unwrap();

        let events = log.read_events(None);
        assert_eq!(events[0]["processing_status"]["forwarder"]["method"], "http_fallback");
        assert_eq!(events[0]["processing_status"]["telegram"]["success"], true);
    }

    #[test]
    fn reader_skips_garbled_lines() {
        let (_dir, log) = test_log();

        log.log_event(3, 1, &json!({}), None, 0, None).unwrap();
        let file = log.file_for_date(None);
        let mut content = std::fs::read_to_string(&file).unwrap();
        content.push_str("{\"truncated\": tru\n");
        std::fs::write(&file, content).unwrap();
        log.log_event(4, 2, &json!({}), None, 0, None).unwrap();

        let events = log.read_events(None);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn statistics_aggregate_codes_and_shops() {
        let (_dir, log) = test_log();

        log.log_event(3, 1, &json!({}), None, 0, None).unwrap();
        log.log_event(3, 2, &json!({}), None, 0, None).unwrap();
        log.log_event(4, 1, &json!({}), None, 0, None).unwrap();

        let stats = log.statistics(None);
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_by_code[&3], 2);
        assert_eq!(stats.events_by_code[&4], 1);
        assert_eq!(stats.unique_shops, 2);
    }

    #[test]
    fn missing_file_yields_empty() {
        let (_dir, log) = test_log();
        assert!(log.read_events(Some("1999-01-01")).is_empty());
        assert_eq!(log.statistics(Some("1999-01-01")).total_events, 0);
    }
}
