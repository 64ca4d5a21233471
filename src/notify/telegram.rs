//! Telegram notifications for webhook events.
//!
//! Each event code gets its own forum topic, created lazily on first use and
//! memoized in a JSON file. Messages render as HTML in two sections: the raw
//! webhook event, then the assembled order detail when available. Rendered
//! messages longer than 4000 characters are split at line boundaries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::TIMEZONE_OFFSET_HOURS;
use crate::error::{ProcessError, ProcessResult};
use crate::upstream::AssembledOrder;

/// Telegram's hard limit is 4096; 4000 leaves a safety margin.
const MAX_MESSAGE_LENGTH: usize = 4000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn event_name(code: i64) -> String {
    match code {
        3 => "Order Status Update".to_string(),
        4 => "Order Tracking Number".to_string(),
        8 => "Reserved Stock Change".to_string(),
        other => format!("Event {other}"),
    }
}

/// File-backed map of event code to forum topic id.
struct TopicStore {
    path: PathBuf,
    topics: Mutex<HashMap<i64, i64>>,
}

impl TopicStore {
    fn load(path: PathBuf) -> Self {
        let mut topics = HashMap::new();

        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(config) = serde_json::from_str::<Value>(&raw) {
                if let Some(entries) = config.get("topics").and_then(|t| t.as_object()) {
                    for (code_str, topic_info) in entries {
                        let code = code_str.parse::<i64>().ok();
                        let topic_id = topic_info.get("topic_id").and_then(|v| v.as_i64());
                        if let (Some(code), Some(topic_id)) = (code, topic_id) {
                            topics.insert(code, topic_id);
                            info!(code, topic_id, "Loaded topic id");
                        }
                    }
                }
            }
        } else {
            info!(path = %path.display(), "Topic config file not found, will create on first use");
        }

        Self {
            path,
            topics: Mutex::new(topics),
        }
    }

    fn get(&self, event_code: i64) -> Option<i64> {
        self.topics.lock().get(&event_code).copied()
    }

    /// Records a newly created topic and rewrites the file atomically.
    fn save(&self, event_code: i64, topic_id: i64) {
        let snapshot = {
            let mut topics = self.topics.lock();
            topics.insert(event_code, topic_id);
            topics.clone()
        };

        let entries: serde_json::Map<String, Value> = snapshot
            .iter()
            .map(|(code, id)| {
                (
                    code.to_string(),
                    json!({
                        "event_code": code,
                        "topic_id": id,
                        "created_at": Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
                    }),
                )
            })
            .collect();
        let config = json!({ "topics": entries });

        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_string_pretty(&config).unwrap_or_default())?;
            std::fs::rename(&tmp, &self.path)
        };

        match write() {
            Ok(()) => info!(event_code, topic_id, "Saved topic id"),
            Err(e) => error!(error = %e, "Error saving topic id"),
        }
    }
}

pub struct TelegramNotifier {
    enabled: bool,
    bot_token: String,
    chat_id: String,
    client: Client,
    topics: TopicStore,
}

impl TelegramNotifier {
    pub fn new(
        bot_token: Option<String>,
        chat_id: Option<String>,
        topics_path: PathBuf,
    ) -> Self {
        let (bot_token, chat_id) = match (bot_token, chat_id) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => (token, chat),
            _ => {
                info!("Telegram notifications disabled (no credentials)");
                return Self {
                    enabled: false,
                    bot_token: String::new(),
                    chat_id: String::new(),
                    client: Client::new(),
                    topics: TopicStore::load(topics_path),
                };
            }
        };

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        info!(chat_id = %chat_id, "Telegram notifier initialized");
        Self {
            enabled: true,
            bot_token,
            chat_id,
            client,
            topics: TopicStore::load(topics_path),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.bot_token, method)
    }

    /// Creates a forum topic named after the event code and memoizes it.
    async fn create_topic(&self, event_code: i64) -> Option<i64> {
        let payload = json!({
            "chat_id": self.chat_id,
            "name": event_code.to_string(),
        });

        let response = self
            .client
            .post(self.api_url("createForumTopic"))
            .json(&payload)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                error!(event_code, error = %e, "Error creating Telegram topic");
                return None;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(event_code, %status, body = %body, "Failed to create topic");
            return None;
        }

        let data: Value = response.json().await.ok()?;
        if !data.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            error!(event_code, "createForumTopic returned ok=false");
            return None;
        }

        let topic_id = data
            .get("result")
            .and_then(|r| r.get("message_thread_id"))
            .and_then(|v| v.as_i64())?;

        info!(event_code, topic_id, "Created Telegram topic");
        self.topics.save(event_code, topic_id);
        Some(topic_id)
    }

    async fn ensure_topic(&self, event_code: i64) -> Option<i64> {
        if let Some(topic_id) = self.topics.get(event_code) {
            return Some(topic_id);
        }
        info!(event_code, "Creating new topic for event code");
        self.create_topic(event_code).await
    }

    /// Sends one formatted event, chunking when necessary. The whole chunk
    /// set must land for the send to count as successful.
    pub async fn send_direct(
        &self,
        event_code: i64,
        shop_id: i64,
        event_data: &Value,
        order: Option<&AssembledOrder>,
    ) -> ProcessResult<()> {
        if !self.enabled {
            return Err(ProcessError::validation("telegram not configured"));
        }

        let topic_id = self.ensure_topic(event_code).await;
        let message = format_webhook_message(event_code, shop_id, event_data, order);
        let chunks = split_long_message(&message, MAX_MESSAGE_LENGTH);
        let total = chunks.len();

        for (idx, chunk) in chunks.into_iter().enumerate() {
            let mut payload = json!({
                "chat_id": self.chat_id,
                "text": chunk,
                "parse_mode": "HTML",
            });
            if let Some(topic_id) = topic_id {
                payload["message_thread_id"] = json!(topic_id);
            }

            let response = self
                .client
                .post(self.api_url("sendMessage"))
                .json(&payload)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() || e.is_connect() {
                        ProcessError::Transport(format!("telegram send: {e}"))
                    } else {
                        ProcessError::upstream(format!("telegram send: {e}"))
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                error!(%status, body = %body, "Telegram API error");

                // 5xx and timeouts are worth retrying, client errors are not.
                return if status.is_server_error() {
                    Err(ProcessError::Transport(format!("telegram HTTP {status}")))
                } else {
                    Err(ProcessError::upstream(format!(
                        "telegram HTTP {status}: {body}"
                    )))
                };
            }

            info!(
                event_code,
                part = idx + 1,
                parts = total,
                topic_id = topic_id.unwrap_or_default(),
                "Telegram notification sent"
            );
        }

        Ok(())
    }
}

/// Renders the two-section HTML message: the webhook event itself, then the
/// assembled order detail when the API fetch succeeded.
pub fn format_webhook_message(
    event_code: i64,
    shop_id: i64,
    event_data: &Value,
    order: Option<&AssembledOrder>,
) -> String {
    let tz = FixedOffset::east_opt(TIMEZONE_OFFSET_HOURS * 3600).expect("valid fixed offset");
    let timestamp = Utc::now().with_timezone(&tz).format("%Y-%m-%d %H:%M:%S");

    let mut message = String::new();
    message.push_str("\u{1F4E9} <b>SHOPEE WEBHOOK EVENT</b>\n");
    message.push_str(&format!("<b>Code:</b> {} ({})\n", event_code, event_name(event_code)));
    message.push_str(&format!("<b>Shop ID:</b> <code>{shop_id}</code>\n"));
    message.push_str(&format!("<b>Time:</b> {timestamp}\n"));

    if let Some(data) = event_data.as_object() {
        if !data.is_empty() {
            message.push_str("\n<b>Event Data:</b>\n");
            for (key, value) in data {
                let rendered = match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                };
                if rendered.len() < 50 {
                    message.push_str(&format!("  \u{2022} {key}: <code>{rendered}</code>\n"));
                }
            }
        }
    }

    let Some(order) = order else {
        return message;
    };

    message.push_str(&format!("\n{}\n\n", "\u{2500}".repeat(15)));
    message.push_str("\u{1F4E6} <b>ORDER DETAILS</b>\n\n");

    message.push_str("<b>\u{1F194} Order Information</b>\n");
    message.push_str(&format!("  Order ID: <code>{}</code>\n", order.order_id));
    if let Some(shop) = order.shop_id {
        message.push_str(&format!("  Shop ID: {shop}\n"));
    }
    message.push_str(&format!("  Status: <code>{}</code>\n", order.status));
    message.push_str(&format!("  Created: {}\n", order.create_time));
    message.push_str(&format!("  Updated: {}\n", order.update_time));

    message.push_str("\n<b>\u{1F464} Buyer Information</b>\n");
    message.push_str(&format!("  Buyer: {}\n", order.buyer));

    if let Some(addr) = &order.recipient_address {
        message.push_str("\n<b>\u{1F4CD} Shipping Address</b>\n");
        if let Some(name) = &addr.name {
            message.push_str(&format!("  Name: {name}\n"));
        }
        if let Some(phone) = &addr.phone {
            message.push_str(&format!("  Phone: {phone}\n"));
        }
        if let Some(full) = &addr.full_address {
            message.push_str(&format!("  Address: {full}\n"));
        }
        if let Some(city) = &addr.city {
            message.push_str(&format!("  City: {city}\n"));
        }
        if let Some(state) = &addr.state {
            message.push_str(&format!("  State: {state}\n"));
        }
    }

    message.push_str("\n<b>\u{1F4B0} Financial Information</b>\n");
    if let Some(amount) = order.total_amount {
        let currency = order.currency.as_deref().unwrap_or("SGD");
        message.push_str(&format!("  Total Amount: <code>{amount} {currency}</code>\n"));
    }
    if let Some(method) = &order.payment_method {
        message.push_str(&format!("  Payment Method: {method}\n"));
    }

    if let Some(carrier) = &order.shipping_carrier {
        message.push_str("\n<b>\u{1F69A} Shipping Information</b>\n");
        message.push_str(&format!("  Carrier: {carrier}\n"));
    }

    if let Some(escrow) = order.escrow_amount {
        message.push_str("\n<b>\u{1F4B3} Escrow Information</b>\n");
        message.push_str(&format!("  Amount: <code>{escrow}</code>\n"));
    }

    if !order.items.is_empty() {
        message.push_str(&format!("\n<b>\u{1F4CB} Items ({})</b>\n", order.item_count));
        for (idx, item) in order.items.iter().enumerate() {
            message.push_str(&format!("\n  <b>{}. {}</b>\n", idx + 1, item.product_name));
            if !item.parent_sku.is_empty() {
                message.push_str(&format!("     Item SKU: <code>{}</code>\n", item.parent_sku));
            }
            if !item.sku.is_empty() {
                message.push_str(&format!("     Model SKU: <code>{}</code>\n", item.sku));
            }
            if !item.item_type.is_empty() {
                message.push_str(&format!("     Variation: {}\n", item.item_type));
            }
            message.push_str(&format!("     Qty: {}\n", item.quantity));
        }
    }

    message
}

/// Splits a rendered message into chunks of at most `max_length` characters,
/// breaking at line boundaries.
pub fn split_long_message(message: &str, max_length: usize) -> Vec<String> {
    if message.len() <= max_length {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in message.split('\n') {
        if current.len() + line.len() + 1 <= max_length {
            current.push_str(line);
            current.push('\n');
        } else {
            if !current.is_empty() {
                chunks.push(current.trim_end().to_string());
            }
            current = format!("{line}\n");
        }
    }

    if !current.is_empty() {
        chunks.push(current.trim_end().to_string());
    }

    if chunks.is_empty() {
        // Single line longer than the limit: hard cut at a char boundary.
        let mut end = max_length.min(message.len());
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(message[..end].to_string());
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_message_is_one_chunk() {
        let chunks = split_long_message("hello\nworld", 4000);
        assert_eq!(chunks, vec!["hello\nworld"]);
    }

    #[test]
    fn long_message_splits_at_line_boundaries() {
        let line = "x".repeat(100);
        let message = vec![line.clone(); 100].join("\n");

        let chunks = split_long_message(&message, 4000);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 4000);
            // No line was cut in half.
            for part in chunk.split('\n') {
                assert_eq!(part.len(), 100);
            }
        }

        let total_lines: usize = chunks.iter().map(|c| c.lines().count()).sum();
        assert_eq!(total_lines, 100);
    }

    #[test]
    fn oversized_single_line_is_hard_cut() {
        let message = "y".repeat(5000);
        let chunks = split_long_message(&message, 4000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4000);
    }

    #[test]
    fn format_renders_event_section() {
        let message = format_webhook_message(
            3,
            42,
            &json!({"ordersn": "A1", "status": "READY_TO_SHIP"}),
            None,
        );

        assert!(message.contains("SHOPEE WEBHOOK EVENT"));
        assert!(message.contains("Code:</b> 3 (Order Status Update)"));
        assert!(message.contains("<code>42</code>"));
        assert!(message.contains("ordersn: <code>A1</code>"));
        assert!(!message.contains("ORDER DETAILS"));
    }

    #[test]
    fn format_skips_long_event_values() {
        let message = format_webhook_message(3, 42, &json!({"blob": "z".repeat(80)}), None);
        assert!(!message.contains(&"z".repeat(80)));
    }

    #[test]
    fn format_renders_order_section_when_present() {
        let order = AssembledOrder {
            order_id: "A1".to_string(),
            shop_id: Some(42),
            buyer: "buyer1".to_string(),
            platform: "Shopee".to_string(),
            status: "READY_TO_SHIP".to_string(),
            create_time: "2024-01-04T03:11:39".to_string(),
            update_time: "2024-01-04T03:11:39".to_string(),
            total_amount: Some(100.0),
            currency: Some("SGD".to_string()),
            payment_method: Some("Credit Card".to_string()),
            shipping_carrier: Some("SG Express".to_string()),
            recipient_address: None,
            escrow_amount: Some(92.5),
            item_count: 1,
            items: vec![crate::models::OrderItem {
                order_id: "A1".to_string(),
                date_time: "2024-01-04T03:11:39".to_string(),
                buyer: "buyer1".to_string(),
                platform: "Shopee".to_string(),
                product_name: "Widget".to_string(),
                item_type: "Blue".to_string(),
                parent_sku: "P1".to_string(),
                sku: "M1".to_string(),
                quantity: 2,
                total_sale: 92.5,
                shopee_status: "READY_TO_SHIP".to_string(),
                status: "READY_TO_SHIP".to_string(),
            }],
        };

        let message = format_webhook_message(3, 42, &json!({"ordersn": "A1"}), Some(&order));

        assert!(message.contains("ORDER DETAILS"));
        assert!(message.contains("Order ID: <code>A1</code>"));
        assert!(message.contains("100 SGD"));
        assert!(message.contains("1. Widget"));
        assert!(message.contains("Model SKU: <code>M1</code>"));
        assert!(message.contains("Qty: 2"));
    }

    #[test]
    fn topic_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram_topics.json");

        let store = TopicStore::load(path.clone());
        assert_eq!(store.get(3), None);
        store.save(3, 101);
        store.save(4, 202);

        let reloaded = TopicStore::load(path);
        assert_eq!(reloaded.get(3), Some(101));
        assert_eq!(reloaded.get(4), Some(202));
        assert_eq!(reloaded.get(8), None);
    }

    #[test]
    fn disabled_notifier_reports_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = TelegramNotifier::new(None, None, dir.path().join("topics.json"));
        assert!(!notifier.enabled());
    }
}
