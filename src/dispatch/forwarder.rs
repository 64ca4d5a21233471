//! Webhook forwarding with Redis-first strategy and HTTP fallback.
//!
//! The happy path is a fast Redis publish. When that fails (or the breaker
//! is open) the raw event is POSTed to the configured processor URL with up
//! to 3 attempts; only 5xx, timeouts, and connection errors are retried.
//! The per-attempt timeout is generous (90 s) because the fallback target
//! processes synchronously.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::queue::WebhookQueueProducer;

const FORWARDER_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ForwardOutcome {
    pub success: bool,
    pub method: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
}

impl ForwardOutcome {
    fn disabled() -> Self {
        Self {
            success: false,
            method: "none".to_string(),
            attempts: 0,
            last_error: Some("forwarding disabled".to_string()),
            queue_id: None,
        }
    }
}

pub struct WebhookForwarder {
    forward_url: Option<String>,
    client: Client,
}

impl WebhookForwarder {
    pub fn new(forward_url: Option<String>) -> Self {
        match &forward_url {
            Some(url) => info!(url = %url, "Webhook forwarding via HTTP available"),
            None => info!("HTTP webhook forwarding not configured"),
        }

        let client = Client::builder()
            .timeout(FORWARDER_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            forward_url,
            client,
        }
    }

    pub fn enabled(&self, producer: Option<&WebhookQueueProducer>) -> bool {
        self.forward_url.is_some() || producer.is_some()
    }

    /// Forwards a raw webhook event: Redis queue first, HTTP on fallback.
    pub async fn forward_webhook(
        &self,
        producer: Option<&WebhookQueueProducer>,
        event_payload: &Value,
    ) -> ForwardOutcome {
        if !self.enabled(producer) {
            return ForwardOutcome::disabled();
        }

        if let Some(producer) = producer {
            let publish = producer.publish(event_payload).await;

            if publish.success {
                return ForwardOutcome {
                    success: true,
                    method: "redis".to_string(),
                    attempts: 1,
                    last_error: None,
                    queue_id: publish.queue_id,
                };
            }

            if publish.fallback_used {
                warn!(
                    error = publish.error.as_deref().unwrap_or("unknown"),
                    "Redis unavailable, falling back to HTTP"
                );
            }
        }

        if self.forward_url.is_some() {
            info!("Using HTTP fallback for webhook forwarding");
            let mut outcome = self.forward_via_http(event_payload).await;
            outcome.method = "http_fallback".to_string();
            return outcome;
        }

        error!("No forwarding method available (Redis failed, no HTTP URL)");
        ForwardOutcome {
            success: false,
            method: "none".to_string(),
            attempts: 0,
            last_error: Some("no forwarding method available".to_string()),
            queue_id: None,
        }
    }

    async fn forward_via_http(&self, event_payload: &Value) -> ForwardOutcome {
        let url = self.forward_url.as_deref().expect("checked by caller");
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            if attempt == 1 {
                info!(url, "HTTP forwarding webhook");
            } else {
                info!(url, attempt, max = MAX_RETRIES, "HTTP retry");
            }

            match self.client.post(url).json(event_payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        info!(%status, "Successfully forwarded via HTTP");
                        return ForwardOutcome {
                            success: true,
                            method: String::new(),
                            attempts: attempt,
                            last_error: None,
                            queue_id: None,
                        };
                    }

                    let body = response.text().await.unwrap_or_default();
                    last_error = Some(format!("HTTP {status}: {body}"));
                    error!(%status, "HTTP error forwarding webhook");

                    // Client errors will not improve on retry.
                    if !status.is_server_error() {
                        return ForwardOutcome {
                            success: false,
                            method: String::new(),
                            attempts: attempt,
                            last_error,
                            queue_id: None,
                        };
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_error = Some(e.to_string());
                    warn!(attempt, error = %e, "HTTP attempt failed");
                }
                Err(e) => {
                    error!(error = %e, "Unexpected HTTP error forwarding webhook");
                    return ForwardOutcome {
                        success: false,
                        method: String::new(),
                        attempts: attempt,
                        last_error: Some(e.to_string()),
                        queue_id: None,
                    };
                }
            }

            if attempt < MAX_RETRIES {
                let delay = 2u64.saturating_pow(attempt - 1);
                info!(delay_s = delay, "Waiting before next forward retry");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }

        error!(attempts = MAX_RETRIES, "Failed HTTP forwarding after retries");
        ForwardOutcome {
            success: false,
            method: String::new(),
            attempts: MAX_RETRIES,
            last_error,
            queue_id: None,
        }
    }
}
