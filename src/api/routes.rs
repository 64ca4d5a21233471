//! Receiver routes: webhook ingestion, health, service info.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::SignatureVerifier;
use crate::config::Settings;
use crate::dispatch::WebhookDispatcher;

#[derive(Clone)]
pub struct ReceiverState {
    pub verifier: Arc<SignatureVerifier>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub settings: Arc<Settings>,
}

pub fn receiver_router(state: ReceiverState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/webhook/shopee", post(shopee_webhook))
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Shopee Webhook Receiver",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "webhook": "POST /webhook/shopee",
            "health": "GET /health",
            "dashboard": "GET /dashboard/*",
        },
    }))
}

/// Main webhook endpoint.
///
/// The upstream platform requires a 2xx with an EMPTY body, fast; otherwise
/// it re-delivers aggressively. So this handler only validates and parses,
/// hands everything else to a background task, and answers 200 even for
/// invalid signatures (invalid events are simply not dispatched).
async fn shopee_webhook(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorization = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    match state.verifier.validate_request(&body, authorization.as_deref()) {
        Ok(()) => match serde_json::from_slice::<Value>(&body) {
            Ok(event_payload) => {
                info!(
                    code = event_payload.get("code").and_then(|v| v.as_i64()).unwrap_or(0),
                    shop_id = event_payload.get("shop_id").and_then(|v| v.as_i64()).unwrap_or(0),
                    "Webhook received, queuing for background processing"
                );

                let dispatcher = state.dispatcher.clone();
                let body_size = body.len();
                tokio::spawn(async move {
                    dispatcher
                        .handle_event(event_payload, authorization, body_size)
                        .await;
                });
            }
            Err(e) => {
                warn!(error = %e, "Webhook body is not valid JSON");
            }
        },
        Err(e) => {
            warn!(error = %e, "Invalid webhook request");
        }
    }

    StatusCode::OK.into_response()
}

/// Health surface: degraded when required configuration is missing.
async fn health_check(State(state): State<ReceiverState>) -> Json<Value> {
    let settings = &state.settings;
    let mut status = "healthy";

    let tokens_file = if settings.token_file().exists() {
        "ok"
    } else {
        status = "degraded";
        "missing"
    };
    let topics_file = if settings.topics_file().exists() {
        "ok"
    } else {
        "not_created_yet"
    };

    let env_check = |present: bool| if present { "ok" } else { "missing" };
    let bot_token_ok = settings.telegram_bot_token.is_some();
    let chat_id_ok = settings.telegram_chat_id.is_some();
    if !bot_token_ok || !chat_id_ok {
        status = "degraded";
    }

    let forwarding = if settings.forward_webhook_url.is_some() || settings.redis_enabled {
        "enabled"
    } else {
        "disabled"
    };

    Json(json!({
        "status": status,
        "service": "shopee-webhook-receiver",
        "checks": {
            "config": {
                "tokens_file": tokens_file,
                "topics_file": topics_file,
            },
            "environment": {
                "partner_id": env_check(settings.partner_id != 0),
                "shop_id": env_check(settings.shop_id != 0),
                "telegram_bot_token": env_check(bot_token_ok),
                "telegram_chat_id": env_check(chat_id_ok),
            },
            "forwarding": forwarding,
        },
    }))
}
