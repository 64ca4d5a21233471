//! Worker HTTP surfaces: synchronous processing (the receiver's HTTP
//! fallback target), health, worker statistics, and reconciliation control.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::processor::WebhookProcessor;
use crate::queue::ConsumerPool;
use crate::recon::{ReconciliationScheduler, ReconciliationService};
use crate::sink::OrderItemSink;

#[derive(Clone)]
pub struct WorkerApiState {
    pub processor: Arc<WebhookProcessor>,
    pub sink: Arc<dyn OrderItemSink>,
    pub pool: Option<Arc<ConsumerPool>>,
    pub recon: Option<Arc<ReconciliationService>>,
    pub scheduler: Option<Arc<ReconciliationScheduler>>,
}

pub fn worker_router(state: WorkerApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/webhook/process", post(process_webhook))
        .route("/workers/stats", get(worker_stats))
        .route("/sync/status", get(sync_status))
        .route("/sync/manual", post(manual_sync))
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Shopee Order Processor",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "webhook": "POST /webhook/process",
            "workers_stats": "GET /workers/stats",
            "sync_status": "GET /sync/status",
            "sync_manual": "POST /sync/manual",
        },
    }))
}

/// Synchronous processing path, used by the receiver's HTTP fallback when
/// Redis is unavailable.
async fn process_webhook(
    State(state): State<WorkerApiState>,
    Json(event_payload): Json<Value>,
) -> Response {
    info!(
        code = event_payload.get("code").and_then(|v| v.as_i64()).unwrap_or(0),
        "Received webhook over HTTP"
    );

    if state.processor.process_webhook(&event_payload).await {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Processing failed").into_response()
    }
}

async fn health_check(State(state): State<WorkerApiState>) -> Json<Value> {
    let storage_ok = state.sink.health_check().await;

    Json(json!({
        "status": if storage_ok { "healthy" } else { "degraded" },
        "service": "shopee-order-processor",
        "storage": if storage_ok { "ok" } else { "error" },
    }))
}

async fn worker_stats(State(state): State<WorkerApiState>) -> Json<Value> {
    match &state.pool {
        Some(pool) => {
            let workers = pool.stats();
            Json(json!({
                "redis_enabled": true,
                "total_workers": workers.len(),
                "workers": workers,
            }))
        }
        None => Json(json!({
            "redis_enabled": false,
            "message": "Redis workers not enabled",
        })),
    }
}

async fn sync_status(State(state): State<WorkerApiState>) -> Json<Value> {
    let Some(recon) = &state.recon else {
        return Json(json!({"enabled": false}));
    };

    let next_scheduled = state
        .scheduler
        .as_ref()
        .and_then(|s| s.next_scheduled_sync());
    let status = recon.get_sync_status(next_scheduled).await;
    Json(serde_json::to_value(status).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct ManualSyncRequest {
    /// Unix seconds, inclusive window start.
    time_from: i64,
    /// Unix seconds, inclusive window end.
    time_to: i64,
}

async fn manual_sync(
    State(state): State<WorkerApiState>,
    Json(request): Json<ManualSyncRequest>,
) -> Response {
    let Some(recon) = &state.recon else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "reconciliation not enabled"})),
        )
            .into_response();
    };

    if request.time_from >= request.time_to {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "time_from must be before time_to"})),
        )
            .into_response();
    }

    let result = recon.manual_sync(request.time_from, request.time_to).await;
    if !result.success {
        error!(errors = ?result.errors, "Manual sync reported errors");
    }

    Json(serde_json::to_value(result).unwrap_or_default()).into_response()
}
