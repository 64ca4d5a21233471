//! Dashboard API: read-only telemetry plus DLQ administration and runtime
//! config editing. Every route sits behind the `X-API-Key` middleware.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::error;

use crate::auth::require_api_key;
use crate::event_log::EventLog;
use crate::notify::NotificationQueue;
use crate::queue::{DlqAdmin, WebhookQueueProducer};
use crate::runtime_config::RuntimeConfig;

#[derive(Clone)]
pub struct DashboardState {
    pub producer: Option<Arc<WebhookQueueProducer>>,
    pub dlq: Option<DlqAdmin>,
    pub event_log: Arc<EventLog>,
    pub runtime_config: Arc<RuntimeConfig>,
    pub notification_queue: Option<Arc<NotificationQueue>>,
}

pub fn dashboard_router(state: DashboardState, api_key: Option<String>) -> Router {
    Router::new()
        .route("/queue/stats", get(queue_stats))
        .route("/notifier/stats", get(notifier_stats))
        .route("/dlq/stats", get(dlq_stats))
        .route("/dlq/messages", get(dlq_messages))
        .route("/dlq/retry", post(dlq_retry))
        .route("/dlq/clear", delete(dlq_clear))
        .route("/dlq/reset-stats", post(dlq_reset_stats))
        .route("/events", get(events))
        .route("/events/statistics", get(event_statistics))
        .route("/config", get(config_all))
        .route("/config/:section", get(config_get).put(config_update))
        .layer(middleware::from_fn_with_state(
            Arc::new(api_key),
            require_api_key,
        ))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

fn disabled() -> Json<Value> {
    Json(json!({"enabled": false, "message": "Redis queue is disabled"}))
}

async fn queue_stats(State(state): State<DashboardState>) -> Json<Value> {
    let Some(producer) = &state.producer else {
        return disabled();
    };

    match producer.get_stats().await {
        Ok(stats) => Json(json!({"enabled": true, "stats": stats})),
        Err(e) => {
            error!(error = %e, "Error getting queue stats");
            Json(json!({"enabled": true, "error": e.to_string()}))
        }
    }
}

async fn notifier_stats(State(state): State<DashboardState>) -> Json<Value> {
    match &state.notification_queue {
        Some(queue) => Json(json!({"enabled": true, "stats": queue.stats()})),
        None => Json(json!({"enabled": false})),
    }
}

async fn dlq_stats(State(state): State<DashboardState>) -> Json<Value> {
    let Some(dlq) = &state.dlq else {
        return disabled();
    };

    match dlq.stats().await {
        Ok(stats) => Json(json!({"enabled": true, "dlq_count": stats.dlq_count,
            "total_enqueued": stats.total_enqueued,
            "total_processed": stats.total_processed,
            "total_failed": stats.total_failed,
            "sample_messages": stats.sample_messages})),
        Err(e) => {
            error!(error = %e, "Error getting DLQ stats");
            Json(json!({"enabled": false, "dlq_count": 0, "error": e.to_string()}))
        }
    }
}

async fn dlq_messages(
    State(state): State<DashboardState>,
    Query(page): Query<PageQuery>,
) -> Json<Value> {
    let Some(dlq) = &state.dlq else {
        return disabled();
    };

    let limit = page.limit.unwrap_or(100).clamp(1, 500);
    match dlq.list(page.offset, limit).await {
        Ok(page) => Json(json!({"enabled": true, "total": page.total, "limit": page.limit,
            "offset": page.offset, "messages": page.messages})),
        Err(e) => {
            error!(error = %e, "Error getting DLQ messages");
            Json(json!({"enabled": false, "total": 0, "messages": [], "error": e.to_string()}))
        }
    }
}

async fn dlq_retry(State(state): State<DashboardState>) -> Json<Value> {
    let Some(dlq) = &state.dlq else {
        return Json(json!({"success": false, "message": "Redis queue is disabled"}));
    };

    match dlq.replay_all().await {
        Ok(outcome) => Json(json!({
            "success": true,
            "message": format!("Successfully retried {} messages from DLQ", outcome.retried),
            "retried_count": outcome.retried,
            "failed_count": outcome.failed,
        })),
        Err(e) => {
            error!(error = %e, "Error retrying DLQ");
            Json(json!({"success": false, "message": e.to_string(), "retried_count": 0}))
        }
    }
}

async fn dlq_clear(State(state): State<DashboardState>) -> Json<Value> {
    let Some(dlq) = &state.dlq else {
        return Json(json!({"success": false, "message": "Redis queue is disabled"}));
    };

    match dlq.clear().await {
        Ok(cleared) => Json(json!({
            "success": true,
            "message": format!("Successfully cleared {cleared} messages from DLQ"),
            "cleared_count": cleared,
        })),
        Err(e) => {
            error!(error = %e, "Error clearing DLQ");
            Json(json!({"success": false, "message": e.to_string(), "cleared_count": 0}))
        }
    }
}

async fn dlq_reset_stats(State(state): State<DashboardState>) -> Json<Value> {
    let Some(dlq) = &state.dlq else {
        return Json(json!({"success": false, "message": "Redis queue is disabled"}));
    };

    match dlq.reset_stats().await {
        Ok(()) => Json(json!({"success": true, "message": "Queue statistics reset to zero"})),
        Err(e) => {
            error!(error = %e, "Error resetting queue stats");
            Json(json!({"success": false, "message": e.to_string()}))
        }
    }
}

async fn events(
    State(state): State<DashboardState>,
    Query(query): Query<DateQuery>,
) -> Json<Value> {
    let events = state.event_log.read_events(query.date.as_deref());
    Json(json!({"total": events.len(), "events": events}))
}

async fn event_statistics(
    State(state): State<DashboardState>,
    Query(query): Query<DateQuery>,
) -> Json<Value> {
    let stats = state.event_log.statistics(query.date.as_deref());
    Json(serde_json::to_value(stats).unwrap_or_default())
}

async fn config_all(State(state): State<DashboardState>) -> Json<Value> {
    Json(Value::Object(state.runtime_config.all()))
}

async fn config_get(
    State(state): State<DashboardState>,
    Path(section): Path<String>,
) -> Json<Value> {
    if !RuntimeConfig::is_known_section(&section) {
        return Json(json!({"error": format!("unknown config section: {section}")}));
    }
    Json(state.runtime_config.get(&section))
}

async fn config_update(
    State(state): State<DashboardState>,
    Path(section): Path<String>,
    Json(partial): Json<Map<String, Value>>,
) -> Json<Value> {
    match state.runtime_config.update(&section, partial) {
        Ok(merged) => Json(json!({"success": true, "config": merged})),
        Err(e) => Json(json!({"success": false, "error": e.to_string()})),
    }
}
