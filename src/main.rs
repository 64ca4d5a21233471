//! Shopee Webhook Receiver
//!
//! Accepts signed webhooks from the upstream platform, acknowledges them
//! immediately, and fans each event out in the background: audit log, chat
//! notification, and the Redis queue (with HTTP fallback behind a circuit
//! breaker).

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shopflow_backend::{
    api::{dashboard_router, receiver_router, DashboardState, ReceiverState},
    auth::SignatureVerifier,
    config::Settings,
    dispatch::{WebhookDispatcher, WebhookForwarder},
    event_log::EventLog,
    middleware,
    notify::{NotificationQueue, TelegramNotifier},
    queue::{self, DlqAdmin, RedisCircuitBreaker, WebhookQueueProducer},
    runtime_config::{RuntimeConfig, SECTION_FORWARDER, SECTION_NOTIFIER},
    upstream::{OrderService, ShopeeClient, TokenStore},
};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shopflow_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Arc::new(Settings::from_env().context("Failed to load settings")?);
    init_tracing();

    info!("Shopee webhook receiver starting");

    let event_log = Arc::new(EventLog::new(&settings.logs_dir));
    let runtime_config = Arc::new(RuntimeConfig::load(
        settings.runtime_config_file(),
        &settings,
    ));

    // Notifier credentials: dashboard-set runtime config wins over env.
    let notifier_cfg = runtime_config.get(SECTION_NOTIFIER);
    let (bot_token, chat_id) = match (
        notifier_cfg.get("bot_token").and_then(|v| v.as_str()),
        notifier_cfg.get("chat_id").and_then(|v| v.as_str()),
    ) {
        (Some(token), Some(chat)) if !token.is_empty() => {
            info!("Using Telegram config from runtime config");
            (Some(token.to_string()), Some(chat.to_string()))
        }
        _ => (
            settings.telegram_bot_token.clone(),
            settings.telegram_chat_id.clone(),
        ),
    };

    let notifier = Arc::new(TelegramNotifier::new(
        bot_token,
        chat_id,
        settings.topics_file(),
    ));
    let notification_queue = notifier
        .enabled()
        .then(|| NotificationQueue::start(notifier.clone(), settings.messages_per_minute));

    // Upstream API client for attaching full order detail to notifications.
    let token_store = Arc::new(TokenStore::new(settings.token_file()));
    let order_service = match ShopeeClient::new(
        settings.partner_id,
        settings.partner_key.clone(),
        settings.shop_id,
        settings.access_token.clone(),
        settings.refresh_token.clone(),
        settings.host_api.clone(),
        token_store,
    ) {
        Ok(client) => Some(Arc::new(OrderService::new(Arc::new(client)))),
        Err(e) => {
            warn!(error = %e, "Failed to create upstream API client; order detail disabled");
            None
        }
    };

    // Redis producer behind the circuit breaker. An unreachable broker at
    // boot is not fatal: the dispatcher falls back to HTTP forwarding.
    let (producer, dlq) = if settings.redis_enabled {
        match redis::Client::open(settings.redis_url()) {
            Ok(client) => match queue::connect(&client).await {
                Ok(con) => {
                    info!(url = %settings.redis_url(), "Redis queue initialized");
                    let breaker = Arc::new(RedisCircuitBreaker::default());
                    let producer = Arc::new(WebhookQueueProducer::new(
                        con.clone(),
                        breaker,
                        settings.redis_max_retries,
                    ));
                    (Some(producer), Some(DlqAdmin::new(con)))
                }
                Err(e) => {
                    warn!(error = %e, "Redis unreachable, starting with HTTP forwarding only");
                    (None, None)
                }
            },
            Err(e) => {
                warn!(error = %e, "Invalid Redis configuration");
                (None, None)
            }
        }
    } else {
        info!("Redis queue disabled by configuration");
        (None, None)
    };

    // Fallback URL: runtime config wins over env, and an explicit
    // `enabled: false` turns HTTP forwarding off.
    let forwarder_cfg = runtime_config.get(SECTION_FORWARDER);
    let forward_url = match (
        forwarder_cfg.get("enabled").and_then(|v| v.as_bool()),
        forwarder_cfg.get("url").and_then(|v| v.as_str()),
    ) {
        (Some(true), Some(url)) if !url.is_empty() => Some(url.to_string()),
        (Some(false), _) => None,
        _ => settings.forward_webhook_url.clone(),
    };
    let forwarder = WebhookForwarder::new(forward_url);

    let dispatcher = Arc::new(WebhookDispatcher::new(
        order_service,
        notification_queue.clone(),
        producer.clone(),
        forwarder,
        event_log.clone(),
    ));

    let verifier = Arc::new(SignatureVerifier::new(
        Some(settings.partner_key.as_str()),
        settings.webhook_partner_key.as_deref(),
    ));

    let receiver_state = ReceiverState {
        verifier,
        dispatcher,
        settings: settings.clone(),
    };

    let dashboard_state = DashboardState {
        producer,
        dlq,
        event_log,
        runtime_config,
        notification_queue: notification_queue.clone(),
    };

    let app = receiver_router(receiver_state)
        .nest(
            "/dashboard",
            dashboard_router(dashboard_state, settings.dashboard_api_key.clone()),
        )
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(middleware::request_logging));

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "Receiver listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain queued notifications before exiting.
    if let Some(queue) = notification_queue {
        queue.stop().await;
    }

    info!("Receiver stopped");
    Ok(())
}
