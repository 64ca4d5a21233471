//! Shopee Order Worker
//!
//! Drains the Redis webhook queue with a pool of consumers, reconstructs
//! full order detail from the upstream API, and upserts one row per item
//! into the order sink. Also runs the reconciliation scheduler and a small
//! HTTP surface for health, stats, and manual syncs.
//!
//! Usage:
//!   shopflow-worker --num-workers 3 --port 8001
//!
//! Most configuration comes from the environment (see config.rs); the flags
//! below override the queue-facing knobs.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shopflow_backend::{
    api::{worker_router, WorkerApiState},
    config::Settings,
    processor::WebhookProcessor,
    queue::{self, ConsumerPool},
    recon::{ReconciliationConfig, ReconciliationScheduler, ReconciliationService},
    sink::{OrderItemSink, SqliteOrderSink},
    upstream::{OrderService, ShopeeApi, ShopeeClient, TokenStore},
};

#[derive(Parser, Debug)]
#[command(name = "shopflow-worker")]
#[command(about = "Order webhook worker - queue consumers + reconciliation")]
struct Args {
    /// Number of concurrent queue consumers
    #[arg(long, env = "REDIS_NUM_WORKERS", default_value = "3")]
    num_workers: usize,

    /// BRPOP timeout in seconds (bounds shutdown latency)
    #[arg(long, env = "REDIS_BRPOP_TIMEOUT", default_value = "30")]
    brpop_timeout: u64,

    /// HTTP port for the worker API
    #[arg(long, env = "WORKER_PORT", default_value = "8001")]
    port: u16,

    /// Skip the startup catch-up sync
    #[arg(long, env = "SKIP_STARTUP_SYNC", default_value = "false")]
    skip_startup_sync: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shopflow_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env().context("Failed to load settings")?;
    init_tracing();
    let args = Args::parse();

    info!("Shopee order worker starting");
    info!(num_workers = args.num_workers, brpop_timeout = args.brpop_timeout, "Queue configuration");

    // Upstream API client shared by the queue path and reconciliation.
    let token_store = Arc::new(TokenStore::new(settings.token_file()));
    let api: Arc<dyn ShopeeApi> = Arc::new(
        ShopeeClient::new(
            settings.partner_id,
            settings.partner_key.clone(),
            settings.shop_id,
            settings.access_token.clone(),
            settings.refresh_token.clone(),
            settings.host_api.clone(),
            token_store,
        )
        .context("Failed to create upstream API client")?,
    );
    let order_service = Arc::new(OrderService::new(api.clone()));

    let sink: Arc<dyn OrderItemSink> = Arc::new(
        SqliteOrderSink::new(&settings.sink_db_path).context("Failed to open order sink")?,
    );
    info!(path = %settings.sink_db_path, "Order sink ready");

    let processor = Arc::new(WebhookProcessor::new(order_service.clone(), sink.clone()));

    // Queue consumers and reconciliation both need Redis; without it the
    // worker still serves the synchronous /webhook/process path.
    let mut pool = None;
    let mut recon = None;
    let mut scheduler = None;

    if settings.redis_enabled {
        let client =
            redis::Client::open(settings.redis_url()).context("Invalid Redis configuration")?;

        match queue::connect(&client).await {
            Ok(con) => {
                let started = ConsumerPool::start(
                    &client,
                    processor.clone(),
                    args.num_workers,
                    args.brpop_timeout,
                )
                .await
                .context("Failed to start consumer pool")?;
                pool = Some(Arc::new(started));

                let service = Arc::new(ReconciliationService::new(
                    api.clone(),
                    order_service.clone(),
                    sink.clone(),
                    con,
                    ReconciliationConfig::from(&settings),
                ));
                let sched = Arc::new(ReconciliationScheduler::new(
                    service.clone(),
                    settings.sync_interval_hours,
                    settings.daily_sync_hour,
                ));
                sched.start(!args.skip_startup_sync).await;

                recon = Some(service);
                scheduler = Some(sched);
            }
            Err(e) => {
                warn!(error = %e, "Redis unreachable; queue consumers and reconciliation disabled");
            }
        }
    } else {
        info!("Redis disabled; running HTTP-only worker");
    }

    let state = WorkerApiState {
        processor,
        sink,
        pool: pool.clone(),
        recon,
        scheduler: scheduler.clone(),
    };

    let app = worker_router(state)
        .layer(axum::middleware::from_fn(shopflow_backend::middleware::request_logging));

    let addr = format!("{}:{}", settings.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "Worker API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    // Ordered shutdown: stop scheduling new syncs, then drain consumers.
    if let Some(scheduler) = scheduler {
        scheduler.stop();
    }
    if let Some(pool) = pool {
        pool.stop().await;
    }

    info!("Worker stopped");
    Ok(())
}
