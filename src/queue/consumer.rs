//! Redis consumer workers for processing webhooks from the queue.
//!
//! Each worker owns its own connection and BRPOPs the main list with a
//! bounded timeout so shutdown is observed within one poll cycle. Failed
//! messages retry with exponential backoff and land in the dead letter
//! queue once retries are exhausted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{error, info, warn};

use super::{bump_stat, connect, QUEUE_DLQ, QUEUE_MAIN};
use crate::models::WebhookEnvelope;
use crate::processor::WebhookProcessor;

const POOL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct WorkerStats {
    messages_processed: u64,
    messages_failed: u64,
    avg_processing_time: f64,
    last_message_at: Option<f64>,
    current_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsSnapshot {
    pub worker_id: usize,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_message: Option<String>,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub avg_processing_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<f64>,
}

pub struct RedisWebhookConsumer {
    worker_id: usize,
    con: ConnectionManager,
    processor: Arc<WebhookProcessor>,
    brpop_timeout: u64,
    running: AtomicBool,
    stats: Mutex<WorkerStats>,
}

impl RedisWebhookConsumer {
    pub fn new(
        con: ConnectionManager,
        processor: Arc<WebhookProcessor>,
        worker_id: usize,
        brpop_timeout: u64,
    ) -> Self {
        info!(worker_id, "Worker initialized");
        Self {
            worker_id,
            con,
            processor,
            brpop_timeout,
            running: AtomicBool::new(false),
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    /// Main consume loop. Blocks until `stop()` is observed; the BRPOP
    /// timeout bounds how long that takes.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(worker_id = self.worker_id, "Worker started, polling queue");

        while self.running.load(Ordering::SeqCst) {
            let mut con = self.con.clone();
            let popped: redis::RedisResult<Option<(String, String)>> =
                con.brpop(QUEUE_MAIN, self.brpop_timeout as f64).await;

            match popped {
                Ok(Some((_, raw_message))) => {
                    let envelope: WebhookEnvelope = match serde_json::from_str(&raw_message) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            // Malformed message: discard and keep consuming.
                            error!(worker_id = self.worker_id, error = %e, "Invalid JSON in queue message, discarding");
                            continue;
                        }
                    };
                    self.process_message(envelope).await;
                }
                Ok(None) => {} // BRPOP timeout, re-check running flag
                Err(e) => {
                    error!(worker_id = self.worker_id, error = %e, "Error in consume loop");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(worker_id = self.worker_id, "Worker stopped");
    }

    async fn process_message(&self, envelope: WebhookEnvelope) {
        let queue_id = envelope.id.clone();
        let order_sn = envelope
            .payload
            .get("data")
            .and_then(|d| d.get("ordersn"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        info!(worker_id = self.worker_id, queue_id = %queue_id, order = %order_sn, "Processing message");
        self.stats.lock().current_message = Some(queue_id.clone());

        let start = Instant::now();
        let success = self.process_with_retry(&envelope).await;
        let duration = start.elapsed().as_secs_f64();

        let mut con = self.con.clone();
        if success {
            bump_stat(&mut con, "total_processed", 1).await;
        } else {
            error!(worker_id = self.worker_id, queue_id = %queue_id, "Message failed after retries");
            bump_stat(&mut con, "total_failed", 1).await;
        }

        let mut stats = self.stats.lock();
        stats.last_message_at = Some(Utc::now().timestamp_millis() as f64 / 1000.0);
        if success {
            stats.messages_processed += 1;
            let n = stats.messages_processed as f64;
            stats.avg_processing_time = (stats.avg_processing_time * (n - 1.0) + duration) / n;
            info!(
                worker_id = self.worker_id,
                queue_id = %queue_id,
                duration_s = format!("{duration:.2}"),
                "Message completed"
            );
        } else {
            stats.messages_failed += 1;
        }
        stats.current_message = None;
    }

    /// Runs the business logic with exponential backoff, moving the envelope
    /// to the DLQ once `max_retries` is exhausted.
    async fn process_with_retry(&self, envelope: &WebhookEnvelope) -> bool {
        let retry_count = envelope.metadata.retry_count;
        let max_retries = envelope.metadata.max_retries;

        for attempt in retry_count..=max_retries {
            let success = self.processor.process_webhook(&envelope.payload).await;
            if success {
                return true;
            }

            if attempt < max_retries {
                let wait = 2u64.saturating_pow(attempt);
                warn!(
                    worker_id = self.worker_id,
                    attempt = attempt + 1,
                    max_retries,
                    wait_s = wait,
                    "Processing failed, retrying"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
        }

        self.move_to_dead_letter(envelope).await;
        false
    }

    async fn move_to_dead_letter(&self, envelope: &WebhookEnvelope) {
        let mut dlq_envelope = envelope.clone();
        dlq_envelope.metadata.moved_to_dlq_at = Some(Utc::now().timestamp_millis() as f64 / 1000.0);
        dlq_envelope.metadata.worker_id = Some(self.worker_id);

        let message = match serde_json::to_string(&dlq_envelope) {
            Ok(json) => json,
            Err(e) => {
                error!(worker_id = self.worker_id, error = %e, "Failed to serialize DLQ envelope");
                return;
            }
        };

        let mut con = self.con.clone();
        let pushed: redis::RedisResult<i64> = con.lpush(QUEUE_DLQ, &message).await;
        match pushed {
            Ok(_) => {
                error!(worker_id = self.worker_id, queue_id = %envelope.id, "Moved to DLQ");
            }
            Err(e) => {
                error!(worker_id = self.worker_id, error = %e, "Failed to move message to DLQ");
            }
        }
    }

    pub fn stop(&self) {
        info!(worker_id = self.worker_id, "Worker stopping");
        self.running.store(false, Ordering::SeqCst);
        if let Some(current) = &self.stats.lock().current_message {
            info!(worker_id = self.worker_id, current = %current, "Waiting for current message");
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        let stats = self.stats.lock();
        WorkerStatsSnapshot {
            worker_id: self.worker_id,
            is_running: self.running.load(Ordering::SeqCst),
            current_message: stats.current_message.clone(),
            messages_processed: stats.messages_processed,
            messages_failed: stats.messages_failed,
            avg_processing_time: stats.avg_processing_time,
            last_message_at: stats.last_message_at,
        }
    }
}

/// Orchestrates N concurrent consumer workers.
pub struct ConsumerPool {
    workers: Vec<Arc<RedisWebhookConsumer>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ConsumerPool {
    /// Spawns `num_workers` consumers, each with its own Redis connection.
    pub async fn start(
        client: &redis::Client,
        processor: Arc<WebhookProcessor>,
        num_workers: usize,
        brpop_timeout: u64,
    ) -> Result<Self> {
        info!(num_workers, "Starting Redis consumer workers");

        let mut workers = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let con = connect(client).await?;
            let consumer = Arc::new(RedisWebhookConsumer::new(
                con,
                processor.clone(),
                i + 1,
                brpop_timeout,
            ));

            let worker = consumer.clone();
            handles.push(tokio::spawn(async move { worker.run().await }));
            workers.push(consumer);
            info!(worker_id = i + 1, "Worker launched");
        }

        info!(num_workers, "All workers started");
        Ok(Self {
            workers,
            handles: Mutex::new(handles),
        })
    }

    /// Signals every worker and waits up to 30 s before cancelling stragglers.
    pub async fn stop(&self) {
        info!(count = self.workers.len(), "Stopping consumer workers");

        for worker in &self.workers {
            worker.stop();
        }

        let mut handles: Vec<_> = self.handles.lock().drain(..).collect();
        let wait_all = async {
            for handle in &mut handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(POOL_STOP_TIMEOUT, wait_all).await.is_err() {
            warn!("Timeout waiting for workers, cancelling stuck tasks");
            for handle in &handles {
                handle.abort();
            }
        }

        for worker in &self.workers {
            let stats = worker.stats();
            info!(
                worker_id = stats.worker_id,
                processed = stats.messages_processed,
                failed = stats.messages_failed,
                avg_time_s = format!("{:.2}", stats.avg_processing_time),
                "Worker final stats"
            );
        }

        info!("All workers stopped");
    }

    pub fn stats(&self) -> Vec<WorkerStatsSnapshot> {
        self.workers.iter().map(|w| w.stats()).collect()
    }
}
