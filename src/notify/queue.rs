//! Rate-limited notification queue.
//!
//! Telegram throttles around 20 messages/minute per chat; this queue paces a
//! single cooperative consumer at 15/minute by default. Enqueueing never
//! blocks the webhook path. Delivery retries up to 3 times with exponential
//! backoff; only transport-class failures are retried.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::telegram::TelegramNotifier;
use crate::error::ProcessError;
use crate::upstream::AssembledOrder;

const MAX_RETRIES: u32 = 3;
const LONG_WAIT_THRESHOLD: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct QueuedNotification {
    pub event_code: i64,
    pub shop_id: i64,
    pub event_data: Value,
    pub order: Option<AssembledOrder>,
    pub queued_at: Instant,
}

#[derive(Debug, Default)]
struct QueueCounters {
    total_queued: u64,
    total_sent: u64,
    total_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotifierQueueStats {
    pub total_queued: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    pub queue_size: usize,
    pub is_running: bool,
    pub messages_per_minute: u32,
}

pub struct NotificationQueue {
    notifier: Arc<TelegramNotifier>,
    tx: Mutex<Option<mpsc::UnboundedSender<QueuedNotification>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    depth: Arc<AtomicUsize>,
    counters: Arc<Mutex<QueueCounters>>,
    accepting: AtomicBool,
    consumer_running: Arc<AtomicBool>,
    messages_per_minute: u32,
}

/// How long to sleep before the next send to hold the configured pace.
fn pace_wait(seconds_per_message: f64, since_last_send: f64) -> f64 {
    (seconds_per_message - since_last_send).max(0.0)
}

impl NotificationQueue {
    /// Spawns the single consumer task and returns the queue handle.
    pub fn start(notifier: Arc<TelegramNotifier>, messages_per_minute: u32) -> Arc<Self> {
        let messages_per_minute = messages_per_minute.max(1);
        let seconds_per_message = 60.0 / messages_per_minute as f64;

        info!(
            messages_per_minute,
            seconds_per_message = format!("{seconds_per_message:.1}"),
            "Telegram queue initialized"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            notifier,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(None),
            depth: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(Mutex::new(QueueCounters::default())),
            accepting: AtomicBool::new(true),
            consumer_running: Arc::new(AtomicBool::new(true)),
            messages_per_minute,
        });

        let consumer = queue.clone();
        let handle = tokio::spawn(async move {
            consumer.consume(rx, seconds_per_message).await;
        });
        *queue.handle.lock() = Some(handle);

        queue
    }

    /// Non-blocking enqueue. Returns false once the queue is stopping.
    pub fn enqueue(
        &self,
        event_code: i64,
        shop_id: i64,
        event_data: Value,
        order: Option<AssembledOrder>,
    ) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            warn!(event_code, "Notification queue stopping, message rejected");
            return false;
        }

        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return false;
        };

        let sent = tx
            .send(QueuedNotification {
                event_code,
                shop_id,
                event_data,
                order,
                queued_at: Instant::now(),
            })
            .is_ok();

        if sent {
            self.depth.fetch_add(1, Ordering::SeqCst);
            self.counters.lock().total_queued += 1;
        }
        sent
    }

    async fn consume(
        &self,
        mut rx: mpsc::UnboundedReceiver<QueuedNotification>,
        seconds_per_message: f64,
    ) {
        info!("Telegram queue worker started");
        let mut last_send: Option<Instant> = None;

        while let Some(message) = rx.recv().await {
            self.depth.fetch_sub(1, Ordering::SeqCst);

            if let Some(last) = last_send {
                let wait = pace_wait(seconds_per_message, last.elapsed().as_secs_f64());
                if wait > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
            }

            let waited = message.queued_at.elapsed();
            if waited > LONG_WAIT_THRESHOLD {
                info!(
                    event_code = message.event_code,
                    waited_s = format!("{:.1}", waited.as_secs_f64()),
                    "Processing message after long queue wait"
                );
            }

            let sent = self.send_with_retry(&message).await;
            last_send = Some(Instant::now());

            let mut counters = self.counters.lock();
            if sent {
                counters.total_sent += 1;
            } else {
                counters.total_failed += 1;
            }
        }

        self.consumer_running.store(false, Ordering::SeqCst);
        info!("Telegram queue worker stopped");
    }

    /// Delivery with backoff 1 s, 2 s, 4 s. Terminal failures (client
    /// errors, misconfiguration) are not retried.
    async fn send_with_retry(&self, message: &QueuedNotification) -> bool {
        for attempt in 0..MAX_RETRIES {
            let result = self
                .notifier
                .send_direct(
                    message.event_code,
                    message.shop_id,
                    &message.event_data,
                    message.order.as_ref(),
                )
                .await;

            match result {
                Ok(()) => return true,
                Err(ProcessError::Transport(e)) if attempt < MAX_RETRIES - 1 => {
                    let delay = 2u64.saturating_pow(attempt);
                    warn!(
                        event_code = message.event_code,
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_s = delay,
                        error = %e,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => {
                    error!(
                        event_code = message.event_code,
                        attempt = attempt + 1,
                        error = %e,
                        "Send failed"
                    );
                    return false;
                }
            }
        }
        false
    }

    /// Graceful stop: reject new messages, drain the backlog for up to 30 s,
    /// then abandon whatever remains.
    pub async fn stop(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping Telegram queue worker");
        // Dropping the sender lets the consumer drain and exit.
        self.tx.lock().take();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(_) => info!("All queued messages processed"),
                Err(_) => {
                    let remaining = self.depth.load(Ordering::SeqCst);
                    warn!(remaining, "Timeout waiting for queue to empty, abandoning");
                }
            }
        }

        let stats = self.stats();
        info!(
            total_queued = stats.total_queued,
            total_sent = stats.total_sent,
            total_failed = stats.total_failed,
            "Queue worker stopped"
        );
    }

    pub fn stats(&self) -> NotifierQueueStats {
        let counters = self.counters.lock();
        NotifierQueueStats {
            total_queued: counters.total_queued,
            total_sent: counters.total_sent,
            total_failed: counters.total_failed,
            queue_size: self.depth.load(Ordering::SeqCst),
            is_running: self.consumer_running.load(Ordering::SeqCst),
            messages_per_minute: self.messages_per_minute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pace_wait_enforces_gap() {
        assert_eq!(pace_wait(4.0, 0.0), 4.0);
        assert_eq!(pace_wait(4.0, 1.5), 2.5);
        assert_eq!(pace_wait(4.0, 4.0), 0.0);
        // Late consumer never sleeps a negative duration.
        assert_eq!(pace_wait(4.0, 10.0), 0.0);
    }

    fn disabled_notifier(dir: &tempfile::TempDir) -> Arc<TelegramNotifier> {
        Arc::new(TelegramNotifier::new(None, None, dir.path().join("topics.json")))
    }

    #[tokio::test]
    async fn unconfigured_notifier_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = NotificationQueue::start(disabled_notifier(&dir), 600);

        assert!(queue.enqueue(3, 42, serde_json::json!({"ordersn": "A1"}), None));
        assert!(queue.enqueue(3, 42, serde_json::json!({"ordersn": "A2"}), None));

        queue.stop().await;

        let stats = queue.stats();
        assert_eq!(stats.total_queued, 2);
        assert_eq!(stats.total_sent, 0);
        // Terminal failure, no retry backoff delays.
        assert_eq!(stats.total_failed, 2);
        assert_eq!(stats.queue_size, 0);
        assert!(!stats.is_running);
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = NotificationQueue::start(disabled_notifier(&dir), 600);

        queue.stop().await;
        assert!(!queue.enqueue(3, 42, serde_json::json!({}), None));
    }
}
