//! Reconciliation scheduler.
//!
//! Two long-lived tasks: an hourly interval sweep and a daily full sweep at
//! a fixed local (UTC+8) hour, plus an optional startup catch-up run before
//! either begins. The single-flight Redis lock inside the service keeps an
//! overlapping trigger harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Timelike, Utc};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::service::ReconciliationService;
use crate::config::TIMEZONE_OFFSET_HOURS;

pub struct ReconciliationScheduler {
    service: Arc<ReconciliationService>,
    interval_hours: u64,
    daily_hour: u32,
    started: AtomicBool,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    next_scheduled: Arc<Mutex<Option<DateTime<FixedOffset>>>>,
}

/// Seconds from `now` until the next occurrence of `hour:00` in `now`'s
/// timezone. A trigger time earlier today rolls over to tomorrow.
fn seconds_until_hour(now: DateTime<FixedOffset>, hour: u32) -> i64 {
    let today_target = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("valid wall clock");

    let target = if today_target > now {
        today_target
    } else {
        today_target + ChronoDuration::days(1)
    };

    (target - now).num_seconds()
}

fn local_now() -> DateTime<FixedOffset> {
    let tz = FixedOffset::east_opt(TIMEZONE_OFFSET_HOURS * 3600).expect("valid fixed offset");
    Utc::now().with_timezone(&tz)
}

impl ReconciliationScheduler {
    pub fn new(
        service: Arc<ReconciliationService>,
        interval_hours: u64,
        daily_hour: u32,
    ) -> Self {
        Self {
            service,
            interval_hours: interval_hours.max(1),
            daily_hour: daily_hour.min(23),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            next_scheduled: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts the interval and daily jobs, optionally running the startup
    /// catch-up sync first (awaited, so the queue workers start against a
    /// healed sink).
    pub async fn start(&self, run_startup_sync: bool) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already started");
            return;
        }

        if run_startup_sync {
            info!("Running startup catch-up sync");
            let result = self.service.startup_catchup_sync().await;
            if result.success {
                info!(processed = result.orders_processed, "Startup sync completed");
            } else {
                warn!(errors = ?result.errors, "Startup sync had issues");
            }
        }

        let interval = Duration::from_secs(self.interval_hours * 3600);
        info!(hours = self.interval_hours, "Added scheduled sync job");
        let service = self.service.clone();
        let next_scheduled = self.next_scheduled.clone();
        let interval_handle = tokio::spawn(async move {
            loop {
                *next_scheduled.lock() = Some(
                    local_now() + ChronoDuration::seconds(interval.as_secs() as i64),
                );
                tokio::time::sleep(interval).await;

                info!("Scheduled sync triggered");
                let result = service.scheduled_sync().await;
                if result.success {
                    info!(processed = result.orders_processed, "Scheduled sync completed");
                } else {
                    warn!(errors = ?result.errors, "Scheduled sync had issues");
                }
            }
        });

        info!(hour = self.daily_hour, "Added daily full sync job");
        let service = self.service.clone();
        let daily_hour = self.daily_hour;
        let daily_handle = tokio::spawn(async move {
            loop {
                let wait = seconds_until_hour(local_now(), daily_hour).max(1) as u64;
                tokio::time::sleep(Duration::from_secs(wait)).await;

                info!("Daily full sync triggered");
                let result = service.daily_full_sync().await;
                if result.success {
                    info!(processed = result.orders_processed, "Daily sync completed");
                } else {
                    error!(errors = ?result.errors, "Daily sync had issues");
                }
            }
        });

        let mut handles = self.handles.lock();
        handles.push(interval_handle);
        handles.push(daily_handle);

        info!("Reconciliation scheduler started");
    }

    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        info!("Reconciliation scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Next interval sweep, formatted for the status surface.
    pub fn next_scheduled_sync(&self) -> Option<String> {
        self.next_scheduled
            .lock()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 10, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn waits_until_later_today() {
        // 01:30 -> 03:00 is 90 minutes away.
        assert_eq!(seconds_until_hour(at(1, 30), 3), 90 * 60);
    }

    #[test]
    fn rolls_over_to_tomorrow() {
        // 04:00 already passed 03:00; next trigger is tomorrow.
        assert_eq!(seconds_until_hour(at(4, 0), 3), 23 * 60 * 60);
    }

    #[test]
    fn exact_trigger_time_rolls_over() {
        assert_eq!(seconds_until_hour(at(3, 0), 3), 24 * 60 * 60);
    }
}
