//! Circuit breaker for automatic Redis fallback.
//!
//! Opens after consecutive Redis failures; while open, the producer
//! short-circuits to HTTP forwarding without touching the broker.
//! Transitions: Closed -> Open -> HalfOpen -> {Closed | Open}.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Point-in-time view for the telemetry surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub threshold: u32,
    pub timeout_seconds: u64,
    pub open_for_seconds: Option<f64>,
}

pub struct RedisCircuitBreaker {
    threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl Default for RedisCircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_TIMEOUT)
    }
}

impl RedisCircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        info!(
            threshold,
            timeout_s = timeout.as_secs(),
            "Circuit breaker initialized"
        );
        Self {
            threshold,
            timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Any success closes the circuit and clears the failure count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!(
                was = ?inner.state,
                failures = inner.failure_count,
                "Circuit breaker: Redis recovered, closing circuit"
            );
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        warn!(
            failures = inner.failure_count,
            threshold = self.threshold,
            "Circuit breaker: Redis failure recorded"
        );

        match inner.state {
            BreakerState::Closed if inner.failure_count >= self.threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                error!(
                    failures = inner.failure_count,
                    "Circuit breaker: OPEN - falling back to HTTP forwarding"
                );
            }
            // A failed half-open probe re-opens with a fresh timeout window.
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!("Circuit breaker: half-open probe failed, re-opening");
            }
            _ => {}
        }
    }

    /// The single gate the producer consults before touching Redis. While
    /// open, returns false until the timeout elapses; the first query after
    /// that moves to half-open and admits one probe.
    pub fn should_attempt(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed > self.timeout {
                    inner.state = BreakerState::HalfOpen;
                    info!(
                        timeout_s = self.timeout.as_secs(),
                        "Circuit breaker: entering HALF_OPEN, retrying Redis"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.threshold,
            timeout_seconds: self.timeout.as_secs(),
            open_for_seconds: inner.opened_at.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> RedisCircuitBreaker {
        RedisCircuitBreaker::new(3, Duration::from_millis(50))
    }

    #[test]
    fn stays_closed_below_threshold() {
        let b = fast_breaker();
        b.record_failure();
        b.record_failure();
        assert!(b.should_attempt());
        assert_eq!(b.snapshot().state, BreakerState::Closed);
    }

    #[test]
    fn opens_at_threshold_and_blocks() {
        let b = fast_breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.snapshot().state, BreakerState::Open);
        assert!(!b.should_attempt());
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_success() {
        let b = fast_breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        // First query after the timeout admits a probe.
        assert!(b.should_attempt());
        assert_eq!(b.snapshot().state, BreakerState::HalfOpen);

        b.record_success();
        let snap = b.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_window() {
        let b = fast_breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.should_attempt());

        b.record_failure();
        assert_eq!(b.snapshot().state, BreakerState::Open);
        // The fresh window blocks immediately again.
        assert!(!b.should_attempt());
    }

    #[test]
    fn success_resets_from_any_state() {
        let b = fast_breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        b.record_success();
        assert!(b.should_attempt());
        assert_eq!(b.snapshot().failure_count, 0);
    }
}
