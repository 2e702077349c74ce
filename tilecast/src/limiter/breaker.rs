//! Failure-driven circuit breaker for the upstream backend.
//!
//! # State Machine
//!
//! ```text
//! Closed --[consecutive failures >= threshold]--> Open
//! Open --[cool-down elapsed]--> HalfOpen (single probe admitted)
//! HalfOpen --[probe succeeds]--> Closed
//! HalfOpen --[probe fails]--> Open (cool-down doubles, capped)
//! ```
//!
//! The cool-down grows exponentially while the upstream keeps rejecting the
//! probe, capped at `max_cool_down` so recovery is observed within a minute.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::telemetry::Metrics;

/// Circuit breaker configuration.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// First cool-down after tripping.
    pub initial_cool_down: Duration,
    /// Cool-down cap.
    pub max_cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            initial_cool_down: Duration::from_secs(2),
            max_cool_down: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Calls are short-circuited.
    Open,
    /// One probe is allowed through.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cool_down: Duration,
    probe_in_flight: bool,
}

/// Failure-counting circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    metrics: Arc<Metrics>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cool_down: config.initial_cool_down,
                probe_in_flight: false,
            }),
            config,
        }
    }

    /// Asks whether a call may proceed.
    ///
    /// Returns `Ok(())` to proceed, or the remaining cool-down to report as
    /// `Retry-After`. In half-open exactly one caller gets through; the rest
    /// are rejected until the probe resolves.
    pub fn check(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= inner.cool_down {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("circuit breaker half-open, sending probe");
                    Ok(())
                } else {
                    Err(inner.cool_down - elapsed)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(inner.cool_down)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful upstream call.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!("circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.cool_down = self.config.initial_cool_down;
        inner.probe_in_flight = false;
    }

    /// Records a failed upstream call (429 or transport failure).
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.metrics.breaker_opened();
                    warn!(
                        failures = inner.consecutive_failures,
                        cool_down_ms = inner.cool_down.as_millis(),
                        "circuit breaker OPENED"
                    );
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed: reopen with a longer cool-down.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.cool_down = (inner.cool_down * 2).min(self.config.max_cool_down);
                inner.probe_in_flight = false;
                self.metrics.breaker_opened();
                warn!(
                    cool_down_ms = inner.cool_down.as_millis(),
                    "circuit breaker probe failed, re-opened"
                );
            }
            BreakerState::Open => {}
        }
    }

    /// Current state, for stats.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cool_down_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: threshold,
                initial_cool_down: Duration::from_millis(cool_down_ms),
                max_cool_down: Duration::from_millis(cool_down_ms * 8),
            },
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn test_starts_closed() {
        let b = breaker(3, 50);
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.check().is_ok());
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker(3, 50);
        b.on_failure();
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.check().is_err());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker(3, 50);
        b.on_failure();
        b.on_failure();
        b.on_success();
        b.on_failure();
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_retry_after_bounded_by_cool_down() {
        let b = breaker(1, 50);
        b.on_failure();
        let retry = b.check().unwrap_err();
        assert!(retry <= Duration::from_millis(50));
    }

    #[test]
    fn test_half_open_single_probe() {
        let b = breaker(1, 20);
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));
        // First check after cool-down is the probe.
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Concurrent calls during the probe are rejected.
        assert!(b.check().is_err());
    }

    #[test]
    fn test_probe_success_closes() {
        let b = breaker(1, 20);
        b.on_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.check().is_ok());
        b.on_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.check().is_ok());
    }

    #[test]
    fn test_probe_failure_doubles_cool_down() {
        let b = breaker(1, 20);
        b.on_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.check().is_ok());
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // Cool-down doubled to ~40ms: still open after the original 20ms.
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.check().is_err());
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.check().is_ok());
    }

    #[test]
    fn test_cool_down_caps() {
        let b = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                initial_cool_down: Duration::from_millis(10),
                max_cool_down: Duration::from_millis(40),
            },
            Arc::new(Metrics::new()),
        );
        b.on_failure();
        for _ in 0..6 {
            std::thread::sleep(Duration::from_millis(45));
            if b.check().is_ok() {
                b.on_failure();
            }
        }
        // Even after many failed probes the wait stays within the cap.
        let retry = b.check().unwrap_err();
        assert!(retry <= Duration::from_millis(40));
    }
}
