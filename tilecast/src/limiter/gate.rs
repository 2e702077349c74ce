//! Concurrency, pacing and breaker gate in front of the upstream.
//!
//! Every upstream call acquires a permit here: the semaphore caps in-flight
//! calls per process, the pacing lock enforces a minimum spacing between
//! departures, and the circuit breaker short-circuits everything while the
//! upstream is rejecting work.
//!
//! The semaphore is process-local; fleets size it so that
//! `instances x per-process-cap` stays within the upstream quota.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::telemetry::Metrics;

use super::{BreakerConfig, BreakerState, CircuitBreaker};

/// Gate configuration.
#[derive(Clone, Copy, Debug)]
pub struct UpstreamGateConfig {
    /// Maximum concurrent upstream calls per process.
    pub concurrency: usize,
    /// Minimum spacing between call departures.
    pub pacing: Duration,
    /// Breaker tuning.
    pub breaker: BreakerConfig,
}

impl Default for UpstreamGateConfig {
    fn default() -> Self {
        Self {
            concurrency: 25,
            pacing: Duration::from_millis(50),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Errors from gate admission.
#[derive(Debug, Error)]
pub enum GateError {
    /// The breaker is open; retry after the given delay.
    #[error("upstream circuit open, retry in {0:?}")]
    BreakerOpen(Duration),

    /// The semaphore was closed during shutdown.
    #[error("upstream gate closed")]
    Closed,
}

/// A held admission: concurrency slot plus breaker reporting.
pub struct UpstreamPermit<'a> {
    _permit: SemaphorePermit<'a>,
    breaker: &'a CircuitBreaker,
}

impl UpstreamPermit<'_> {
    /// Reports the guarded call's outcome to the breaker.
    pub fn report(&self, success: bool) {
        if success {
            self.breaker.on_success();
        } else {
            self.breaker.on_failure();
        }
    }
}

/// Upstream admission gate.
pub struct UpstreamGate {
    semaphore: Semaphore,
    breaker: CircuitBreaker,
    pacing: Duration,
    next_departure: Mutex<Instant>,
}

impl UpstreamGate {
    pub fn new(config: UpstreamGateConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            semaphore: Semaphore::new(config.concurrency),
            breaker: CircuitBreaker::new(config.breaker, metrics),
            pacing: config.pacing,
            next_departure: Mutex::new(Instant::now()),
        }
    }

    /// Acquires an upstream slot, honouring breaker state and pacing.
    ///
    /// Suspends while the semaphore is full and while pacing requires a gap;
    /// fails fast when the breaker is open.
    pub async fn acquire(&self) -> Result<UpstreamPermit<'_>, GateError> {
        self.breaker.check().map_err(GateError::BreakerOpen)?;

        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| GateError::Closed)?;

        // Claim the next departure slot, then sleep up to it outside the lock.
        let wait = {
            let mut next = self.next_departure.lock();
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.pacing;
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        Ok(UpstreamPermit {
            _permit: permit,
            breaker: &self.breaker,
        })
    }

    /// Current breaker state, for stats.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Free concurrency slots, for stats.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(concurrency: usize, pacing_ms: u64) -> UpstreamGate {
        UpstreamGate::new(
            UpstreamGateConfig {
                concurrency,
                pacing: Duration::from_millis(pacing_ms),
                breaker: BreakerConfig {
                    failure_threshold: 3,
                    initial_cool_down: Duration::from_millis(50),
                    max_cool_down: Duration::from_millis(200),
                },
            },
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let gate = gate(2, 0);
        let p1 = gate.acquire().await.unwrap();
        let _p2 = gate.acquire().await.unwrap();
        assert_eq!(gate.available_slots(), 0);

        // A third acquire waits until a permit frees up.
        let waited =
            tokio::time::timeout(Duration::from_millis(30), gate.acquire()).await;
        assert!(waited.is_err());

        drop(p1);
        let p3 = tokio::time::timeout(Duration::from_millis(100), gate.acquire())
            .await
            .expect("slot should free")
            .unwrap();
        drop(p3);
    }

    #[tokio::test]
    async fn test_pacing_spaces_departures() {
        let gate = gate(4, 30);
        let start = Instant::now();
        for _ in 0..3 {
            let permit = gate.acquire().await.unwrap();
            drop(permit);
        }
        // Three departures at 30ms spacing: the third leaves at >= 60ms.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_breaker_short_circuits() {
        let gate = gate(2, 0);
        for _ in 0..3 {
            let permit = gate.acquire().await.unwrap();
            permit.report(false);
        }
        assert_eq!(gate.breaker_state(), BreakerState::Open);
        match gate.acquire().await {
            Err(GateError::BreakerOpen(retry)) => {
                assert!(retry <= Duration::from_millis(50));
            }
            _ => panic!("expected breaker rejection"),
        };
    }

    #[tokio::test]
    async fn test_breaker_recovers_through_probe() {
        let gate = gate(2, 0);
        for _ in 0..3 {
            gate.acquire().await.unwrap().report(false);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Probe succeeds and the gate is open for business again.
        let probe = gate.acquire().await.unwrap();
        probe.report(true);
        drop(probe);
        assert_eq!(gate.breaker_state(), BreakerState::Closed);
        assert!(gate.acquire().await.is_ok());
    }
}
