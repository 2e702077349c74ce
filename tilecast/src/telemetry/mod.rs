//! Serving and warming metrics.
//!
//! Lock-free atomic counters incremented from the hot path, with a
//! point-in-time snapshot type for the stats endpoint. Counters only; no
//! histograms, no external exporters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counter set shared across the engine, limiter and job engine.
///
/// All increments use relaxed ordering: the counters feed observability, not
/// control flow.
#[derive(Debug, Default)]
pub struct Metrics {
    local_hits: AtomicU64,
    blob_hits: AtomicU64,
    misses: AtomicU64,
    mosaic_builds: AtomicU64,
    mosaic_build_failures: AtomicU64,
    tile_fetches: AtomicU64,
    throttled: AtomicU64,
    breaker_opens: AtomicU64,
    degraded_meta_ops: AtomicU64,
    degraded_blob_writes: AtomicU64,
    tiles_warmed: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blob_hit(&self) {
        self.blob_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mosaic_build(&self) {
        self.mosaic_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mosaic_build_failure(&self) {
        self.mosaic_build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tile_fetch(&self) {
        self.tile_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn throttled_request(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn breaker_opened(&self) {
        self.breaker_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn degraded_meta_op(&self) {
        self.degraded_meta_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn degraded_blob_write(&self) {
        self.degraded_blob_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tile_warmed(&self) {
        self.tiles_warmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            blob_hits: self.blob_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            mosaic_builds: self.mosaic_builds.load(Ordering::Relaxed),
            mosaic_build_failures: self.mosaic_build_failures.load(Ordering::Relaxed),
            tile_fetches: self.tile_fetches.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            breaker_opens: self.breaker_opens.load(Ordering::Relaxed),
            degraded_meta_ops: self.degraded_meta_ops.load(Ordering::Relaxed),
            degraded_blob_writes: self.degraded_blob_writes.load(Ordering::Relaxed),
            tiles_warmed: self.tiles_warmed.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values, serialised into the stats endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub local_hits: u64,
    pub blob_hits: u64,
    pub misses: u64,
    pub mosaic_builds: u64,
    pub mosaic_build_failures: u64,
    pub tile_fetches: u64,
    pub throttled: u64,
    pub breaker_opens: u64,
    pub degraded_meta_ops: u64,
    pub degraded_blob_writes: u64,
    pub tiles_warmed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

impl MetricsSnapshot {
    /// Fraction of tile responses served without touching the upstream.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.local_hits + self.blob_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
