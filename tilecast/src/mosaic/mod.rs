//! Single-flight cache of upstream mosaic URL templates.
//!
//! Building a mosaic is the expensive step: seconds of upstream compute that
//! millions of tiles under the same `(layer, period, year, visparam)` share.
//! This cache guarantees at most one concurrent build per key in the process
//! (keyed single-flight) and at most one across the fleet (MetaStore `setnx`
//! election).
//!
//! State machine per key:
//!
//! ```text
//! absent ──acquire──▶ BUILDING ──success──▶ READY ──expiry──▶ absent
//!                          └──failure──▶ FAILED ──cool-down──▶ absent
//! ```
//!
//! The `coalesce:` election marker carries BUILDING; READY and FAILED live at
//! the `mosaic:` key with the mosaic TTL and the failure cool-down
//! respectively. A crashed winner is repaired by election-TTL expiry.
//!
//! When the MetaStore is unreachable the cache degrades open to per-process
//! single-flight only: duplicate builds across processes become possible but
//! stay bounded by the instance count.

mod coalesce;

pub use coalesce::KeyedSingleFlight;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keyspace::MosaicKey;
use crate::meta::{MetaStore, MetaStoreError};
use crate::telemetry::Metrics;
use crate::upstream::{UpstreamClient, UpstreamError};

/// Lifecycle state of a mosaic handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HandleState {
    Ready,
    Building,
    Failed,
}

/// The record cached per mosaic key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MosaicHandle {
    pub state: HandleState,
    /// Tile URL template with `{x}`/`{y}`/`{z}` placeholders; present iff READY.
    pub url_template: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub ttl_ms: u64,
    /// Failure reason; present iff FAILED.
    pub error: Option<String>,
}

impl MosaicHandle {
    fn ready(url_template: String, ttl: Duration) -> Self {
        Self {
            state: HandleState::Ready,
            url_template: Some(url_template),
            acquired_at: Utc::now(),
            ttl_ms: ttl.as_millis() as u64,
            error: None,
        }
    }

    fn building() -> Self {
        Self {
            state: HandleState::Building,
            url_template: None,
            acquired_at: Utc::now(),
            ttl_ms: 0,
            error: None,
        }
    }

    fn failed(error: String, cool_down: Duration) -> Self {
        Self {
            state: HandleState::Failed,
            url_template: None,
            acquired_at: Utc::now(),
            ttl_ms: cool_down.as_millis() as u64,
            error: Some(error),
        }
    }

    /// True while the handle's own TTL has not elapsed. The MetaStore TTL is
    /// authoritative; this guards against stale reads around expiry.
    pub fn is_fresh(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        age.num_milliseconds() >= 0 && (age.num_milliseconds() as u64) < self.ttl_ms
    }
}

/// Errors surfaced to the tile pipeline.
#[derive(Debug, Error)]
pub enum MosaicError {
    /// This caller ran the build and it failed.
    #[error("mosaic build failed: {0}")]
    Upstream(#[from] UpstreamError),

    /// Another caller ran the build recently and it failed; the failure is
    /// in cool-down.
    #[error("mosaic build recently failed: {0}")]
    CachedFailure(String),

    /// Another process held the election past the full wait budget.
    #[error("timed out waiting for concurrent mosaic build")]
    WaitTimeout,
}

/// Timing configuration for the single-flight protocol.
#[derive(Clone, Debug)]
pub struct MosaicCacheConfig {
    /// Lifetime of a READY handle.
    pub mosaic_ttl: Duration,
    /// Lifetime of the build election; also the losers' wait budget.
    pub election_ttl: Duration,
    /// Lifetime of a FAILED handle.
    pub cool_down: Duration,
    /// First poll delay for election losers.
    pub poll_initial: Duration,
    /// Poll delay cap.
    pub poll_max: Duration,
}

impl Default for MosaicCacheConfig {
    fn default() -> Self {
        Self {
            mosaic_ttl: Duration::from_secs(24 * 3600),
            election_ttl: Duration::from_secs(60),
            cool_down: Duration::from_secs(15),
            poll_initial: Duration::from_millis(50),
            poll_max: Duration::from_millis(500),
        }
    }
}

/// Single-flight cache of mosaic handles.
pub struct MosaicCache {
    meta: Arc<dyn MetaStore>,
    upstream: Arc<dyn UpstreamClient>,
    metrics: Arc<Metrics>,
    inflight: KeyedSingleFlight,
    config: MosaicCacheConfig,
}

impl MosaicCache {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        upstream: Arc<dyn UpstreamClient>,
        metrics: Arc<Metrics>,
        config: MosaicCacheConfig,
    ) -> Self {
        Self {
            meta,
            upstream,
            metrics,
            inflight: KeyedSingleFlight::new(),
            config,
        }
    }

    /// Resolves the URL template for a mosaic key, building it at most once
    /// per election window across the fleet.
    ///
    /// # Errors
    ///
    /// - `MosaicError::Upstream` when this caller ran the failing build
    /// - `MosaicError::CachedFailure` during another build's cool-down
    /// - `MosaicError::WaitTimeout` when the election never resolved
    pub async fn get_template(
        &self,
        key: &MosaicKey,
        cancel: &CancellationToken,
    ) -> Result<MosaicHandle, MosaicError> {
        // Fast path: a fresh handle needs no coordination.
        if let Some(outcome) = self.try_cached(key).await? {
            return Ok(outcome);
        }

        // One election runner per key per process; everyone else parks here
        // and re-reads the handle the runner produced.
        let _guard = self.inflight.acquire(&key.canonical()).await;
        if let Some(outcome) = self.try_cached(key).await? {
            return Ok(outcome);
        }

        // Two rounds cover the crashed-winner case: the first round waits out
        // a stale election, the second re-elects.
        for round in 0..2 {
            match self
                .meta
                .setnx(
                    &key.election_key(),
                    encode(&MosaicHandle::building()),
                    self.config.election_ttl,
                )
                .await
            {
                Ok(true) => return self.build_and_record(key, cancel).await,
                Ok(false) => {
                    debug!(key = %key, round, "lost mosaic election, polling");
                    if let Some(outcome) = self.poll_for_handle(key, cancel).await? {
                        return Ok(outcome);
                    }
                }
                Err(e) => return self.build_degraded(key, cancel, e).await,
            }
        }
        Err(MosaicError::WaitTimeout)
    }

    /// Reads the cached handle, mapping FAILED to an error and stale or
    /// BUILDING handles to `None`.
    async fn try_cached(&self, key: &MosaicKey) -> Result<Option<MosaicHandle>, MosaicError> {
        let raw = match self.meta.get(&key.meta_key()).await {
            Ok(raw) => raw,
            Err(_) => return Ok(None), // the election path handles degradation
        };
        let Some(raw) = raw else { return Ok(None) };
        let Some(handle) = decode(&raw) else {
            return Ok(None);
        };
        match handle.state {
            HandleState::Ready if handle.is_fresh() => Ok(Some(handle)),
            HandleState::Failed if handle.is_fresh() => Err(MosaicError::CachedFailure(
                handle.error.unwrap_or_else(|| "unknown failure".to_string()),
            )),
            _ => Ok(None),
        }
    }

    /// Winner path: run the upstream build and persist the outcome.
    async fn build_and_record(
        &self,
        key: &MosaicKey,
        cancel: &CancellationToken,
    ) -> Result<MosaicHandle, MosaicError> {
        let result = self.upstream.build_mosaic(key, cancel.clone()).await;
        match result {
            Ok(url_template) => {
                self.metrics.mosaic_build();
                let handle = MosaicHandle::ready(url_template, self.config.mosaic_ttl);
                self.persist(key, &handle, self.config.mosaic_ttl).await;
                self.release_election(key).await;
                info!(key = %key, "mosaic ready");
                Ok(handle)
            }
            Err(UpstreamError::Cancelled) => {
                // Leave no FAILED record behind; the election expires on its own.
                self.release_election(key).await;
                Err(MosaicError::Upstream(UpstreamError::Cancelled))
            }
            Err(e) => {
                self.metrics.mosaic_build_failure();
                let handle = MosaicHandle::failed(e.to_string(), self.config.cool_down);
                self.persist(key, &handle, self.config.cool_down).await;
                self.release_election(key).await;
                warn!(key = %key, error = %e, "mosaic build failed, cool-down recorded");
                Err(MosaicError::Upstream(e))
            }
        }
    }

    /// Degraded path: the MetaStore is unreachable, so cross-process
    /// coordination is off. The in-process guard still bounds duplicates to
    /// one per instance.
    async fn build_degraded(
        &self,
        key: &MosaicKey,
        cancel: &CancellationToken,
        cause: MetaStoreError,
    ) -> Result<MosaicHandle, MosaicError> {
        self.metrics.degraded_meta_op();
        warn!(key = %key, error = %cause, "metastore unavailable, building without election");
        let url_template = self.upstream.build_mosaic(key, cancel.clone()).await?;
        self.metrics.mosaic_build();
        Ok(MosaicHandle::ready(url_template, self.config.mosaic_ttl))
    }

    /// Loser path: wait for the winner's handle with bounded backoff.
    ///
    /// Returns `Ok(None)` when the wait budget (one election TTL) elapses
    /// without an outcome, signalling the caller to re-elect.
    async fn poll_for_handle(
        &self,
        key: &MosaicKey,
        cancel: &CancellationToken,
    ) -> Result<Option<MosaicHandle>, MosaicError> {
        let mut delay = self.config.poll_initial;
        let mut waited = Duration::ZERO;
        while waited < self.config.election_ttl {
            if cancel.is_cancelled() {
                return Err(MosaicError::Upstream(UpstreamError::Cancelled));
            }
            tokio::time::sleep(delay).await;
            waited += delay;
            delay = (delay * 2).min(self.config.poll_max);

            if let Some(outcome) = self.try_cached(key).await? {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    async fn persist(&self, key: &MosaicKey, handle: &MosaicHandle, ttl: Duration) {
        if let Err(e) = self.meta.set(&key.meta_key(), encode(handle), ttl).await {
            self.metrics.degraded_meta_op();
            warn!(key = %key, error = %e, "failed to persist mosaic handle");
        }
    }

    async fn release_election(&self, key: &MosaicKey) {
        if let Err(e) = self.meta.del(&key.election_key()).await {
            debug!(key = %key, error = %e, "election marker release failed");
        }
    }
}

fn encode(handle: &MosaicHandle) -> Vec<u8> {
    serde_json::to_vec(handle).unwrap_or_default()
}

fn decode(raw: &[u8]) -> Option<MosaicHandle> {
    serde_json::from_slice(raw).ok()
}
