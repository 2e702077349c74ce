//! The tile-serving hot path.
//!
//! Pipeline per request: admit at the edge, validate and key, then walk the
//! cache tiers from cheapest to dearest:
//!
//! ```text
//! LocalCache ──► BlobStore ──► MosaicCache ──► upstream fetch ──► store
//!   LOCAL           HIT                            MISS
//! ```
//!
//! Concurrent requests for one tile coalesce on a per-key guard; the winner
//! fetches, populates the LocalCache synchronously and the BlobStore
//! asynchronously, and every waiter re-reads the freshly populated cache.
//! The upstream fetch runs as a detached task so a departing client never
//! cancels work whose result the cache wants anyway; the task carries its
//! own deadline so it cannot outlive the request budget by more than one
//! window.
//!
//! Degraded modes: with the MetaStore down, admission and coalescing fall
//! back to process-local state; with the BlobStore down, tiles are served
//! from the upstream without write-back and a metric counts the condition.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::CoreContext;
use crate::keyspace::{self, KeyError, Layer, TileKey, TileRequest};
use crate::limiter::{EdgeDecision, GateError};
use crate::mosaic::{KeyedSingleFlight, MosaicError};
use crate::upstream::{fill_template, UpstreamError};

/// Where the response bytes came from, for the `X-Cache` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Local,
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Local => "LOCAL",
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// A served tile.
#[derive(Clone, Debug)]
pub struct TileResponse {
    pub bytes: Arc<Vec<u8>>,
    pub cache: CacheStatus,
    /// Strong ETag content (unquoted hex digest of the canonical key).
    pub etag: String,
}

/// Outcome of a warming pass over one tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WarmOutcome {
    /// The tile was already in the BlobStore; no upstream budget consumed.
    AlreadyCached,
    /// The tile was fetched and cached.
    Fetched,
}

/// Counts from an invalidation pass.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct InvalidationReport {
    pub blobs_removed: u64,
    pub meta_keys_removed: u64,
}

/// Failures surfaced by the pipeline, mapped to HTTP statuses at the edge.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("request throttled")]
    Throttled { retry_after: Duration },

    #[error("mosaic unavailable: {0}")]
    MosaicFailed(String),

    #[error("upstream fetch failed: {0}")]
    UpstreamFailed(String),

    #[error("deadline exceeded")]
    Deadline,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Retry schedule for transient tile-fetch failures.
const FETCH_BACKOFF: [Duration; 2] = [Duration::from_millis(100), Duration::from_millis(300)];

/// The tile pipeline.
pub struct TileEngine {
    ctx: CoreContext,
    tile_flight: KeyedSingleFlight,
}

impl TileEngine {
    pub fn new(ctx: CoreContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tile_flight: KeyedSingleFlight::new(),
        })
    }

    /// Shared context, for the HTTP surface.
    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    /// Serves one client request end to end, within the request deadline.
    pub async fn serve(
        &self,
        identity: &str,
        req: &TileRequest,
    ) -> Result<TileResponse, EngineError> {
        let deadline = self.ctx.config.request_deadline();
        match tokio::time::timeout(deadline, self.serve_inner(Some(identity), req)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Deadline),
        }
    }

    /// Warms one tile for the job engine: validates, skips tiles already in
    /// the BlobStore, and otherwise runs the regular pipeline without edge
    /// admission.
    pub async fn warm(&self, req: &TileRequest) -> Result<WarmOutcome, EngineError> {
        let key = keyspace::canonicalise(req, &self.ctx.registry)?;
        match self.ctx.blob.exists(&key.blob_path()).await {
            Ok(true) => return Ok(WarmOutcome::AlreadyCached),
            Ok(false) => {}
            Err(e) => {
                // Warming against a degraded store would fetch without
                // persisting; skip instead of burning upstream budget.
                return Err(EngineError::Internal(format!("blobstore unavailable: {e}")));
            }
        }
        let deadline = self.ctx.config.request_deadline();
        match tokio::time::timeout(deadline, self.serve_inner(None, req)).await {
            Ok(result) => result.map(|_| WarmOutcome::Fetched),
            Err(_) => Err(EngineError::Deadline),
        }
    }

    async fn serve_inner(
        &self,
        identity: Option<&str>,
        req: &TileRequest,
    ) -> Result<TileResponse, EngineError> {
        // 1. Admit. Warm traffic carries no client identity and bypasses the
        //    edge bucket; the upstream gate still applies.
        if let Some(identity) = identity {
            if let EdgeDecision::Throttled { retry_after } = self.ctx.edge.allow(identity).await {
                return Err(EngineError::Throttled { retry_after });
            }
        }

        // 2. Validate and key.
        let key = keyspace::canonicalise(req, &self.ctx.registry)?;
        let etag = etag_for(&key);

        // 3. Hottest tier.
        if let Some(bytes) = self.ctx.local.get(&key).await {
            self.ctx.metrics.local_hit();
            return Ok(TileResponse {
                bytes,
                cache: CacheStatus::Local,
                etag,
            });
        }

        // 4. Shared tier.
        let path = key.blob_path();
        let mut write_back = true;
        match self.ctx.blob.get(&path).await {
            Ok(Some(bytes)) => {
                let bytes = Arc::new(bytes);
                self.ctx.local.insert(&key, Arc::clone(&bytes)).await;
                self.ctx.metrics.blob_hit();
                return Ok(TileResponse {
                    bytes,
                    cache: CacheStatus::Hit,
                    etag,
                });
            }
            Ok(None) => {}
            Err(e) => {
                self.ctx.metrics.degraded_blob_write();
                warn!(error = %e, "blobstore read failed, serving without write-back");
                write_back = false;
            }
        }

        // 5-8. Coalesced fetch through mosaic and upstream.
        let bytes = self.fetch_coalesced(&key, write_back).await?;
        self.ctx.metrics.miss();
        Ok(TileResponse {
            bytes,
            cache: CacheStatus::Miss,
            etag,
        })
    }

    /// Per-tile single-flight around the upstream fetch. The first caller
    /// fetches; everyone queued behind the guard re-checks the caches the
    /// winner populated.
    async fn fetch_coalesced(
        &self,
        key: &TileKey,
        write_back: bool,
    ) -> Result<Arc<Vec<u8>>, EngineError> {
        let path = key.blob_path();
        let _guard = self.tile_flight.acquire(&path).await;

        if let Some(bytes) = self.ctx.local.get(key).await {
            debug!(path = %path, "tile fetch joined in-process flight");
            return Ok(bytes);
        }
        if write_back {
            // Another process may have filled the shared tier meanwhile.
            if let Ok(Some(bytes)) = self.ctx.blob.get(&path).await {
                let bytes = Arc::new(bytes);
                self.ctx.local.insert(key, Arc::clone(&bytes)).await;
                return Ok(bytes);
            }
        }

        // Detach the fetch so a dropped waiter cannot cancel it; its result
        // belongs to the cache either way. The task bounds itself with one
        // request deadline.
        let ctx = self.ctx.clone();
        let key = key.clone();
        let handle = tokio::spawn(fetch_and_store(ctx, key, write_back));
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Internal(format!("fetch task failed: {e}"))),
        }
    }
}

/// The detached miss path: resolve the mosaic, fetch the tile, populate the
/// cache tiers. Owns its context so it survives any individual waiter.
async fn fetch_and_store(
    ctx: CoreContext,
    key: TileKey,
    write_back: bool,
) -> Result<Arc<Vec<u8>>, EngineError> {
    let cancel = CancellationToken::new();
    let deadline = ctx.config.request_deadline();
    let work = async {
        // 5. Resolve the mosaic template (single-flighted per key).
        let handle = ctx
            .mosaic
            .get_template(&key.mosaic, &cancel)
            .await
            .map_err(map_mosaic_error)?;
        let template = handle.url_template.ok_or_else(|| {
            EngineError::Internal("ready mosaic handle without url template".to_string())
        })?;
        let url = fill_template(&template, key.z, key.x, key.y);

        // 6. Gated fetch with bounded retries.
        let bytes = Arc::new(fetch_with_retries(&ctx, &url, &cancel).await?);

        // 8. Populate tiers: local synchronously, blob off the hot path.
        ctx.local.insert(&key, Arc::clone(&bytes)).await;
        if write_back {
            let blob = Arc::clone(&ctx.blob);
            let metrics = Arc::clone(&ctx.metrics);
            let path = key.blob_path();
            let body = bytes.as_ref().clone();
            let ttl = ctx.config.tile_blob_ttl();
            tokio::spawn(async move {
                if let Err(e) = blob.put(&path, body, "image/png", ttl).await {
                    metrics.degraded_blob_write();
                    warn!(path = %path, error = %e, "tile write-back failed");
                }
            });
        }
        Ok(bytes)
    };

    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(EngineError::Deadline)
        }
    }
}

async fn fetch_with_retries(
    ctx: &CoreContext,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, EngineError> {
    let mut transient_attempts = 0usize;
    loop {
        let permit = ctx.gate.acquire().await.map_err(|e| match e {
            GateError::BreakerOpen(retry_after) => EngineError::Throttled { retry_after },
            GateError::Closed => EngineError::Internal("upstream gate closed".to_string()),
        })?;

        match ctx.upstream.fetch_tile(url, cancel.clone()).await {
            Ok(bytes) => {
                permit.report(true);
                ctx.metrics.tile_fetch();
                return Ok(bytes);
            }
            Err(UpstreamError::Quota(reason)) => {
                permit.report(false);
                ctx.metrics.throttled_request();
                debug!(url = %url, reason = %reason, "upstream quota hit");
                return Err(EngineError::Throttled {
                    retry_after: Duration::from_secs(1),
                });
            }
            Err(UpstreamError::Transient(reason)) => {
                // The breaker tracks upstream rejections, not network blips;
                // transient failures retry without a report.
                drop(permit);
                if transient_attempts >= FETCH_BACKOFF.len() {
                    return Err(EngineError::UpstreamFailed(reason));
                }
                tokio::time::sleep(FETCH_BACKOFF[transient_attempts]).await;
                transient_attempts += 1;
            }
            Err(UpstreamError::Permanent(reason)) => {
                drop(permit);
                return Err(EngineError::UpstreamFailed(reason));
            }
            Err(UpstreamError::Cancelled) => {
                drop(permit);
                return Err(EngineError::Deadline);
            }
        }
    }
}

impl TileEngine {
    /// Prefix-complete invalidation across all tiers: blob objects, local
    /// cache entries, and cached mosaic handles and election markers.
    pub async fn invalidate(
        &self,
        layer: Option<Layer>,
        year: Option<i32>,
    ) -> Result<InvalidationReport, EngineError> {
        let mut report = InvalidationReport::default();

        for prefix in keyspace::clear_prefixes(layer, year) {
            let removed = self
                .ctx
                .blob
                .delete_prefix(&prefix)
                .await
                .map_err(|e| EngineError::Internal(format!("blob invalidation failed: {e}")))?;
            report.blobs_removed += removed;
            self.ctx.local.purge_prefix(&prefix).await;
        }

        for prefix in keyspace::mosaic_prefixes(layer, year) {
            for namespace in ["mosaic:", "coalesce:"] {
                match self.ctx.meta.del_prefix(&format!("{namespace}{prefix}")).await {
                    Ok(removed) => report.meta_keys_removed += removed,
                    Err(e) => {
                        self.ctx.metrics.degraded_meta_op();
                        warn!(error = %e, "meta invalidation failed");
                    }
                }
            }
        }
        Ok(report)
    }
}

/// Strong ETag content for a tile key.
pub fn etag_for(key: &TileKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.blob_path().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn map_mosaic_error(e: MosaicError) -> EngineError {
    match e {
        MosaicError::Upstream(UpstreamError::Quota(_)) => EngineError::Throttled {
            retry_after: Duration::from_secs(1),
        },
        MosaicError::Upstream(UpstreamError::Cancelled) => EngineError::Deadline,
        MosaicError::Upstream(e) => EngineError::MosaicFailed(e.to_string()),
        MosaicError::CachedFailure(reason) => EngineError::MosaicFailed(reason),
        MosaicError::WaitTimeout => EngineError::MosaicFailed(
            "mosaic build did not complete within the election window".to_string(),
        ),
    }
}
