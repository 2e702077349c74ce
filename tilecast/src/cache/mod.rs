//! In-process cache for the hottest tiles.
//!
//! A bounded LRU over rendered PNGs keyed by blob path, backed by
//! `moka::future::Cache`. Strictly a latency optimiser: a hit skips two
//! network hops, a miss costs one hash lookup. Entries are weighed by their
//! byte size so the budget is memory, not entry count.
//!
//! Invalidation must keep this cache consistent with the BlobStore, so a
//! prefix purge here accompanies every prefix delete there.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache as MokaCache;
use tracing::warn;

use crate::keyspace::TileKey;

/// Default time-to-live for locally cached tiles.
pub const DEFAULT_LOCAL_TTL: Duration = Duration::from_secs(3600);

/// Bounded in-process tile cache.
pub struct LocalCache {
    cache: MokaCache<String, Arc<Vec<u8>>>,
}

impl LocalCache {
    /// Creates a cache with the given byte budget and entry TTL.
    pub fn new(max_bytes: u64, ttl: Duration) -> Self {
        let cache = MokaCache::builder()
            .weigher(|_key: &String, value: &Arc<Vec<u8>>| {
                value.len().min(u32::MAX as usize) as u32
            })
            .max_capacity(max_bytes)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        Self { cache }
    }

    /// Looks up a tile by key.
    pub async fn get(&self, key: &TileKey) -> Option<Arc<Vec<u8>>> {
        self.cache.get(&key.blob_path()).await
    }

    /// Inserts a rendered tile.
    pub async fn insert(&self, key: &TileKey, bytes: Arc<Vec<u8>>) {
        self.cache.insert(key.blob_path(), bytes).await;
    }

    /// Drops every entry whose path starts with `prefix`.
    pub async fn purge_prefix(&self, prefix: &str) {
        let prefix = prefix.to_string();
        if let Err(e) = self
            .cache
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix))
        {
            warn!(error = %e, "local cache prefix purge failed");
        }
        self.cache.run_pending_tasks().await;
    }

    /// Current weighted size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.cache.weighted_size()
    }

    /// Current entry count.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Runs pending maintenance (eviction, invalidation predicates).
    pub async fn run_pending(&self) {
        self.cache.run_pending_tasks().await;
    }
}
