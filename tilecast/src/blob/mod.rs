//! Object store for rendered PNG tiles.
//!
//! Paths come verbatim from `TileKey::blob_path`, so the store needs no
//! knowledge of the key space. Writes are idempotent by path: the content for
//! a given path is deterministic given the mosaic handle, so last-writer-wins
//! is safe.
//!
//! Two backends: a filesystem tree for development and single-node setups,
//! and an S3-compatible HTTP backend for fleets. Object expiry (the 90-day
//! lifecycle, tier transitions) belongs to the store's own lifecycle rules;
//! `ttl_hint` only annotates the write.

mod fs;
mod http;

pub use fs::FsBlobStore;
pub use http::HttpBlobStore;

use std::time::Duration;

use thiserror::Error;

pub use crate::meta::BoxFuture;

/// Errors from BlobStore operations.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    /// The store cannot be reached. The engine degrades to fetch-through.
    #[error("blobstore unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the operation failed.
    #[error("blobstore operation failed: {0}")]
    Backend(String),

    /// The object path is not acceptable (absolute, empty, or escaping).
    #[error("invalid object path: {0}")]
    InvalidPath(String),
}

/// Aggregate store statistics for the stats endpoint.
///
/// Fields are optional because remote object stores only expose estimates,
/// if anything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct BlobStats {
    pub object_count: Option<u64>,
    pub total_bytes: Option<u64>,
}

/// PNG object storage addressed by tile paths.
pub trait BlobStore: Send + Sync {
    /// Stores an object, replacing any previous content at the path.
    fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        ttl_hint: Duration,
    ) -> BoxFuture<'_, Result<(), BlobStoreError>>;

    /// Retrieves an object, `None` when absent.
    fn get(&self, path: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, BlobStoreError>>;

    /// Checks existence without transferring the body.
    fn exists(&self, path: &str) -> BoxFuture<'_, Result<bool, BlobStoreError>>;

    /// Deletes every object under a path prefix. Returns the count removed.
    fn delete_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<u64, BlobStoreError>>;

    /// Aggregate statistics, best effort.
    fn stats(&self) -> BoxFuture<'_, Result<BlobStats, BlobStoreError>>;
}
