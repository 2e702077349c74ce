//! Fast key/value store for small control records.
//!
//! The MetaStore holds mosaic URL templates, single-flight election markers,
//! rate-limit buckets and job records. Keys are unique strings, values are
//! opaque bytes, and every key carries a TTL.
//!
//! The trait is dyn-compatible (`Pin<Box<dyn Future>>` methods) so the engine
//! can hold `Arc<dyn MetaStore>` and tests can inject the in-memory
//! implementation. Store failures surface as `MetaStoreError::Unavailable`;
//! callers that can degrade open (the limiter, the mosaic cache) catch that
//! variant specifically.

mod memory;
mod redis;

pub use memory::MemoryMetaStore;
pub use self::redis::RedisMetaStore;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from MetaStore operations.
#[derive(Debug, Error)]
pub enum MetaStoreError {
    /// The store cannot be reached. Callers degrade open on this variant.
    #[error("metastore unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the operation failed.
    #[error("metastore operation failed: {0}")]
    Backend(String),
}

/// Outcome of a token-bucket round trip.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketDecision {
    /// Whether the request fits in the bucket.
    pub allowed: bool,
    /// Whole tokens remaining after this request.
    pub remaining: u64,
    /// Time until at least one token is available again.
    pub retry_after: Duration,
}

/// Key/value store with TTLs, atomic put-if-absent, and a one-round-trip
/// token bucket.
pub trait MetaStore: Send + Sync {
    /// Retrieves a value by key. Expired keys read as absent.
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, MetaStoreError>>;

    /// Stores a value, replacing any previous one, expiring after `ttl`.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration)
        -> BoxFuture<'_, Result<(), MetaStoreError>>;

    /// Atomic put-if-absent. Returns `true` when this call created the key.
    ///
    /// This is the election primitive for the cross-process single-flight:
    /// exactly one caller per TTL window observes `true`.
    fn setnx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, MetaStoreError>>;

    /// Deletes a key. Deleting an absent key is not an error.
    fn del(&self, key: &str) -> BoxFuture<'_, Result<(), MetaStoreError>>;

    /// Deletes every key starting with `prefix`. Returns the count removed.
    fn del_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<u64, MetaStoreError>>;

    /// Token-bucket refill and spend in a single round trip.
    ///
    /// The bucket refills at `refill_per_sec` up to `capacity`; the call
    /// spends `cost` tokens if available and reports the decision either way.
    fn incr_bucket(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        refill_per_sec: f64,
    ) -> BoxFuture<'_, Result<BucketDecision, MetaStoreError>>;
}
