//! Per-client token bucket at the edge.
//!
//! Enforced before the request touches the key space. The bucket state lives
//! in the MetaStore (`bucket:<identity>`) so all instances drain one budget
//! per client; when the store is unreachable the limiter degrades open to a
//! best-effort in-process bucket rather than failing requests or dropping
//! rate limiting altogether.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::meta::{MemoryMetaStore, MetaStore};
use crate::telemetry::Metrics;

/// Admission decision for one request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EdgeDecision {
    Allowed,
    Throttled {
        /// Hint for the `Retry-After` header.
        retry_after: Duration,
    },
}

/// Edge limiter configuration.
#[derive(Clone, Copy, Debug)]
pub struct EdgeLimiterConfig {
    /// Sustained request budget per minute per identity.
    pub rate_per_minute: u64,
    /// Burst capacity per identity.
    pub burst: u64,
}

impl Default for EdgeLimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_minute: 100_000,
            burst: 10_000,
        }
    }
}

/// Fleet-wide token-bucket limiter with in-process fallback.
pub struct EdgeLimiter {
    meta: Arc<dyn MetaStore>,
    fallback: MemoryMetaStore,
    metrics: Arc<Metrics>,
    config: EdgeLimiterConfig,
}

impl EdgeLimiter {
    pub fn new(meta: Arc<dyn MetaStore>, metrics: Arc<Metrics>, config: EdgeLimiterConfig) -> Self {
        Self {
            meta,
            fallback: MemoryMetaStore::new(),
            metrics,
            config,
        }
    }

    /// Admits or throttles one request from `identity`.
    pub async fn allow(&self, identity: &str) -> EdgeDecision {
        let key = format!("bucket:{identity}");
        let capacity = self.config.burst as f64;
        let refill = self.config.rate_per_minute as f64 / 60.0;

        let decision = match self.meta.incr_bucket(&key, 1.0, capacity, refill).await {
            Ok(decision) => decision,
            Err(e) => {
                // Degrade open: a local bucket is better than none, and much
                // better than refusing traffic because a store is down.
                self.metrics.degraded_meta_op();
                warn!(error = %e, "metastore bucket unavailable, using in-process fallback");
                match self.fallback.incr_bucket(&key, 1.0, capacity, refill).await {
                    Ok(decision) => decision,
                    Err(_) => return EdgeDecision::Allowed,
                }
            }
        };

        if decision.allowed {
            EdgeDecision::Allowed
        } else {
            self.metrics.throttled_request();
            EdgeDecision::Throttled {
                retry_after: decision.retry_after.max(Duration::from_secs(1)),
            }
        }
    }
}
