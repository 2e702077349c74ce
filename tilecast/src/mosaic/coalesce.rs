//! Per-key in-process single-flight.
//!
//! A map of keyed async mutexes: the first task through `acquire` holds the
//! key while it works, every later task for the same key parks until the
//! holder finishes and then re-checks whatever cache the work populated.
//! Distinct keys proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Entry-count threshold that triggers opportunistic cleanup of idle locks.
const CLEANUP_THRESHOLD: usize = 1024;

/// Keyed mutex map for request coalescing.
#[derive(Debug, Default)]
pub struct KeyedSingleFlight {
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedSingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting behind any current holder.
    ///
    /// The returned guard owns its mutex, so it can cross `.await` points
    /// and outlive the map lock.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inflight = self.inflight.lock().await;
            if inflight.len() > CLEANUP_THRESHOLD {
                // Idle entries have no holders besides the map itself.
                inflight.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(
                inflight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked (held or idle).
    pub async fn tracked_keys(&self) -> usize {
        self.inflight.lock().await.len()
    }
}
