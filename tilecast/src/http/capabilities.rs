//! The capabilities endpoint.
//!
//! Serves the parameter space clients may request: layers, years, periods
//! and visparams. The document derives from the visparam registry and is
//! cached in-process for a short window; a registry version bump
//! invalidates the cached copy immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use parking_lot::Mutex;
use serde_json::Value;

use crate::visparam::VisParamRegistry;

use super::AppState;

/// How long a built capabilities document may serve before a rebuild.
pub const CAPABILITIES_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct CachedDocument {
    version: u64,
    built_at: Instant,
    document: Arc<Value>,
}

/// In-process cache of the capabilities document.
#[derive(Debug, Default)]
pub struct CapabilitiesCache {
    cached: Mutex<Option<CachedDocument>>,
}

impl CapabilitiesCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current document, rebuilding when the TTL elapsed or the
    /// registry version moved.
    pub fn get(&self, registry: &VisParamRegistry) -> Arc<Value> {
        let version = registry.version();
        let mut cached = self.cached.lock();
        if let Some(entry) = cached.as_ref() {
            if entry.version == version && entry.built_at.elapsed() < CAPABILITIES_TTL {
                return Arc::clone(&entry.document);
            }
        }
        let document = Arc::new(
            serde_json::to_value(registry.capabilities()).unwrap_or(Value::Null),
        );
        *cached = Some(CachedDocument {
            version,
            built_at: Instant::now(),
            document: Arc::clone(&document),
        });
        document
    }
}

/// GET handler for `/api/capabilities`.
pub async fn capabilities(State(state): State<AppState>) -> Json<Value> {
    let document = state
        .capabilities
        .get(&state.engine.context().registry);
    Json(document.as_ref().clone())
}
