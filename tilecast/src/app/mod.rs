//! Application assembly: configuration, context, bootstrap.
//!
//! `CoreContext` is the explicit value threaded through every pipeline
//! component in place of global state. Production code builds it with
//! `bootstrap`; tests construct their own with fakes.

mod config;
mod error;

pub use config::{
    AdminCredentials, BlobBackend, CoreConfig, DEFAULT_ADMIN_ROLE, DEFAULT_EDGE_BURST,
    DEFAULT_EDGE_RATE_PER_MINUTE, DEFAULT_JOB_POOL_SIZE, DEFAULT_LOCAL_CACHE_BYTES,
    DEFAULT_MOSAIC_TTL_HOURS, DEFAULT_PORT, DEFAULT_REQUEST_DEADLINE_MS,
    DEFAULT_TILE_BLOB_TTL_DAYS, DEFAULT_UPSTREAM_CONCURRENCY, DEFAULT_UPSTREAM_PACING_MS,
};
pub use error::AppError;

use std::sync::Arc;

use tracing::info;

use crate::blob::{BlobStore, FsBlobStore, HttpBlobStore};
use crate::cache::{LocalCache, DEFAULT_LOCAL_TTL};
use crate::limiter::{EdgeLimiter, UpstreamGate};
use crate::meta::{MemoryMetaStore, MetaStore, RedisMetaStore};
use crate::mosaic::MosaicCache;
use crate::telemetry::Metrics;
use crate::upstream::{GeeUpstreamClient, UpstreamClient};
use crate::visparam::VisParamRegistry;

/// Shared handles to every core component.
///
/// Cloning is cheap; everything inside is reference counted.
#[derive(Clone)]
pub struct CoreContext {
    pub config: Arc<CoreConfig>,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<VisParamRegistry>,
    pub meta: Arc<dyn MetaStore>,
    pub blob: Arc<dyn BlobStore>,
    pub local: Arc<LocalCache>,
    pub mosaic: Arc<MosaicCache>,
    pub gate: Arc<UpstreamGate>,
    pub edge: Arc<EdgeLimiter>,
    pub upstream: Arc<dyn UpstreamClient>,
}

impl CoreContext {
    /// Assembles a context from explicit parts. Tests use this to inject
    /// fakes; `bootstrap` uses it with production components.
    pub fn assemble(
        config: CoreConfig,
        registry: Arc<VisParamRegistry>,
        meta: Arc<dyn MetaStore>,
        blob: Arc<dyn BlobStore>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let local = Arc::new(LocalCache::new(config.local_cache_bytes, DEFAULT_LOCAL_TTL));
        let mosaic = Arc::new(MosaicCache::new(
            Arc::clone(&meta),
            Arc::clone(&upstream),
            Arc::clone(&metrics),
            config.mosaic_cache_config(),
        ));
        let gate = Arc::new(UpstreamGate::new(config.gate_config(), Arc::clone(&metrics)));
        let edge = Arc::new(EdgeLimiter::new(
            Arc::clone(&meta),
            Arc::clone(&metrics),
            config.edge_config(),
        ));
        Self {
            config: Arc::new(config),
            metrics,
            registry,
            meta,
            blob,
            local,
            mosaic,
            gate,
            edge,
            upstream,
        }
    }
}

/// Builds the production context from configuration.
///
/// Chooses the MetaStore (Redis when `REDIS_URL` is set, in-memory
/// otherwise), the blob backend, and the HTTP upstream client.
pub async fn bootstrap(config: CoreConfig) -> Result<CoreContext, AppError> {
    let registry = Arc::new(VisParamRegistry::with_builtin_catalogue());

    let meta: Arc<dyn MetaStore> = match &config.redis_url {
        Some(url) => {
            info!(url = %url, "connecting fleet metastore");
            Arc::new(RedisMetaStore::connect(url).await?)
        }
        None => {
            info!("no REDIS_URL configured, using in-process metastore");
            Arc::new(MemoryMetaStore::new())
        }
    };

    let blob: Arc<dyn BlobStore> = match &config.blob_backend {
        BlobBackend::Fs { root } => {
            info!(root = %root.display(), "using filesystem blob store");
            Arc::new(FsBlobStore::new(root.clone()))
        }
        BlobBackend::Http { endpoint, bearer } => {
            info!(endpoint = %endpoint, "using http blob store");
            Arc::new(HttpBlobStore::new(endpoint.clone(), bearer.clone())?)
        }
    };

    let upstream: Arc<dyn UpstreamClient> = Arc::new(GeeUpstreamClient::new(
        config.upstream_base_url.clone(),
        Arc::clone(&registry),
    )?);

    Ok(CoreContext::assemble(config, registry, meta, blob, upstream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::FakeUpstream;

    #[tokio::test]
    async fn test_assemble_with_fakes() {
        let config = CoreConfig::default();
        let ctx = CoreContext::assemble(
            config,
            Arc::new(VisParamRegistry::with_builtin_catalogue()),
            Arc::new(MemoryMetaStore::new()),
            Arc::new(FsBlobStore::new(std::env::temp_dir().join("tilecast-test"))),
            Arc::new(FakeUpstream::new()),
        );
        assert_eq!(ctx.config.port, 8080);
        assert_eq!(ctx.local.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_defaults_to_memory_store() {
        let mut config = CoreConfig::default();
        config.redis_url = None;
        config.blob_backend = BlobBackend::Fs {
            root: std::env::temp_dir().join("tilecast-bootstrap-test"),
        };
        let ctx = bootstrap(config).await.unwrap();
        assert!(ctx.meta.get("missing").await.unwrap().is_none());
    }
}
