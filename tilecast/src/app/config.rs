//! Core configuration.
//!
//! A closed record with defaulted fields: every tunable the server honours is
//! named here, loaded from the environment by `CoreConfig::from_env`. There
//! is no pass-through of arbitrary settings.

use std::path::PathBuf;
use std::time::Duration;

use crate::limiter::{BreakerConfig, EdgeLimiterConfig, UpstreamGateConfig};
use crate::mosaic::MosaicCacheConfig;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default mosaic URL-template lifetime in hours.
pub const DEFAULT_MOSAIC_TTL_HOURS: u64 = 24;

/// Default tile object lifetime hint in days.
pub const DEFAULT_TILE_BLOB_TTL_DAYS: u64 = 30;

/// Default cap on concurrent upstream calls per process.
pub const DEFAULT_UPSTREAM_CONCURRENCY: usize = 25;

/// Default minimum spacing between upstream calls in milliseconds.
pub const DEFAULT_UPSTREAM_PACING_MS: u64 = 50;

/// Default per-identity sustained rate per minute.
pub const DEFAULT_EDGE_RATE_PER_MINUTE: u64 = 100_000;

/// Default per-identity burst capacity.
pub const DEFAULT_EDGE_BURST: u64 = 10_000;

/// Default inbound request deadline in milliseconds.
pub const DEFAULT_REQUEST_DEADLINE_MS: u64 = 30_000;

/// Default in-process tile cache budget in bytes (512 MiB).
pub const DEFAULT_LOCAL_CACHE_BYTES: u64 = 512 * 1024 * 1024;

/// Default warming worker count per instance.
pub const DEFAULT_JOB_POOL_SIZE: usize = 8;

/// Default role required on admin endpoints.
pub const DEFAULT_ADMIN_ROLE: &str = "super-admin";

/// Which blob backend to use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobBackend {
    /// Filesystem tree rooted at a directory.
    Fs { root: PathBuf },
    /// S3-compatible HTTP endpoint with optional bearer token.
    Http { endpoint: String, bearer: Option<String> },
}

/// Admin credentials checked by the control plane.
///
/// The password is either plain or a hex SHA-256 digest; `hashed` says which.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminCredentials {
    pub user: String,
    pub password: String,
    pub hashed: bool,
    pub role: String,
}

/// Top-level configuration for the core.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    pub port: u16,
    pub mosaic_ttl_hours: u64,
    pub tile_blob_ttl_days: u64,
    pub upstream_concurrency: usize,
    pub upstream_pacing_ms: u64,
    pub edge_rate_per_minute: u64,
    pub edge_burst: u64,
    pub request_deadline_ms: u64,
    pub local_cache_bytes: u64,
    pub job_pool_size: usize,
    /// Redis URL for the fleet MetaStore; `None` selects the in-memory store.
    pub redis_url: Option<String>,
    pub blob_backend: BlobBackend,
    /// Base URL of the Earth-imagery compute gateway.
    pub upstream_base_url: String,
    pub admin: AdminCredentials,
    pub log_json: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            mosaic_ttl_hours: DEFAULT_MOSAIC_TTL_HOURS,
            tile_blob_ttl_days: DEFAULT_TILE_BLOB_TTL_DAYS,
            upstream_concurrency: DEFAULT_UPSTREAM_CONCURRENCY,
            upstream_pacing_ms: DEFAULT_UPSTREAM_PACING_MS,
            edge_rate_per_minute: DEFAULT_EDGE_RATE_PER_MINUTE,
            edge_burst: DEFAULT_EDGE_BURST,
            request_deadline_ms: DEFAULT_REQUEST_DEADLINE_MS,
            local_cache_bytes: DEFAULT_LOCAL_CACHE_BYTES,
            job_pool_size: DEFAULT_JOB_POOL_SIZE,
            redis_url: None,
            blob_backend: BlobBackend::Fs {
                root: PathBuf::from("./data/tiles"),
            },
            upstream_base_url: "http://localhost:9100".to_string(),
            admin: AdminCredentials {
                user: "admin".to_string(),
                password: "admin".to_string(),
                hashed: false,
                role: DEFAULT_ADMIN_ROLE.to_string(),
            },
            log_json: false,
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_str(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    env_str(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env_str(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env_str(name)
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" => Some(true),
            "0" | "false" | "FALSE" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

impl CoreConfig {
    /// Loads configuration from the environment, with defaults for every
    /// missing variable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let blob_backend = match env_str("BLOB_ENDPOINT") {
            Some(endpoint) => BlobBackend::Http {
                endpoint,
                bearer: env_str("BLOB_BEARER"),
            },
            None => BlobBackend::Fs {
                root: env_str("BLOB_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/tiles")),
            },
        };
        Self {
            port: env_u16("PORT", defaults.port),
            mosaic_ttl_hours: env_u64("MOSAIC_TTL_HOURS", defaults.mosaic_ttl_hours),
            tile_blob_ttl_days: env_u64("TILE_BLOB_TTL_DAYS", defaults.tile_blob_ttl_days),
            upstream_concurrency: env_usize("UPSTREAM_CONCURRENCY", defaults.upstream_concurrency),
            upstream_pacing_ms: env_u64("UPSTREAM_PACING_MS", defaults.upstream_pacing_ms),
            edge_rate_per_minute: env_u64("EDGE_RATE_PER_MINUTE", defaults.edge_rate_per_minute),
            edge_burst: env_u64("EDGE_BURST", defaults.edge_burst),
            request_deadline_ms: env_u64("REQUEST_DEADLINE_MS", defaults.request_deadline_ms),
            local_cache_bytes: env_u64("LOCAL_CACHE_BYTES", defaults.local_cache_bytes),
            job_pool_size: env_usize("JOB_POOL_SIZE", defaults.job_pool_size),
            redis_url: env_str("REDIS_URL"),
            blob_backend,
            upstream_base_url: env_str("UPSTREAM_BASE_URL")
                .unwrap_or(defaults.upstream_base_url),
            admin: AdminCredentials {
                user: env_str("ADMIN_USER").unwrap_or(defaults.admin.user),
                password: env_str("ADMIN_PASSWORD").unwrap_or(defaults.admin.password),
                hashed: env_bool("ADMIN_PASSWORD_HASHED", false),
                role: env_str("ADMIN_REQUIRED_ROLE").unwrap_or(defaults.admin.role),
            },
            log_json: env_bool("LOG_JSON", defaults.log_json),
        }
    }

    /// Inbound request deadline.
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    /// TTL hint written with each tile object.
    pub fn tile_blob_ttl(&self) -> Duration {
        Duration::from_secs(self.tile_blob_ttl_days * 24 * 3600)
    }

    /// Mosaic cache timings derived from this config.
    pub fn mosaic_cache_config(&self) -> MosaicCacheConfig {
        MosaicCacheConfig {
            mosaic_ttl: Duration::from_secs(self.mosaic_ttl_hours * 3600),
            ..MosaicCacheConfig::default()
        }
    }

    /// Upstream gate settings derived from this config.
    pub fn gate_config(&self) -> UpstreamGateConfig {
        UpstreamGateConfig {
            concurrency: self.upstream_concurrency,
            pacing: Duration::from_millis(self.upstream_pacing_ms),
            breaker: BreakerConfig::default(),
        }
    }

    /// Edge limiter settings derived from this config.
    pub fn edge_config(&self) -> EdgeLimiterConfig {
        EdgeLimiterConfig {
            rate_per_minute: self.edge_rate_per_minute,
            burst: self.edge_burst,
        }
    }
}
