//! HTTP surface: the tile endpoint, capabilities, health, and the control
//! plane.
//!
//! The router is framework-thin: handlers translate wire shapes to engine
//! calls and engine errors to statuses, nothing more. All shared state rides
//! in `AppState`, which clones cheaply into every handler.

mod admin;
mod auth;
mod capabilities;
mod error;
mod tiles;

pub use auth::basic_header;
pub use capabilities::{CapabilitiesCache, CAPABILITIES_TTL};
pub use error::ApiError;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::engine::TileEngine;
use crate::jobs::{CampaignStore, JobEngine};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TileEngine>,
    pub jobs: Arc<JobEngine>,
    pub campaigns: Arc<dyn CampaignStore>,
    pub capabilities: Arc<CapabilitiesCache>,
}

impl AppState {
    pub fn new(
        engine: Arc<TileEngine>,
        jobs: Arc<JobEngine>,
        campaigns: Arc<dyn CampaignStore>,
    ) -> Self {
        Self {
            engine,
            jobs,
            campaigns,
            capabilities: Arc::new(CapabilitiesCache::new()),
        }
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Builds the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/capabilities", get(capabilities::capabilities))
        .route("/api/layers/{layer}/{x}/{y}/{z}", get(tiles::serve_tile))
        .route("/api/cache/stats", get(admin::cache_stats))
        .route("/api/cache/clear", delete(admin::cache_clear))
        .route("/api/cache/warmup", post(admin::cache_warmup))
        .route("/api/cache/point/start", post(admin::point_start))
        .route("/api/cache/campaign/start", post(admin::campaign_start))
        .route("/api/cache/point/{id}/status", get(admin::point_status))
        .route(
            "/api/cache/campaign/{id}/status",
            get(admin::campaign_status),
        )
        .route("/api/tasks/{id}", get(admin::task_status))
        .route("/api/tasks/purge", post(admin::tasks_purge))
        .with_state(state)
}
