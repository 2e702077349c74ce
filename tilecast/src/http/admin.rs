//! The control plane.
//!
//! Authenticated endpoints for cache statistics, scoped invalidation,
//! warming, and job introspection. Every handler checks Basic Auth against
//! the configured super-admin account before touching state; destructive
//! operations additionally require an explicit `confirm=true`.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Datelike;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::coord::BoundingBox;
use crate::jobs::{JobId, JobKind, Priority, POINT_ZOOMS};
use crate::keyspace::{Layer, Period};
use crate::limiter::BreakerState;

use super::auth;
use super::error::ApiError;
use super::AppState;

fn breaker_label(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half-open",
    }
}

/// GET `/api/cache/stats`.
pub async fn cache_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    auth::authorize(&headers, &state.engine.context().config.admin)?;
    let ctx = state.engine.context();

    let blob_stats = ctx.blob.stats().await.unwrap_or_default();
    let queue_depths: serde_json::Map<String, Value> = state
        .jobs
        .queue_depths()
        .into_iter()
        .map(|(priority, depth)| (priority.as_str().to_string(), json!(depth)))
        .collect();

    Ok(Json(json!({
        "metrics": ctx.metrics.snapshot(),
        "local_cache": {
            "entries": ctx.local.entry_count(),
            "bytes": ctx.local.size_bytes(),
            "max_bytes": ctx.config.local_cache_bytes,
        },
        "blob": blob_stats,
        "upstream": {
            "breaker": breaker_label(ctx.gate.breaker_state()),
            "available_slots": ctx.gate.available_slots(),
        },
        "queues": queue_depths,
        "visparam_version": ctx.registry.version(),
    })))
}

/// Query parameters of the clear endpoint.
#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    layer: Option<String>,
    year: Option<i32>,
    confirm: Option<String>,
}

/// DELETE `/api/cache/clear?layer=...&year=...&confirm=true`.
pub async fn cache_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ClearQuery>,
) -> Result<Json<Value>, ApiError> {
    auth::authorize(&headers, &state.engine.context().config.admin)?;
    if query.confirm.as_deref() != Some("true") {
        return Err(ApiError::bad_request(
            "cache clear requires confirm=true",
        ));
    }
    let layer = match &query.layer {
        Some(raw) => Some(raw.parse::<Layer>().map_err(ApiError::from_key_error)?),
        None => None,
    };

    let report = state.engine.invalidate(layer, query.year).await?;
    info!(
        layer = ?query.layer,
        year = ?query.year,
        blobs = report.blobs_removed,
        "cache cleared"
    );
    Ok(Json(json!({
        "status": "cleared",
        "blobs_removed": report.blobs_removed,
        "meta_keys_removed": report.meta_keys_removed,
    })))
}

/// Body of the warmup endpoint.
#[derive(Debug, Deserialize)]
pub struct WarmupBody {
    layer: String,
    region: Option<BoundingBox>,
    zooms: Option<Vec<u8>>,
    years: Option<Vec<i32>>,
    periods: Option<Vec<Period>>,
    visparams: Option<Vec<String>>,
    #[serde(default)]
    priority: Option<String>,
}

/// POST `/api/cache/warmup`.
pub async fn cache_warmup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WarmupBody>,
) -> Result<Json<Value>, ApiError> {
    auth::authorize(&headers, &state.engine.context().config.admin)?;
    let layer: Layer = body.layer.parse().map_err(ApiError::from_key_error)?;
    let region = body
        .region
        .ok_or_else(|| ApiError::bad_request("warmup requires a region bounding box"))?;

    let registry = &state.engine.context().registry;
    let current_year = chrono::Utc::now().year();
    let kind = JobKind::WarmRegion {
        bbox: region,
        layers: vec![layer],
        periods: body.periods.unwrap_or_else(|| vec![Period::Wet, Period::Dry]),
        years: body
            .years
            .unwrap_or_else(|| vec![current_year - 1, current_year]),
        zooms: body.zooms.unwrap_or_else(|| vec![12, 13]),
        visparams: body
            .visparams
            .unwrap_or_else(|| registry.names_for(layer.category())),
    };
    let priority = match body.priority.as_deref() {
        Some(raw) => raw
            .parse::<Priority>()
            .map_err(ApiError::bad_request)?,
        None => Priority::Low,
    };

    let id = state.jobs.submit(kind, priority).await?;
    Ok(Json(json!({ "status": "scheduled", "task_id": id.as_str() })))
}

/// Body of the point-start endpoint.
#[derive(Debug, Deserialize)]
pub struct PointStartBody {
    point_id: String,
}

/// POST `/api/cache/point/start`.
pub async fn point_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PointStartBody>,
) -> Result<Json<Value>, ApiError> {
    auth::authorize(&headers, &state.engine.context().config.admin)?;

    let campaign = state
        .campaigns
        .campaign_for_point(&body.point_id)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("point not found: {}", body.point_id)))?;
    let point = campaign
        .points
        .iter()
        .find(|p| p.id == body.point_id)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("point not found: {}", body.point_id)))?;

    if point.cached {
        return Ok(Json(json!({
            "status": "already_cached",
            "point_id": point.id,
        })));
    }

    let zooms = if campaign.zooms.is_empty() {
        POINT_ZOOMS.to_vec()
    } else {
        campaign.zooms.clone()
    };
    let kind = JobKind::WarmPoint {
        point_id: point.id.clone(),
        lat: point.lat,
        lon: point.lon,
        layers: campaign.layers.clone(),
        periods: campaign.periods.clone(),
        years: campaign.years.clone(),
        zooms,
        visparams: campaign.visparams.clone(),
    };
    let id = state.jobs.submit(kind, Priority::Standard).await?;
    info!(point = %point.id, task = %id, "point warm scheduled");
    Ok(Json(json!({
        "status": "started",
        "task_id": id.as_str(),
        "point_id": point.id,
    })))
}

/// Body of the campaign-start endpoint.
#[derive(Debug, Deserialize)]
pub struct CampaignStartBody {
    campaign_id: String,
    batch_size: Option<usize>,
    #[serde(default)]
    force_refresh: bool,
}

/// POST `/api/cache/campaign/start`.
pub async fn campaign_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CampaignStartBody>,
) -> Result<Json<Value>, ApiError> {
    auth::authorize(&headers, &state.engine.context().config.admin)?;
    let kind = JobKind::WarmCampaign {
        campaign_id: body.campaign_id.clone(),
        batch_size: body.batch_size.unwrap_or(5),
        force_refresh: body.force_refresh,
    };
    let id = state.jobs.submit(kind, Priority::Standard).await?;
    info!(campaign = %body.campaign_id, task = %id, "campaign warm scheduled");
    Ok(Json(json!({
        "status": "started",
        "task_id": id.as_str(),
        "campaign_id": body.campaign_id,
    })))
}

/// GET `/api/cache/point/{id}/status`.
pub async fn point_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth::authorize(&headers, &state.engine.context().config.admin)?;
    let point = state
        .campaigns
        .point(&id)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("point not found: {id}")))?;
    Ok(Json(json!({
        "point_id": point.id,
        "cached": point.cached,
    })))
}

/// GET `/api/cache/campaign/{id}/status`.
pub async fn campaign_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth::authorize(&headers, &state.engine.context().config.admin)?;
    let campaign = state
        .campaigns
        .campaign(&id)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("campaign not found: {id}")))?;
    let progress = state
        .campaigns
        .progress(&id)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?
        .unwrap_or_default();

    Ok(Json(json!({
        "campaign_id": campaign.id,
        "total_points": campaign.points.len(),
        "progress": progress,
    })))
}

/// GET `/api/tasks/{id}`.
pub async fn task_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth::authorize(&headers, &state.engine.context().config.admin)?;
    let record = state
        .jobs
        .record(&JobId::from_string(id.clone()))
        .await
        .ok_or_else(|| ApiError::not_found(format!("task not found: {id}")))?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

/// Query parameters of the purge endpoint.
#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    queue: Option<String>,
}

/// POST `/api/tasks/purge?queue=...`.
pub async fn tasks_purge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PurgeQuery>,
) -> Result<Json<Value>, ApiError> {
    auth::authorize(&headers, &state.engine.context().config.admin)?;
    let priority = match &query.queue {
        Some(raw) => Some(raw.parse::<Priority>().map_err(ApiError::bad_request)?),
        None => None,
    };
    let purged = state.jobs.purge(priority).await;
    info!(queue = ?query.queue, purged, "job queue purged");
    Ok(Json(json!({ "status": "purged", "purged": purged })))
}
