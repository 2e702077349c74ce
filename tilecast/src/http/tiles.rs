//! The tile endpoint.
//!
//! `GET /api/layers/{layer}/{x}/{y}/{z}?period&year&month&visparam` returns
//! PNG bytes with cache provenance headers. Tiles are immutable for their
//! blob TTL, so responses carry a strong ETag and a long public max-age;
//! `If-None-Match` short-circuits to 304 before the pipeline runs.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Datelike;
use serde::Deserialize;

use crate::engine::TileResponse;
use crate::keyspace::{self, CompositeMode, Layer, Period, TileRequest};

use super::error::ApiError;
use super::AppState;

/// Cache-Control for tile responses: 30 days, immutable.
const TILE_CACHE_CONTROL: &str = "public, max-age=2592000, immutable";

/// Query parameters of the tile endpoint.
#[derive(Debug, Deserialize)]
pub struct TileQuery {
    period: Option<String>,
    year: Option<i32>,
    month: Option<u8>,
    visparam: Option<String>,
    #[serde(rename = "compositeMode")]
    composite_mode: Option<String>,
}

/// Client identity for the edge limiter: first hop of `X-Forwarded-For`,
/// then `X-Real-IP`, else a shared anonymous bucket. The edge proxy owns
/// the trustworthy value.
fn client_identity(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.trim().to_string();
    }
    "anonymous".to_string()
}

fn parse_request(
    layer: &str,
    x: u32,
    y: u32,
    z: u8,
    query: &TileQuery,
) -> Result<TileRequest, ApiError> {
    let layer: Layer = layer.parse().map_err(ApiError::from_key_error)?;
    let period: Period = query
        .period
        .as_deref()
        .unwrap_or("WET")
        .parse()
        .map_err(ApiError::from_key_error)?;
    let composite: CompositeMode = match query.composite_mode.as_deref() {
        Some(raw) => raw.parse().map_err(ApiError::from_key_error)?,
        None => CompositeMode::BestImage,
    };
    let visparam = query.visparam.clone().unwrap_or_else(|| {
        match layer {
            Layer::S2Harmonized => "tvi-red",
            Layer::Landsat => "landsat-tvi-false",
        }
        .to_string()
    });
    Ok(TileRequest {
        layer,
        x,
        y,
        z,
        period,
        year: query.year.unwrap_or_else(|| chrono::Utc::now().year()),
        month: query.month,
        visparam,
        composite,
    })
}

fn if_none_match(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// GET handler for tiles.
pub async fn serve_tile(
    State(state): State<AppState>,
    Path((layer, x, y, z)): Path<(String, u32, u32, u8)>,
    Query(query): Query<TileQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request = parse_request(&layer, x, y, z, &query)?;

    // Conditional requests answer from the key alone; the strong ETag is a
    // digest of the canonical tile key, not the bytes.
    let key = keyspace::canonicalise(&request, &state.engine.context().registry)
        .map_err(ApiError::from_key_error)?;
    let quoted_etag = format!("\"{}\"", crate::engine::etag_for(&key));
    if let Some(candidate) = if_none_match(&headers) {
        if candidate == quoted_etag || candidate == "*" {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            response.headers_mut().insert(
                header::ETAG,
                HeaderValue::from_str(&quoted_etag)
                    .unwrap_or(HeaderValue::from_static("\"\"")),
            );
            return Ok(response);
        }
    }

    let identity = client_identity(&headers);
    let tile: TileResponse = state.engine.serve(&identity, &request).await?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/png")
        .header(header::CACHE_CONTROL, TILE_CACHE_CONTROL)
        .header(header::ETAG, format!("\"{}\"", tile.etag))
        .header("x-cache", tile.cache.as_str())
        .body(Body::from(tile.bytes.as_ref().clone()))
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(response)
}
