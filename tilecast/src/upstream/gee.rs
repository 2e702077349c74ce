//! HTTP implementation of the upstream client.
//!
//! Speaks to the Earth-imagery compute gateway: a `POST /map` that resolves a
//! mosaic recipe to a tile URL template, and plain GETs for tile bytes. The
//! gateway wraps the actual Earth Engine session handling; this client only
//! maps transport and status codes onto the `UpstreamError` taxonomy.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::keyspace::MosaicKey;
use crate::visparam::{collection_for, VisParamRegistry};

use super::{date_window, BoxFuture, UpstreamClient, UpstreamError};

/// Default timeout for a mosaic build; these calls may take seconds.
const BUILD_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for a tile fetch.
const TILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Mosaic build request body sent to the gateway.
#[derive(Debug, Serialize)]
struct MapRequest<'a> {
    collection: &'a str,
    dt_start: String,
    dt_end: String,
    bands: &'a [String],
    min: &'a str,
    max: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    gamma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    palette: Option<&'a [String]>,
    composite_mode: &'a str,
}

/// Mosaic build response: the tile fetcher's URL template.
#[derive(Debug, Deserialize)]
struct MapResponse {
    url_format: String,
}

/// Upstream client over the Earth-imagery HTTP gateway.
pub struct GeeUpstreamClient {
    base_url: String,
    registry: Arc<VisParamRegistry>,
    client: reqwest::Client,
}

impl GeeUpstreamClient {
    /// Creates a client against the gateway base URL.
    pub fn new(
        base_url: impl Into<String>,
        registry: Arc<VisParamRegistry>,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(BUILD_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::Permanent(format!("http client build failed: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            registry,
            client,
        })
    }

    fn classify_status(status: StatusCode, body: &str) -> UpstreamError {
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                UpstreamError::Quota(format!("upstream returned 429: {body}"))
            }
            s if s.is_server_error() => {
                UpstreamError::Transient(format!("upstream returned {s}: {body}"))
            }
            s => UpstreamError::Permanent(format!("upstream returned {s}: {body}")),
        }
    }

    fn classify_transport(e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            UpstreamError::Transient(e.to_string())
        } else {
            UpstreamError::Permanent(e.to_string())
        }
    }
}

impl UpstreamClient for GeeUpstreamClient {
    fn build_mosaic(
        &self,
        key: &MosaicKey,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<String, UpstreamError>> {
        let key = key.clone();
        Box::pin(async move {
            let vis = self
                .registry
                .lookup(&key.visparam)
                .ok_or_else(|| UpstreamError::Permanent(format!(
                    "visparam {} disappeared from the catalogue",
                    key.visparam
                )))?;

            let (dt_start, dt_end) = date_window(&key);
            let body = MapRequest {
                collection: collection_for(key.layer, key.year),
                dt_start,
                dt_end,
                bands: &vis.bands,
                min: &vis.min,
                max: &vis.max,
                gamma: vis.gamma,
                palette: vis.palette.as_deref(),
                composite_mode: key.composite.as_str(),
            };

            let request = self
                .client
                .post(format!("{}/map", self.base_url))
                .json(&body)
                .send();

            let response = tokio::select! {
                res = request => res.map_err(Self::classify_transport)?,
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, &text));
            }

            let map: MapResponse = response
                .json()
                .await
                .map_err(|e| UpstreamError::Permanent(format!("malformed map response: {e}")))?;
            debug!(key = %key, "mosaic template resolved");
            Ok(map.url_format)
        })
    }

    fn fetch_tile(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Vec<u8>, UpstreamError>> {
        let url = url.to_string();
        Box::pin(async move {
            let request = self.client.get(&url).timeout(TILE_TIMEOUT).send();
            let response = tokio::select! {
                res = request => res.map_err(Self::classify_transport)?,
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, &text));
            }

            let bytes = response.bytes().await.map_err(Self::classify_transport)?;
            Ok(bytes.to_vec())
        })
    }
}
