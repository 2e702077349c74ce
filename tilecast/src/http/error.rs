//! HTTP error payloads and the single engine-to-status mapping.
//!
//! Every pipeline failure converges here so the status-code contract lives
//! in one place. Internal errors are logged with full context and leave the
//! process as a generic message.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::engine::EngineError;
use crate::jobs::SubmitError;
use crate::keyspace::KeyError;

/// An error ready to leave the process.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication required")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "insufficient role")
    }

    /// Maps a validation failure onto 400 or 404.
    pub fn from_key_error(e: KeyError) -> Self {
        if e.is_not_found() {
            Self::not_found(e.to_string())
        } else {
            Self::bad_request(e.to_string())
        }
    }
}

impl From<KeyError> for ApiError {
    fn from(e: KeyError) -> Self {
        Self::from_key_error(e)
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Key(e) => Self::from_key_error(e),
            EngineError::Throttled { retry_after } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: "rate limited".to_string(),
                retry_after: Some(retry_after),
            },
            EngineError::MosaicFailed(reason) => {
                Self::new(StatusCode::BAD_GATEWAY, format!("mosaic unavailable: {reason}"))
            }
            EngineError::UpstreamFailed(reason) => Self::new(
                StatusCode::BAD_GATEWAY,
                format!("upstream fetch failed: {reason}"),
            ),
            EngineError::Deadline => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "request deadline exceeded")
            }
            EngineError::Internal(context) => {
                error!(context = %context, "internal error on tile pipeline");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::QueueFull(e) => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            SubmitError::CampaignNotFound(id) => {
                Self::not_found(format!("campaign not found: {id}"))
            }
            SubmitError::PointNotFound(id) => Self::not_found(format!("point not found: {id}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status, Json(json!({ "error": self.message }))).into_response();
        if let Some(retry_after) = self.retry_after {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "www-authenticate",
                HeaderValue::from_static("Basic realm=\"tilecast-admin\""),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_error_split() {
        let bad = ApiError::from_key_error(KeyError::ZoomOutOfRange(5));
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);

        let missing = ApiError::from_key_error(KeyError::UnknownVisParam("x".into()));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_engine_error_statuses() {
        let throttled: ApiError = EngineError::Throttled {
            retry_after: Duration::from_secs(30),
        }
        .into();
        assert_eq!(throttled.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(throttled.retry_after, Some(Duration::from_secs(30)));

        let gateway: ApiError = EngineError::MosaicFailed("empty".into()).into();
        assert_eq!(gateway.status, StatusCode::BAD_GATEWAY);

        let timeout: ApiError = EngineError::Deadline.into();
        assert_eq!(timeout.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_internal_error_never_leaks_context() {
        let internal: ApiError = EngineError::Internal("secret path /x".into()).into();
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!internal.message.contains("secret"));
    }

    #[test]
    fn test_retry_after_header_set() {
        let err = ApiError {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(7)),
        };
        let response = err.into_response();
        assert_eq!(response.headers().get("retry-after").unwrap(), "7");
    }

    #[test]
    fn test_unauthorized_challenges() {
        let response = ApiError::unauthorized().into_response();
        assert!(response.headers().contains_key("www-authenticate"));
    }
}
