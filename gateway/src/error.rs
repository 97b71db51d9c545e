//! Error types for backend calls and the operational HTTP surface.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Failure of a single call to a backend node.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Transport(String),
    #[error("Backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid response: {0}")]
    Decode(String),
    #[error("Timed out after {0:.1}s")]
    Timeout(f64),
}

impl BackendError {
    /// Classify a reqwest failure. `limit` is the deadline the call ran under.
    pub fn from_reqwest(err: reqwest::Error, limit: Duration) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(limit.as_secs_f64())
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }

    /// Whether another attempt against the same node may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Transport(_) | BackendError::Timeout(_) => true,
            BackendError::Status { status, .. } => *status >= 500 || *status == 429,
            BackendError::Decode(_) => false,
        }
    }

    /// Whether the failure counts against the node class's circuit breaker.
    /// Client errors mean the backend is up and rejected this request.
    pub fn is_dependency_failure(&self) -> bool {
        match self {
            BackendError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => true,
        }
    }
}

/// Errors returned by the gateway's own HTTP routes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("No backend could serve the request")]
    Unavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        let status = |status| BackendError::Status {
            status,
            body: String::new(),
        };
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!BackendError::Decode("eof".into()).is_retryable());
        assert!(BackendError::Timeout(2.0).is_retryable());
        assert!(!status(404).is_dependency_failure());
        assert!(BackendError::Decode("eof".into()).is_dependency_failure());
    }

    #[test]
    fn test_unavailable_is_503() {
        let response = ApiError::Unavailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
