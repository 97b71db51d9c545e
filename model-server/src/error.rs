//! Error types for the model server.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Retry hint sent with `QueueFull` rejections.
pub const QUEUE_FULL_RETRY_SECS: u64 = 10;

/// Error types for model serving operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Load failed: {0}")]
    LoadFailed(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient memory: {0}")]
    ResourceExhausted(String),

    #[error("Server overloaded, retry after {retry_after_secs}s: {message}")]
    Overloaded {
        message: String,
        retry_after_secs: u64,
    },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },

    #[error("Queue is full ({0} waiting)")]
    QueueFull(usize),

    #[error("Model {0} did not finish loading in time")]
    LoadWaitTimeout(String),

    #[error("Generations of other models did not finish in time: {0}")]
    SerializationTimeout(String),

    #[error("Generation timeout (limit {limit_secs:.0}s for {model})")]
    GenerationTimeout { model: String, limit_secs: f64 },

    #[error("Engine communication error: {0}")]
    Communication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            Error::ModelNotFound(_) => (StatusCode::NOT_FOUND, "model_not_found"),
            Error::LoadFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "load_failed"),
            Error::InferenceFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "inference_failed"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::ResourceExhausted(_) => (StatusCode::SERVICE_UNAVAILABLE, "resource_exhausted"),
            Error::Overloaded { .. } => (StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
            Error::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            Error::QueueFull(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
            Error::LoadWaitTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "load_wait_timeout"),
            Error::SerializationTimeout(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "serialization_timeout")
            }
            Error::GenerationTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "generation_timeout"),
            Error::Communication(_) => (StatusCode::BAD_GATEWAY, "communication_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Error::Overloaded {
                retry_after_secs, ..
            }
            | Error::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            Error::QueueFull(_) => Some(QUEUE_FULL_RETRY_SECS),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = Error::RateLimited {
            message: "150 per 90s".to_string(),
            retry_after_secs: 12,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
    }

    #[test]
    fn test_resource_exhausted_is_unavailable() {
        let response = Error::ResourceExhausted("97.0% used".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
