use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use inference_common::PRIORITY_HEADER;
use std::time::Instant;

/// Middleware that logs every HTTP request at INFO, and failed ones at WARN.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let priority = request
        .headers()
        .get(PRIORITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let response = next.run(request).await;

    let status = response.status();
    let duration = start.elapsed();

    if status.is_server_error() || status == StatusCode::BAD_REQUEST {
        tracing::warn!(
            method = %method,
            path = %path,
            priority = %priority,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "HTTP request not served"
        );
    } else {
        tracing::info!(
            method = %method,
            path = %path,
            priority = %priority,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "HTTP request"
        );
    }

    response
}
