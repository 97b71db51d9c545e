//! Ollama-compatible HTTP API.
//!
//! Read-only routes (`/`, `/health`, `/api/tags`, `/api/models/:name`,
//! `/queue/stats`) never touch the rate limiter or the admission queue, so a
//! long generation cannot starve liveness checks.

pub mod chat;
pub mod generate;
pub mod health;
pub mod models;
pub mod queue;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use inference_common::{Priority, PRIORITY_HEADER};

use crate::state::AppState;

/// Header naming the caller for rate limiting.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let generation = Router::new()
        .merge(generate::router())
        .merge(chat::router())
        .route_layer(middleware::from_fn_with_state(state, rate_limit));

    Router::new()
        .merge(health::router())
        .merge(models::router())
        .merge(queue::router())
        .merge(generation)
}

/// Identify the caller: explicit client id, else peer address, else `unknown`.
pub fn caller_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn request_priority(headers: &HeaderMap) -> Priority {
    Priority::from_header(headers.get(PRIORITY_HEADER).and_then(|v| v.to_str().ok()))
}

/// Reject callers over their sliding-window budget before they queue.
async fn rate_limit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let caller = caller_id(request.headers(), peer);

    if let Err(e) = state.limiter.check(&caller) {
        return e.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_caller_id_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_ID_HEADER, HeaderValue::from_static("orchestrator"));
        let peer: SocketAddr = "10.0.0.7:5000".parse().unwrap();
        assert_eq!(caller_id(&headers, Some(peer)), "orchestrator");
    }

    #[test]
    fn test_caller_id_falls_back() {
        let peer: SocketAddr = "10.0.0.7:5000".parse().unwrap();
        assert_eq!(caller_id(&HeaderMap::new(), Some(peer)), "10.0.0.7");
        assert_eq!(caller_id(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_request_priority() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_priority(&headers), Priority::Medium);
        headers.insert(PRIORITY_HEADER, HeaderValue::from_static("HIGH"));
        assert_eq!(request_priority(&headers), Priority::High);
    }
}
