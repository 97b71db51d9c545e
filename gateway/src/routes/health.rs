use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::facade::Gateway;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// GET /health - liveness of the gateway process itself.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router() -> Router<Arc<Gateway>> {
    Router::new().route("/health", get(health))
}
