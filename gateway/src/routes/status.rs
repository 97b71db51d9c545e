use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Json, Router};

use crate::facade::{Gateway, GatewayStatus};

/// GET /status - node statistics, breaker states and cache counters.
///
/// Reports the last known state; it never probes the nodes.
async fn status(State(gateway): State<Arc<Gateway>>) -> Json<GatewayStatus> {
    Json(gateway.status())
}

pub fn router() -> Router<Arc<Gateway>> {
    Router::new().route("/status", get(status))
}
