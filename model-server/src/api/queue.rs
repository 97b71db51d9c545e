//! Admission queue statistics.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::admission::QueueStats;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/queue/stats", get(queue_stats))
}

/// GET /queue/stats
async fn queue_stats(State(state): State<Arc<AppState>>) -> Json<QueueStats> {
    Json(state.admission.stats())
}
