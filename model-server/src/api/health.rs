//! Health endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use inference_common::{HealthReport, MemoryReport};

use crate::state::AppState;

/// Build the health router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
}

/// GET /health - load, memory and resident models.
///
/// Reads only in-process state, so it answers while generations are running.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(report(&state))
}

pub fn report(state: &AppState) -> HealthReport {
    let memory = state.cache.memory();
    let status = if memory.used_percent > state.config.cache.memory_critical_percent {
        "degraded"
    } else {
        "healthy"
    };

    HealthReport {
        status: status.to_string(),
        active_requests: state.admission.active(),
        max_concurrent: state.config.admission.max_concurrent,
        queued_requests: state.admission.queued(),
        memory: MemoryReport {
            used_percent: memory.used_percent,
            available_gb: memory.available_gb,
        },
        cached_models: state.cache.snapshot(),
        available_models: state.resolver.known_models(),
    }
}
