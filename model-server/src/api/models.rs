//! Model listing endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use inference_common::{CachedModelInfo, CostProfile, TagsResponse, DEFAULT_NUM_PREDICT};
use serde::Serialize;

use crate::error::Result;
use crate::state::AppState;

/// Build the models router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tags", get(list_models))
        .route("/api/models/:name", get(model_status))
}

/// GET /api/tags - models the engine can serve.
async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<TagsResponse>> {
    let models = match state.refresh_models().await {
        Ok(models) => models,
        Err(e) => {
            tracing::warn!(
                "Failed to list models from {} engine: {}",
                state.engine().engine_type(),
                e
            );
            return Err(e);
        }
    };
    Ok(Json(TagsResponse::from_names(models)))
}

#[derive(Debug, Serialize)]
struct ModelStatus {
    name: String,
    resolved: String,
    known: bool,
    resident: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    loaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<CachedModelInfo>,
    profile: CostProfile,
    /// Time budget for a default-length generation.
    timeout_seconds: f64,
}

/// GET /api/models/:name - residency and cost profile of one model.
async fn model_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<ModelStatus> {
    let resolved = state.resolver.resolve(Some(&name), None);
    let cache = state.cache.model_info(&resolved);
    let measured = cache.as_ref().map(|info| info.load_time_seconds);

    Json(ModelStatus {
        known: state.resolver.is_known(&resolved),
        resident: cache.is_some(),
        loaded_at: state.cache.loaded_at(&resolved),
        profile: state.cost.profile(&resolved),
        timeout_seconds: state
            .cost
            .timeout_secs(&resolved, DEFAULT_NUM_PREDICT, measured),
        cache,
        name,
        resolved,
    })
}
