use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::{routing::post, Json, Router};
use inference_common::{Priority, PRIORITY_HEADER};
use serde::Deserialize;

use crate::error::ApiError;
use crate::facade::{Completion, GenerateOptions, Gateway};

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(flatten)]
    pub options: GenerateOptions,
}

/// POST /generate - route one prompt and return `{text, source}`.
///
/// A priority header overrides the body's `priority`.
async fn generate(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(body): Json<GenerateBody>,
) -> Result<Json<Completion>, ApiError> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::InvalidRequest("prompt is empty".to_string()));
    }

    let mut options = body.options;
    if let Some(priority) = headers
        .get(PRIORITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Priority>().ok())
    {
        options.priority = Some(priority);
    }

    gateway
        .generate(&body.prompt, &options)
        .await
        .map(Json)
        .ok_or(ApiError::Unavailable)
}

pub fn router() -> Router<Arc<Gateway>> {
    Router::new().route("/generate", post(generate))
}
