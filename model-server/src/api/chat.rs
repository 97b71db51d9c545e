//! Chat endpoint (Ollama-compatible).

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use inference_common::{ChatMessage, ChatRequest, ChatResponse};
use serde_json::json;

use super::generate::{ndjson, run, start_stream};
use super::request_priority;
use crate::error::{Error, Result};
use crate::state::AppState;

/// Build the chat router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/chat", post(chat))
}

/// POST /api/chat - message-list variant of `/api/generate`.
async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    let prompt = request.to_prompt();
    if prompt.trim().is_empty() {
        return Err(Error::InvalidRequest(
            "no system or user content in messages".to_string(),
        ));
    }

    let priority = request_priority(&headers);
    let max_tokens = request.max_tokens();
    let key = state.resolver.resolve(Some(&request.model), None);
    tracing::debug!(
        "Chat request for {} (resolved {}), {} messages",
        request.model,
        key,
        request.messages.len()
    );

    if request.stream {
        let started = start_stream(&state, priority, &key, &prompt, max_tokens).await?;
        let model = request.model.clone();
        return Ok(ndjson(started, move |piece| {
            let done = piece.is_none();
            json!({
                "model": model,
                "created_at": Utc::now().to_rfc3339(),
                "message": ChatMessage::new("assistant", piece.unwrap_or_default()),
                "done": done
            })
        }));
    }

    let text = run(&state, priority, &key, &prompt, max_tokens).await?;
    Ok(Json(ChatResponse::new(request.model, text)).into_response())
}
