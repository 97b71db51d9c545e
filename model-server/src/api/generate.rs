//! Generation endpoint and the pipeline shared with `/api/chat`.
//!
//! Every generation runs the same steps: take an admission slot, lease the
//! model from the cache (loading it if needed), then generate under the
//! model's time budget. Both the slot and the lease are released when the
//! response (or the streamed body) is dropped.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use inference_common::{GenerateChunk, GenerateRequest, GenerateResponse, Priority};
use serde_json::{json, Value};
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use super::request_priority;
use crate::admission::AdmissionPermit;
use crate::cache::GenerationStream;
use crate::error::{Error, Result};
use crate::state::AppState;

/// Build the generate router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/generate", post(generate))
}

/// POST /api/generate
async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> Result<Response> {
    if request.prompt.trim().is_empty() {
        return Err(Error::InvalidRequest("prompt is empty".to_string()));
    }
    if request.max_tokens == 0 {
        return Err(Error::InvalidRequest("max_tokens must be positive".to_string()));
    }

    let priority = request_priority(&headers);
    let key = state
        .resolver
        .resolve(request.model.as_deref(), request.category.as_deref());
    info!(
        model = %key,
        priority = %priority,
        max_tokens = request.max_tokens,
        stream = request.stream,
        "Generate request"
    );

    if request.stream {
        let started = start_stream(&state, priority, &key, &request.prompt, request.max_tokens).await?;
        let model = key.clone();
        return Ok(ndjson(started, move |piece| match piece {
            Some(text) => serde_json::to_value(GenerateChunk::partial(&model, text)),
            None => serde_json::to_value(GenerateChunk::last(&model)),
        }
        .unwrap_or(Value::Null)));
    }

    let text = run(&state, priority, &key, &request.prompt, request.max_tokens).await?;
    Ok(Json(GenerateResponse {
        model: key,
        response: text,
        done: true,
    })
    .into_response())
}

/// Generate a full completion through admission and the model cache.
pub(crate) async fn run(
    state: &AppState,
    priority: Priority,
    key: &str,
    prompt: &str,
    max_tokens: u32,
) -> Result<String> {
    let started = Instant::now();
    let _permit = state.admission.admit(priority, Some(key)).await?;
    let lease = state.cache.acquire(key).await?;
    let text = lease.generate(prompt, max_tokens).await?;
    info!(
        model = %key,
        latency_ms = started.elapsed().as_millis() as u64,
        chars = text.len(),
        "Generation complete"
    );
    Ok(text)
}

/// A streamed generation that has been admitted and started.
pub(crate) struct StartedStream {
    pieces: GenerationStream,
    permit: AdmissionPermit,
    deadline: Instant,
    limit: Duration,
}

pub(crate) async fn start_stream(
    state: &AppState,
    priority: Priority,
    key: &str,
    prompt: &str,
    max_tokens: u32,
) -> Result<StartedStream> {
    let permit = state.admission.admit(priority, Some(key)).await?;
    let lease = state.cache.acquire(key).await?;
    let limit = lease.timeout(max_tokens);
    let deadline = Instant::now() + limit;
    let pieces = lease.stream(prompt, max_tokens).await?;
    Ok(StartedStream {
        pieces,
        permit,
        deadline,
        limit,
    })
}

struct BodyState<F> {
    pieces: Option<GenerationStream>,
    permit: Option<AdmissionPermit>,
    deadline: Instant,
    limit: Duration,
    render: F,
}

impl<F> BodyState<F> {
    fn finish(&mut self) {
        self.pieces = None;
        self.permit = None;
    }
}

/// Newline-delimited JSON response. `render(Some(text))` frames a piece and
/// `render(None)` the closing `done` line.
pub(crate) fn ndjson<F>(started: StartedStream, render: F) -> Response
where
    F: Fn(Option<String>) -> Value + Send + 'static,
{
    let initial = BodyState {
        pieces: Some(started.pieces),
        permit: Some(started.permit),
        deadline: started.deadline,
        limit: started.limit,
        render,
    };

    let lines = stream::unfold(initial, |mut body| async move {
        let pieces = body.pieces.as_mut()?;
        let model = pieces.model().to_string();
        let line = match tokio::time::timeout_at(body.deadline, pieces.next()).await {
            Ok(Some(Ok(text))) => (body.render)(Some(text)),
            Ok(None) => {
                body.finish();
                (body.render)(None)
            }
            Ok(Some(Err(e))) => {
                warn!(model = %model, "Stream failed: {}", e);
                body.finish();
                error_line(&model, &e)
            }
            Err(_) => {
                let e = Error::GenerationTimeout {
                    model: model.clone(),
                    limit_secs: body.limit.as_secs_f64(),
                };
                warn!(model = %model, "Stream exceeded its time budget");
                body.finish();
                error_line(&model, &e)
            }
        };
        Some((Ok::<_, Infallible>(format!("{}\n", line)), body))
    });

    let mut response = Body::from_stream(lines).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    response
}

fn error_line(model: &str, error: &Error) -> Value {
    json!({
        "model": model,
        "error": error.to_string(),
        "done": true
    })
}
