//! Model server - one inference backend.
//!
//! Owns a model cache with memory-aware eviction, a priority admission queue
//! with per-caller rate limiting, and an Ollama-compatible HTTP surface.

pub mod admission;
pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod memory;
pub mod resolve;
pub mod state;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the complete HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    api::router(state.clone())
        .layer(middleware::from_fn(logging::request_logger))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
