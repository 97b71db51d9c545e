//! Inference gateway - routes generation requests across local model servers.
//!
//! The [`Gateway`] façade classifies each prompt, orders the healthy nodes,
//! picks a model per node and fails over between nodes behind per-class
//! circuit breakers. Every outcome is recorded to the routing audit trail.

pub mod audit;
pub mod backend;
pub mod breaker;
pub mod cache;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod echo;
pub mod error;
pub mod facade;
pub mod health;
pub mod logging;
pub mod predictor;
pub mod registry;
pub mod retry;
pub mod router;
pub mod routes;

pub use config::Config;
pub use facade::{Completion, FallbackTier, Gateway, GatewayStatus, GenerateOptions};
pub use router::InferenceRouter;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the operational HTTP application.
pub fn app(gateway: Arc<Gateway>) -> Router {
    routes::router()
        .layer(middleware::from_fn(logging::request_logger))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}
