//! Operational HTTP surface.

pub mod generate;
pub mod health;
pub mod status;

use std::sync::Arc;

use axum::Router;

use crate::facade::Gateway;

/// Build the API router.
pub fn router() -> Router<Arc<Gateway>> {
    Router::new()
        .merge(health::router())
        .merge(status::router())
        .merge(generate::router())
}
