//! Gateway façade: the interface consumed by callers outside the routing core.

use std::sync::Arc;

use async_trait::async_trait;
use inference_common::Priority;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::audit::AuditSink;
use crate::breaker::{BreakerError, BreakerSnapshot, Breakers};
use crate::cache::CacheStats;
use crate::config::Config;
use crate::error::BackendError;
use crate::predictor::RoutePredictor;
use crate::registry::{NodeRegistry, NodeSnapshot};
use crate::router::InferenceRouter;

/// Per-request hints. Everything is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateOptions {
    pub category: Option<String>,
    /// Exact model to request, bypassing catalog selection.
    pub model: Option<String>,
    /// Base64-encoded images.
    pub images: Option<Vec<String>>,
    pub priority: Option<Priority>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
}

/// Generated text and the routing key of the backend that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub text: String,
    pub source: String,
}

/// The tier callers escalate to when no local node can serve a request.
#[async_trait]
pub trait FallbackTier: Send + Sync {
    /// Reported as the completion source.
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String, BackendError>;
}

/// Operational view reported on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub nodes: Vec<NodeSnapshot>,
    pub breakers: Vec<BreakerSnapshot>,
    pub cache: CacheStats,
    pub audit_dropped: u64,
}

pub struct Gateway {
    router: InferenceRouter,
}

impl Gateway {
    pub fn new(router: InferenceRouter) -> Self {
        Self { router }
    }

    /// Build the node clients from `config`, sharing one HTTP client.
    pub fn from_config(config: &Config, breakers: Breakers, audit: AuditSink) -> Self {
        let registry = Arc::new(NodeRegistry::from_config(&config.nodes, Client::new()));
        Self::new(InferenceRouter::new(config, registry, breakers, audit))
    }

    pub fn with_predictor(self, predictor: Arc<dyn RoutePredictor>) -> Self {
        Self::new(self.router.with_predictor(predictor))
    }

    pub fn router(&self) -> &InferenceRouter {
        &self.router
    }

    /// Generate text for `prompt` on a local node.
    ///
    /// `None` means no local node could serve the request; callers should
    /// escalate to their next tier rather than treat it as an error.
    pub async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Option<Completion> {
        self.router.route(prompt, opts).await
    }

    /// Like [`generate`](Self::generate), escalating to `fallback` through the
    /// cloud breaker when no local node answers.
    pub async fn generate_or_fallback(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        fallback: &dyn FallbackTier,
    ) -> Option<Completion> {
        if let Some(completion) = self.generate(prompt, opts).await {
            return Some(completion);
        }

        let result = self
            .router
            .breakers()
            .cloud
            .call(|| fallback.generate(prompt, opts))
            .await;

        match result {
            Ok(text) if !text.trim().is_empty() => Some(Completion {
                text,
                source: fallback.name().to_string(),
            }),
            Ok(_) => {
                tracing::warn!(tier = fallback.name(), "Fallback tier returned empty text");
                None
            }
            Err(BreakerError::Open { remaining, .. }) => {
                tracing::warn!(
                    tier = fallback.name(),
                    retry_in_secs = remaining.as_secs(),
                    "Fallback circuit open"
                );
                None
            }
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(tier = fallback.name(), error = %e, "Fallback tier failed");
                None
            }
        }
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            nodes: self.router.registry().snapshots(),
            breakers: self.router.breakers().snapshots(),
            cache: self.router.cache().stats(),
            audit_dropped: self.router.audit().dropped(),
        }
    }
}
