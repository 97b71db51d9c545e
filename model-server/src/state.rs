//! Shared application state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use inference_common::CostModel;
use tokio::time::Duration;

use crate::admission::{AdmissionQueue, SlidingWindowLimiter};
use crate::cache::ModelCache;
use crate::config::{Config, EngineKind};
use crate::engine::{InferenceEngine, OllamaEngine, SyntheticEngine};
use crate::memory::MemoryProbe;
use crate::resolve::ModelResolver;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub cost: CostModel,
    pub cache: ModelCache,
    pub admission: AdmissionQueue,
    pub limiter: SlidingWindowLimiter,
    pub resolver: ModelResolver,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<dyn InferenceEngine>, memory: Arc<dyn MemoryProbe>) -> Self {
        let cost = config.cost_model();
        let cache = ModelCache::new(engine, memory, cost.clone(), config.cache.clone());
        let admission = AdmissionQueue::new(
            config.admission.max_concurrent,
            config.admission.max_queued,
            cost.max_queue_wait(),
        );
        let limiter = SlidingWindowLimiter::new(
            Duration::from_secs(config.admission.rate_limit_window_secs),
            config.admission.rate_limit_max,
        );
        let resolver = ModelResolver::new(
            config.models.aliases.clone(),
            config.models.categories.clone(),
        );

        Self {
            config,
            cost,
            cache,
            admission,
            limiter,
            resolver,
            started_at: Utc::now(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        self.cache.engine()
    }

    /// Ask the engine which models it serves and remember them for resolution.
    pub async fn refresh_models(&self) -> crate::error::Result<Vec<String>> {
        let models = self.engine().list_models().await?;
        self.resolver.set_known(models.iter().cloned());
        Ok(models)
    }
}

/// Build the engine selected by configuration.
pub fn build_engine(config: &Config) -> Arc<dyn InferenceEngine> {
    match config.engine.kind {
        EngineKind::Ollama => Arc::new(OllamaEngine::new(&config.engine.base_url)),
        EngineKind::Synthetic => Arc::new(SyntheticEngine::new(
            config.engine.synthetic_models.clone(),
            config.cost_model(),
            config.engine.time_scale,
        )),
    }
}
