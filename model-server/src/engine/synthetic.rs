//! Simulated engine with cost-model shaped latencies.
//!
//! Loading sleeps for the model's estimated load time and generation for its
//! per-token inference time, both scaled by `time_scale`. Output is
//! deterministic and never repeats the prompt.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use inference_common::CostModel;

use super::InferenceEngine;
use crate::error::{Error, Result};

pub struct SyntheticEngine {
    models: Vec<String>,
    cost: CostModel,
    time_scale: f64,
    loaded: Mutex<HashSet<String>>,
}

impl SyntheticEngine {
    pub fn new(models: Vec<String>, cost: CostModel, time_scale: f64) -> Self {
        Self {
            models,
            cost,
            time_scale: time_scale.max(0.0),
            loaded: Mutex::new(HashSet::new()),
        }
    }

    fn scaled(&self, secs: f64) -> Duration {
        Duration::from_secs_f64((secs * self.time_scale).max(0.0))
    }

    fn is_loaded(&self, model_id: &str) -> Result<bool> {
        let loaded = self
            .loaded
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(loaded.contains(model_id))
    }
}

#[async_trait]
impl InferenceEngine for SyntheticEngine {
    fn engine_type(&self) -> &'static str {
        "synthetic"
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(self.models.clone())
    }

    async fn load_model(&self, model_id: &str) -> Result<()> {
        if !self.models.iter().any(|m| m == model_id) {
            return Err(Error::ModelNotFound(model_id.to_string()));
        }
        tokio::time::sleep(self.scaled(self.cost.profile(model_id).load_secs)).await;
        self.loaded
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .insert(model_id.to_string());
        Ok(())
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        self.loaded
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .remove(model_id);
        Ok(())
    }

    async fn generate(&self, model_id: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        if !self.is_loaded(model_id)? {
            return Err(Error::InferenceFailed(format!(
                "model {} is not loaded",
                model_id
            )));
        }
        let per_1k = self.cost.profile(model_id).inference_secs_per_1k;
        tokio::time::sleep(self.scaled(max_tokens as f64 / 1000.0 * per_1k)).await;
        Ok(format!(
            "[{}] completed {} tokens for a {}-character prompt.",
            model_id,
            max_tokens,
            prompt.chars().count()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_common::CostProfile;

    fn engine() -> SyntheticEngine {
        let cost = CostModel::new().with_profile("fast", CostProfile::new(1.0, 1.0, 1.0));
        SyntheticEngine::new(vec!["fast".to_string()], cost, 1.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_takes_estimated_time() {
        let engine = engine();
        let start = tokio::time::Instant::now();
        engine.load_model("fast").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_requires_load() {
        let engine = engine();
        assert!(engine.generate("fast", "hi", 10).await.is_err());
        engine.load_model("fast").await.unwrap();
        let text = engine.generate("fast", "hi", 10).await.unwrap();
        assert!(!text.is_empty());
        assert_ne!(text, "hi");
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let err = engine().load_model("huge").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }
}
