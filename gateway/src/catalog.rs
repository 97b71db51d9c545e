//! Per-node model catalogs and model selection.

use std::collections::HashMap;
use std::sync::Mutex;

use inference_common::Category;
use tokio::time::{Duration, Instant};

use crate::backend::Backend;
use crate::config::NodeKind;

/// Preferred models per category on accelerator nodes, best first.
fn accelerator_priorities(slot: Category) -> &'static [&'static str] {
    match slot {
        Category::Coding => &["qwen2.5-coder:32b", "phi3.5:3.8b", "qwen2.5:3b"],
        Category::Reasoning => &["deepseek-r1-distill-llama:70b", "phi3.5:3.8b", "qwen2.5:3b"],
        _ => &["phi3.5:3.8b", "qwen2.5:3b", "tinyllama:1.1b-chat"],
    }
}

/// Preferred models per category on general nodes, best first.
fn general_priorities(slot: Category) -> &'static [&'static str] {
    match slot {
        Category::Fast => &["deepseek-r1:14b", "qwen2.5-coder:32b", "tinyllama:1.1b-chat"],
        Category::General => &["qwen2.5-coder:32b", "glm-4.7-flash:q8_0", "deepseek-r1:14b"],
        Category::Coding => &["qwen2.5-coder:32b", "qwq:32b", "qwen3-coder:30b"],
        Category::Reasoning => &["deepseek-r1:32b", "qwq:32b", "glm-4.7-flash:q8_0"],
        Category::Vision => &["moondream:latest", "llava:7b"],
        Category::Default => &["qwen2.5-coder:32b", "deepseek-r1:32b", "qwq:32b"],
    }
}

/// Model used when the live catalog has none of the preferred models.
pub fn static_model(kind: NodeKind, slot: Category) -> &'static str {
    match (kind, slot) {
        (NodeKind::Accelerator, Category::Coding) => "qwen2.5-coder:32b",
        (NodeKind::Accelerator, Category::Reasoning) => "deepseek-r1-distill-llama:70b",
        (NodeKind::General, Category::Coding | Category::Reasoning) => "glm-4.7-flash:q8_0",
        (_, Category::Vision) => "moondream",
        _ => "phi3.5:3.8b",
    }
}

/// Choose a model for `slot` on a node of `kind`.
///
/// The first preferred model present in `live` wins. A model named after the
/// slot itself also matches, for model servers that expose tier names. With
/// no match the static table decides.
pub fn select_model(kind: NodeKind, slot: Category, live: &[String]) -> String {
    let priorities = match kind {
        NodeKind::Accelerator => accelerator_priorities(slot),
        NodeKind::General => general_priorities(slot),
    };
    let available: HashMap<String, &String> = live
        .iter()
        .map(|name| (name.trim().to_lowercase(), name))
        .collect();

    priorities
        .iter()
        .copied()
        .chain(std::iter::once(slot.as_str()))
        .find_map(|wanted| available.get(wanted).map(|name| name.trim().to_string()))
        .unwrap_or_else(|| static_model(kind, slot).to_string())
}

/// Live model lists per node, each reused for the catalog TTL.
pub struct ModelCatalog {
    ttl: Duration,
    timeout: Duration,
    entries: Mutex<HashMap<String, (Instant, Vec<String>)>>,
}

impl ModelCatalog {
    pub fn new(ttl: Duration, timeout: Duration) -> Self {
        Self {
            ttl,
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, routing_key: &str) -> Option<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(routing_key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, models)| models.clone())
    }

    /// Models currently available on `backend`. Empty when the node cannot be
    /// listed; empty lists are not cached.
    pub async fn models(&self, routing_key: &str, backend: &dyn Backend) -> Vec<String> {
        if let Some(models) = self.cached(routing_key) {
            return models;
        }
        match backend.list_models(self.timeout).await {
            Ok(models) if !models.is_empty() => {
                tracing::debug!(node = %routing_key, count = models.len(), "Model catalog refreshed");
                self.entries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(routing_key.to_string(), (Instant::now(), models.clone()));
                models
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::debug!(node = %routing_key, error = %e, "Model catalog unavailable");
                Vec::new()
            }
        }
    }

    /// Model to request from `backend` for `slot`.
    pub async fn model_for(
        &self,
        routing_key: &str,
        kind: NodeKind,
        backend: &dyn Backend,
        slot: Category,
    ) -> String {
        let live = self.models(routing_key, backend).await;
        select_model(kind, slot, &live)
    }
}
