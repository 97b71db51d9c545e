//! Backend HTTP payloads shared by the model server and the gateway.
//!
//! Field names are serialised in snake_case. Inputs also accept the camelCase
//! spelling so older callers keep working.

use serde::{Deserialize, Serialize};

use crate::chat::DEFAULT_NUM_PREDICT;

// ============================================================================
// /api/generate
// ============================================================================

/// Request body for `POST /api/generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default = "default_max_tokens", alias = "maxTokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: Some(model.into()),
            prompt: prompt.into(),
            category: None,
            max_tokens,
            temperature: None,
            stream: false,
            images: None,
        }
    }
}

/// Response body for a non-streaming generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub model: String,
    pub response: String,
    pub done: bool,
}

/// One line of a streamed (NDJSON) generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub response: String,
    pub done: bool,
}

impl GenerateChunk {
    pub fn partial(model: &str, text: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            response: text.into(),
            done: false,
        }
    }

    pub fn last(model: &str) -> Self {
        Self {
            model: model.to_string(),
            response: String::new(),
            done: true,
        }
    }
}

// ============================================================================
// /api/tags
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<TagModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagModel {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl TagsResponse {
    pub fn from_names<I: IntoIterator<Item = String>>(names: I) -> Self {
        Self {
            models: names
                .into_iter()
                .map(|name| TagModel {
                    model: Some(name.clone()),
                    name,
                })
                .collect(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }
}

// ============================================================================
// /health
// ============================================================================

/// Liveness and load report of one backend process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default, alias = "activeRequests")]
    pub active_requests: usize,
    #[serde(default, alias = "maxConcurrent")]
    pub max_concurrent: usize,
    #[serde(default, alias = "queuedRequests")]
    pub queued_requests: usize,
    #[serde(default)]
    pub memory: MemoryReport,
    #[serde(default, alias = "cachedModels")]
    pub cached_models: Vec<CachedModelInfo>,
    #[serde(default, alias = "availableModels")]
    pub available_models: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryReport {
    /// Percentage of memory in use (0-100).
    #[serde(default, alias = "usedPercent")]
    pub used_percent: f64,
    #[serde(default, alias = "availableGB", alias = "availableGb")]
    pub available_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedModelInfo {
    pub name: String,
    #[serde(default, alias = "useCount")]
    pub use_count: u64,
    #[serde(default, alias = "lastUsed")]
    pub last_used: Option<String>,
    #[serde(default, alias = "loadTimeSeconds")]
    pub load_time_seconds: f64,
    #[serde(default, alias = "activeRequests")]
    pub active_requests: usize,
}

impl HealthReport {
    /// Whether the backend declares itself saturated: every admission slot taken
    /// or anything waiting in its queue.
    pub fn is_overloaded(&self) -> bool {
        (self.max_concurrent > 0 && self.active_requests >= self.max_concurrent)
            || self.queued_requests > 0
    }
}

fn default_max_tokens() -> u32 {
    DEFAULT_NUM_PREDICT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_defaults() {
        let req: GenerateRequest = serde_json::from_str(r#"{"prompt": "hi"}"#).unwrap();
        assert_eq!(req.prompt, "hi");
        assert!(req.model.is_none());
        assert_eq!(req.max_tokens, 512);
        assert!(!req.stream);
    }

    #[test]
    fn test_generate_request_accepts_camel_case() {
        let req: GenerateRequest =
            serde_json::from_str(r#"{"model": "fast", "prompt": "hi", "maxTokens": 10}"#).unwrap();
        assert_eq!(req.max_tokens, 10);
        assert_eq!(req.model.as_deref(), Some("fast"));
    }

    #[test]
    fn test_health_report_accepts_camel_case() {
        let json = r#"{
            "status": "ok",
            "activeRequests": 2,
            "maxConcurrent": 2,
            "memory": {"usedPercent": 41.5, "availableGB": 12.0},
            "cachedModels": [{"name": "fast", "useCount": 3, "lastUsed": null}]
        }"#;
        let report: HealthReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.active_requests, 2);
        assert_eq!(report.memory.available_gb, 12.0);
        assert_eq!(report.cached_models[0].use_count, 3);
        assert!(report.is_overloaded());
    }

    #[test]
    fn test_overload_from_queue_depth() {
        let report = HealthReport {
            status: "ok".to_string(),
            active_requests: 1,
            max_concurrent: 5,
            queued_requests: 1,
            memory: MemoryReport::default(),
            cached_models: vec![],
            available_models: vec![],
        };
        assert!(report.is_overloaded());
    }

    #[test]
    fn test_stream_terminator() {
        let line = serde_json::to_string(&GenerateChunk::last("fast")).unwrap();
        assert_eq!(line, r#"{"model":"fast","response":"","done":true}"#);
    }

    #[test]
    fn test_tags_from_names() {
        let tags = TagsResponse::from_names(vec!["fast".to_string(), "coding".to_string()]);
        assert_eq!(tags.names(), vec!["fast", "coding"]);
    }
}
