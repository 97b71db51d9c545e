//! Ollama inference engine implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::InferenceEngine;
use crate::error::{Error, Result};

/// Ollama inference engine.
///
/// Communicates with an Ollama daemon. Ollama keeps its own weights; loading
/// and unloading are expressed through `keep_alive`.
pub struct OllamaEngine {
    http_client: Client,
    base_url: String,
}

impl OllamaEngine {
    pub fn new(base_url: &str) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

// ============================================================================
// Ollama API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
}

/// Response from /api/tags endpoint.
#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModelInfo>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelInfo {
    name: String,
}

impl OllamaEngine {
    async fn post_generate(&self, request: &OllamaGenerateRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.base_url);
        self.http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Communication(e.to_string()))
    }
}

// ============================================================================
// InferenceEngine implementation
// ============================================================================

#[async_trait]
impl InferenceEngine for OllamaEngine {
    fn engine_type(&self) -> &'static str {
        "ollama"
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Communication(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Communication(format!(
                "Ollama returned {}",
                response.status()
            )));
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| Error::Communication(e.to_string()))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn load_model(&self, model_id: &str) -> Result<()> {
        // Ollama loads lazily; an empty prompt with keep_alive pins the model.
        let request = OllamaGenerateRequest {
            model: model_id,
            prompt: "",
            stream: false,
            keep_alive: Some("30m"),
            options: None,
        };

        let response = self.post_generate(&request).await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ModelNotFound(model_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("memory") {
                return Err(Error::ResourceExhausted(body));
            }
            return Err(Error::LoadFailed(format!(
                "Failed to load model {}: {}",
                model_id, body
            )));
        }

        tracing::info!("Model {} loaded/warmed", model_id);
        Ok(())
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        // Ollama unloads models by setting keep_alive to 0
        let request = OllamaGenerateRequest {
            model: model_id,
            prompt: "",
            stream: false,
            keep_alive: Some("0"),
            options: None,
        };

        let response = self.post_generate(&request).await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Communication(format!(
                "Failed to unload model {}: {}",
                model_id, body
            )));
        }

        tracing::info!("Model {} unloaded", model_id);
        Ok(())
    }

    async fn generate(&self, model_id: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = OllamaGenerateRequest {
            model: model_id,
            prompt,
            stream: false,
            keep_alive: None,
            options: Some(OllamaOptions {
                num_predict: max_tokens,
            }),
        };

        let response = self.post_generate(&request).await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InferenceFailed(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let body: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Communication(e.to_string()))?;
        Ok(body.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_list_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "phi3.5:3.8b"}, {"name": "moondream"}]
            })))
            .mount(&server)
            .await;

        let engine = OllamaEngine::new(&server.uri());
        let models = engine.list_models().await.unwrap();
        assert_eq!(models, vec!["phi3.5:3.8b", "moondream"]);
    }

    #[tokio::test]
    async fn test_generate_sends_num_predict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "fast",
                "options": {"num_predict": 32}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "Paris.",
                "done": true
            })))
            .mount(&server)
            .await;

        let engine = OllamaEngine::new(&format!("{}/", server.uri()));
        let text = engine.generate("fast", "Capital of France?", 32).await.unwrap();
        assert_eq!(text, "Paris.");
    }

    #[tokio::test]
    async fn test_load_unknown_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let engine = OllamaEngine::new(&server.uri());
        let err = engine.load_model("nope").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }
}
