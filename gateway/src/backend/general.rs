use std::time::Duration;

use async_trait::async_trait;
use inference_common::{ChatResponse, TagsResponse};
use reqwest::Client;
use serde::Serialize;

use super::{Backend, GenerationCall, HttpApi, NodeHealth};
use crate::config::NodeKind;
use crate::error::BackendError;

/// Client for a plain Ollama daemon.
pub struct GeneralBackend {
    api: HttpApi,
}

/// Ollama chat request format.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
}

impl GeneralBackend {
    pub fn new(base_url: &str, client: Client) -> Self {
        Self {
            api: HttpApi::new(base_url, client),
        }
    }
}

#[async_trait]
impl Backend for GeneralBackend {
    fn kind(&self) -> NodeKind {
        NodeKind::General
    }

    fn base_url(&self) -> &str {
        &self.api.base_url
    }

    /// Ollama has no `/health`; fall back to listing models.
    async fn probe_health(&self, timeout: Duration) -> Result<NodeHealth, BackendError> {
        match self.api.get_json::<serde_json::Value>("/health", timeout).await {
            Ok((_, latency)) => Ok(NodeHealth {
                latency,
                overloaded: false,
                report: None,
            }),
            Err(_) => {
                let (_, latency) = self.api.get_json::<TagsResponse>("/api/tags", timeout).await?;
                Ok(NodeHealth {
                    latency,
                    overloaded: false,
                    report: None,
                })
            }
        }
    }

    async fn list_models(&self, timeout: Duration) -> Result<Vec<String>, BackendError> {
        let (tags, _) = self.api.get_json::<TagsResponse>("/api/tags", timeout).await?;
        Ok(tags.names())
    }

    async fn generate(&self, call: &GenerationCall, timeout: Duration) -> Result<String, BackendError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = call.system.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(OllamaMessage {
                role: "system",
                content: system,
                images: None,
            });
        }
        messages.push(OllamaMessage {
            role: "user",
            content: &call.prompt,
            images: call.images.as_deref(),
        });

        let request = OllamaChatRequest {
            model: &call.model,
            messages,
            stream: false,
            options: OllamaOptions {
                num_predict: call.max_tokens,
            },
        };

        tracing::debug!("Sending chat to {}/api/chat", self.api.base_url);

        let response: ChatResponse = self
            .api
            .post_json("/api/chat", &request, call.priority, timeout)
            .await?;
        Ok(response.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_common::Priority;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_probe_falls_back_to_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "phi3.5:3.8b"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = GeneralBackend::new(&server.uri(), Client::new());
        let health = backend.probe_health(Duration::from_secs(2)).await.unwrap();
        assert!(!health.overloaded);
        assert!(health.report.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_probe() {
        let backend = GeneralBackend::new("http://127.0.0.1:9", Client::new());
        assert!(backend.probe_health(Duration::from_secs(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_generate_uses_chat_with_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "moondream:latest",
                "stream": false,
                "messages": [
                    {"role": "system", "content": "Describe tersely."},
                    {"role": "user", "content": "what is this?", "images": ["aGk="]}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "moondream:latest",
                "message": {"role": "assistant", "content": "A cat."},
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = GeneralBackend::new(&server.uri(), Client::new());
        let call = GenerationCall {
            model: "moondream:latest".to_string(),
            prompt: "what is this?".to_string(),
            system: Some("Describe tersely.".to_string()),
            category: None,
            max_tokens: 64,
            images: Some(vec!["aGk=".to_string()]),
            priority: Priority::High,
        };
        assert_eq!(
            backend.generate(&call, Duration::from_secs(5)).await.unwrap(),
            "A cat."
        );
    }
}
