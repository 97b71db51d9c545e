use std::time::Duration;

use async_trait::async_trait;
use inference_common::{GenerateRequest, GenerateResponse, HealthReport, TagsResponse};
use reqwest::Client;

use super::{Backend, GenerationCall, HttpApi, NodeHealth};
use crate::config::NodeKind;
use crate::error::BackendError;

/// Client for a model server: admission-controlled, reports its own load.
pub struct AcceleratorBackend {
    api: HttpApi,
}

impl AcceleratorBackend {
    pub fn new(base_url: &str, client: Client) -> Self {
        Self {
            api: HttpApi::new(base_url, client),
        }
    }
}

#[async_trait]
impl Backend for AcceleratorBackend {
    fn kind(&self) -> NodeKind {
        NodeKind::Accelerator
    }

    fn base_url(&self) -> &str {
        &self.api.base_url
    }

    async fn probe_health(&self, timeout: Duration) -> Result<NodeHealth, BackendError> {
        let (report, latency) = self.api.get_json::<HealthReport>("/health", timeout).await?;
        Ok(NodeHealth {
            latency,
            overloaded: report.is_overloaded(),
            report: Some(report),
        })
    }

    async fn list_models(&self, timeout: Duration) -> Result<Vec<String>, BackendError> {
        let (tags, _) = self.api.get_json::<TagsResponse>("/api/tags", timeout).await?;
        Ok(tags.names())
    }

    async fn generate(&self, call: &GenerationCall, timeout: Duration) -> Result<String, BackendError> {
        let request = GenerateRequest {
            model: Some(call.model.clone()),
            prompt: call.full_prompt(),
            category: call.category.clone(),
            max_tokens: call.max_tokens,
            temperature: None,
            stream: false,
            images: call.images.clone(),
        };

        tracing::debug!("Sending generation to {}/api/generate", self.api.base_url);

        let response: GenerateResponse = self
            .api
            .post_json("/api/generate", &request, call.priority, timeout)
            .await?;
        Ok(response.response)
    }
}
