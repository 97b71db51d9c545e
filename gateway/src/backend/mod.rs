//! Backend node clients.
//!
//! Each backend class speaks a slightly different dialect of the Ollama API;
//! the router only sees the `Backend` trait.

mod accelerator;
mod general;

pub use accelerator::AcceleratorBackend;
pub use general::GeneralBackend;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use inference_common::{HealthReport, Priority, PRIORITY_HEADER};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{NodeConfig, NodeKind};
use crate::error::BackendError;

/// Longest error body kept from a failed backend response.
const ERROR_BODY_CHARS: usize = 500;

/// Result of a successful health probe.
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub latency: Duration,
    /// Self-declared saturation: every slot busy or requests queued.
    pub overloaded: bool,
    /// Full report, for nodes that publish one.
    pub report: Option<HealthReport>,
}

/// One generation request as sent to a node.
#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub category: Option<String>,
    pub max_tokens: u32,
    pub images: Option<Vec<String>>,
    pub priority: Priority,
}

impl GenerationCall {
    /// Prompt with the system instructions prepended, for single-prompt endpoints.
    pub fn full_prompt(&self) -> String {
        match self.system.as_deref().map(str::trim) {
            Some(system) if !system.is_empty() => format!("{}\n\n{}", system, self.prompt),
            _ => self.prompt.clone(),
        }
    }
}

/// A backend node's API.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> NodeKind;

    fn base_url(&self) -> &str;

    /// Check liveness and load.
    async fn probe_health(&self, timeout: Duration) -> Result<NodeHealth, BackendError>;

    /// Names of the models the node can serve.
    async fn list_models(&self, timeout: Duration) -> Result<Vec<String>, BackendError>;

    /// Run one non-streaming generation and return its text.
    async fn generate(&self, call: &GenerationCall, timeout: Duration) -> Result<String, BackendError>;
}

/// Create the client for a configured node.
pub fn build_backend(node: &NodeConfig, client: Client) -> Arc<dyn Backend> {
    match node.kind {
        NodeKind::Accelerator => Arc::new(AcceleratorBackend::new(&node.base_url, client)),
        NodeKind::General => Arc::new(GeneralBackend::new(&node.base_url, client)),
    }
}

/// JSON-over-HTTP plumbing shared by the backend clients.
#[derive(Debug, Clone)]
struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    fn new(base_url: &str, client: Client) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<(T, Duration), BackendError> {
        let request = self.client.get(self.url(path));
        self.send(request, timeout).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        priority: Priority,
        timeout: Duration,
    ) -> Result<T, BackendError> {
        let request = self
            .client
            .post(self.url(path))
            .header(PRIORITY_HEADER, priority.as_str())
            .json(body);
        self.send(request, timeout).await.map(|(value, _)| value)
    }

    /// Send and decode, returning the body and the time to the response headers.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<(T, Duration), BackendError> {
        let started = Instant::now();
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, timeout))?;
        let latency = started.elapsed();
        let response = check_status(response).await?;
        let body = response
            .json::<T>()
            .await
            .map_err(|e| BackendError::from_reqwest(e, timeout))?;
        Ok((body, latency))
    }
}

async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(ERROR_BODY_CHARS)
        .collect();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(system: Option<&str>) -> GenerationCall {
        GenerationCall {
            model: "fast".to_string(),
            prompt: "hello".to_string(),
            system: system.map(String::from),
            category: None,
            max_tokens: 10,
            images: None,
            priority: Priority::High,
        }
    }

    #[test]
    fn test_full_prompt() {
        assert_eq!(call(None).full_prompt(), "hello");
        assert_eq!(call(Some("  ")).full_prompt(), "hello");
        assert_eq!(call(Some("Be brief.")).full_prompt(), "Be brief.\n\nhello");
    }

    #[test]
    fn test_build_backend_by_kind() {
        let node = NodeConfig::new("n", "http://localhost:1/", "n", NodeKind::General);
        let backend = build_backend(&node, Client::new());
        assert_eq!(backend.kind(), NodeKind::General);
        assert_eq!(backend.base_url(), "http://localhost:1");
    }
}
