//! Inference engine abstraction layer.
//!
//! This module defines the `InferenceEngine` trait that abstracts the runtime
//! actually holding model weights. The model cache decides *when* models are
//! loaded and evicted; engines only perform the work.

mod ollama;
mod synthetic;

pub use ollama::OllamaEngine;
pub use synthetic::SyntheticEngine;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::error::Result;

/// Primary trait for inference engines.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Unique identifier for this engine type (e.g., "ollama", "synthetic").
    fn engine_type(&self) -> &'static str;

    /// List the model keys this engine can load.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Load a model into memory.
    async fn load_model(&self, model_id: &str) -> Result<()>;

    /// Release a model's memory.
    async fn unload_model(&self, model_id: &str) -> Result<()>;

    /// Generate a full completion.
    async fn generate(&self, model_id: &str, prompt: &str, max_tokens: u32) -> Result<String>;

    /// Generate a completion as a stream of text pieces.
    ///
    /// Engines without native streaming generate the whole text and replay it
    /// word by word.
    async fn generate_stream(
        &self,
        model_id: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let text = self.generate(model_id, prompt, max_tokens).await?;
        Ok(stream::iter(split_chunks(&text).into_iter().map(Ok)).boxed())
    }
}

/// Split text into word-sized pieces that concatenate back to the input.
pub fn split_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunks_concatenates_back() {
        let text = "Hello there,  general Kenobi";
        let chunks = split_chunks(text);
        assert_eq!(chunks, vec!["Hello ", "there, ", " ", "general ", "Kenobi"]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_chunks_empty() {
        assert!(split_chunks("").is_empty());
    }
}
