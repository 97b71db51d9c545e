//! Ollama-compatible chat types (`/api/chat`).

use serde::{Deserialize, Serialize};

/// Default number of tokens generated when the caller does not say.
pub const DEFAULT_NUM_PREDICT: u32 = 512;

/// Chat request in the Ollama message-list format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Non-streaming chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    #[serde(default)]
    pub created_at: Option<String>,
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

impl ChatRequest {
    /// Flatten the message list into a single prompt.
    ///
    /// System messages and user messages are each joined by newlines, then the two
    /// groups are joined by a blank line. Assistant turns are dropped.
    pub fn to_prompt(&self) -> String {
        let system: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let user: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .collect();

        let mut parts = Vec::with_capacity(2);
        if !system.is_empty() {
            parts.push(system.join("\n"));
        }
        if !user.is_empty() {
            parts.push(user.join("\n"));
        }
        parts.join("\n\n")
    }

    pub fn max_tokens(&self) -> u32 {
        self.options
            .as_ref()
            .and_then(|o| o.num_predict)
            .unwrap_or(DEFAULT_NUM_PREDICT)
    }
}

impl ChatResponse {
    pub fn new(model: String, content: String) -> Self {
        Self {
            model,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            message: ChatMessage::new("assistant", content),
            done: true,
        }
    }
}
