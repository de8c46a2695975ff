//! Model backend trait and message types.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Human,
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a human message.
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One normalized increment of generated output.
///
/// Every vendor's delta shape is mapped into this at the adapter
/// boundary; nothing past the adapter branches on vendor payloads.
#[derive(Debug, Clone, Default)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
}

impl ChatDelta {
    pub fn is_empty(&self) -> bool {
        self.content.as_deref().is_none_or(str::is_empty)
            && self.reasoning_content.as_deref().is_none_or(str::is_empty)
    }
}

/// Generation parameters forwarded to the backend.
#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Token budget for extended reasoning, where the backend supports it.
    pub reasoning_budget: Option<u32>,
}

/// Token accounting from a non-streaming completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Result of a non-streaming completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

/// Ordered sequence of deltas ending in completion or an error item.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ChatDelta, LlmError>> + Send>>;

/// Capability interface for a streaming chat model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Backend identifier, e.g. "openai" or "claude".
    fn backend(&self) -> &str;

    /// Model name within the backend.
    fn model_name(&self) -> &str;

    /// Stream a completion as incremental deltas.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        config: &GenerationConfig,
    ) -> Result<DeltaStream, LlmError>;

    /// Run a complete, non-streaming completion with usage counters.
    async fn invoke(
        &self,
        messages: Vec<ChatMessage>,
        config: &GenerationConfig,
    ) -> Result<Completion, LlmError>;
}
