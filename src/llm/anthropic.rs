//! Anthropic Messages API adapter.
//!
//! The Messages API takes the system prompt out of band and emits
//! typed content-block deltas; both quirks are flattened here into the
//! normalized `{content, reasoning_content}` delta shape.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatDelta, ChatMessage, ChatModel, Completion, DeltaStream, GenerationConfig, Role, TokenUsage,
};
use crate::llm::ModelSpec;

const BACKEND: &str = "claude";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Client for Anthropic's Messages API.
pub struct AnthropicModel {
    client: Client,
    model: String,
    base_url: String,
    api_key: secrecy::SecretString,
}

impl AnthropicModel {
    pub fn new(spec: &ModelSpec) -> Result<Self, LlmError> {
        let mut builder = Client::builder().timeout(std::time::Duration::from_secs(600));
        if let Some(proxy) = &spec.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| {
                LlmError::RequestFailed {
                    backend: BACKEND.to_string(),
                    reason: format!("invalid proxy {proxy}: {e}"),
                }
            })?);
        }
        let client = builder.build().map_err(|e| LlmError::RequestFailed {
            backend: BACKEND.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })?;

        Ok(Self {
            client,
            model: spec.model.clone(),
            base_url: spec
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: spec.api_key.clone(),
        })
    }

    fn body(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
        stream: bool,
    ) -> MessagesBody {
        // System messages ride in the dedicated `system` field; the
        // conversation itself only carries user/assistant turns.
        let mut system = String::new();
        let mut turns = Vec::new();
        for msg in messages {
            match msg.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&msg.content);
                }
                Role::Human => turns.push(WireTurn {
                    role: "user",
                    content: msg.content.clone(),
                }),
                Role::Assistant => turns.push(WireTurn {
                    role: "assistant",
                    content: msg.content.clone(),
                }),
            }
        }

        MessagesBody {
            model: self.model.clone(),
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: (!system.is_empty()).then_some(system),
            messages: turns,
            temperature: config.temperature,
            thinking: config.reasoning_budget.map(|budget_tokens| Thinking {
                kind: "enabled",
                budget_tokens,
            }),
            stream,
        }
    }

    async fn post(&self, body: &MessagesBody) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                backend: BACKEND.to_string(),
                reason: format!("HTTP {status}: {text}"),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for AnthropicModel {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        config: &GenerationConfig,
    ) -> Result<DeltaStream, LlmError> {
        let body = self.body(&messages, config, true);
        tracing::debug!(
            backend = BACKEND,
            model = %self.model,
            message_count = messages.len(),
            "llm.stream.request"
        );
        let response = self.post(&body).await?;

        let deltas = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| {
                let item = match event {
                    Ok(event) => match event.event.as_str() {
                        "content_block_delta" => {
                            match serde_json::from_str::<BlockDeltaEvent>(&event.data) {
                                Ok(block) => match block.delta {
                                    BlockDelta::TextDelta { text } => Some(Ok(ChatDelta {
                                        content: Some(text),
                                        reasoning_content: None,
                                    })),
                                    BlockDelta::ThinkingDelta { thinking } => Some(Ok(ChatDelta {
                                        content: None,
                                        reasoning_content: Some(thinking),
                                    })),
                                    BlockDelta::Other => None,
                                },
                                Err(e) => Some(Err(LlmError::InvalidResponse {
                                    backend: BACKEND.to_string(),
                                    reason: format!("bad content_block_delta: {e}"),
                                })),
                            }
                        }
                        "error" => Some(Err(LlmError::RequestFailed {
                            backend: BACKEND.to_string(),
                            reason: event.data,
                        })),
                        // message_start, ping, message_stop and friends carry no text.
                        _ => None,
                    },
                    Err(e) => Some(Err(LlmError::RequestFailed {
                        backend: BACKEND.to_string(),
                        reason: format!("stream interrupted: {e}"),
                    })),
                };
                futures::future::ready(item)
            });

        Ok(Box::pin(deltas))
    }

    async fn invoke(
        &self,
        messages: Vec<ChatMessage>,
        config: &GenerationConfig,
    ) -> Result<Completion, LlmError> {
        let body = self.body(&messages, config, false);
        let response = self.post(&body).await?;
        let parsed: MessagesResponse = response.json().await?;

        let content: String = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();

        let usage = TokenUsage {
            prompt_tokens: parsed.usage.input_tokens,
            completion_tokens: parsed.usage.output_tokens,
            total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
        };

        Ok(Completion { content, usage })
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct MessagesBody {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Thinking>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireTurn {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct Thinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct BlockDeltaEvent {
    delta: BlockDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum BlockDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
