//! Chat Completions wire-format adapter.
//!
//! Covers every backend speaking the OpenAI Chat Completions API:
//! OpenAI itself, DeepSeek, Grok, Zhipu, Qianwen, Gemini's
//! OpenAI-compatible endpoint, and self-hosted Ollama. DeepSeek-style
//! `reasoning_content` deltas are normalized here so the core never
//! sees a vendor-specific payload shape.

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

/// Backends that speak this wire format.
pub const WIRE_COMPATIBLE_BACKENDS: &[&str] = &[
    "openai", "deepseek", "gemini", "grok", "zhipu", "qianwen", "ollama",
];

fn default_base_url(backend: &str) -> Option<&'static str> {
    match backend {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "grok" => Some("https://api.x.ai/v1"),
        "zhipu" => Some("https://open.bigmodel.cn/api/paas/v4"),
        "qianwen" => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
        // Ollama is self-hosted; the caller must supply the endpoint.
        _ => None,
    }
}

/// Client for one (backend, model, credentials) combination.
pub struct OpenAiCompatibleModel {
    client: Client,
    backend: String,
    model: String,
    base_url: String,
    api_key: secrecy::SecretString,
}

impl OpenAiCompatibleModel {
    pub fn new(spec: &ModelSpec) -> Result<Self, LlmError> {
        let base_url = spec
            .base_url
            .clone()
            .or_else(|| default_base_url(&spec.backend).map(String::from))
            .ok_or_else(|| LlmError::RequestFailed {
                backend: spec.backend.clone(),
                reason: "no endpoint configured for this backend".to_string(),
            })?;

        let mut builder = Client::builder().timeout(std::time::Duration::from_secs(600));
        if let Some(proxy) = &spec.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| {
                LlmError::RequestFailed {
                    backend: spec.backend.clone(),
                    reason: format!("invalid proxy {proxy}: {e}"),
                }
            })?);
        }
        let client = builder.build().map_err(|e| LlmError::RequestFailed {
            backend: spec.backend.clone(),
            reason: format!("failed to build HTTP client: {e}"),
        })?;

        Ok(Self {
            client,
            backend: spec.backend.clone(),
            model: spec.model.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: spec.api_key.clone(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn body(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
        stream: bool,
    ) -> ChatCompletionBody {
        ChatCompletionBody {
            model: self.model.clone(),
            messages: messages.iter().map(WireMessage::from).collect(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream,
        }
    }

    async fn post(&self, body: &ChatCompletionBody) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                backend: self.backend.clone(),
                reason: format!("HTTP {status}: {text}"),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    fn backend(&self) -> &str {
        &self.backend
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
            backend = %self.backend,
            model = %self.model,
            message_count = messages.len(),
            "llm.stream.request"
        );
        let response = self.post(&body).await?;
        let backend = self.backend.clone();

        let deltas = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                // The terminal sentinel is not a delta.
                let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
                futures::future::ready(!done)
            })
            .map(move |event| match event {
                Ok(event) => {
                    let chunk: ChatChunk =
                        serde_json::from_str(&event.data).map_err(|e| LlmError::InvalidResponse {
                            backend: backend.clone(),
                            reason: format!("bad chunk: {e}"),
                        })?;
                    Ok(chunk
                        .choices
                        .into_iter()
                        .next()
                        .map(|choice| ChatDelta {
                            content: choice.delta.content,
                            reasoning_content: choice.delta.reasoning_content,
                        })
                        .unwrap_or_default())
                }
                Err(e) => Err(LlmError::RequestFailed {
                    backend: backend.clone(),
                    reason: format!("stream interrupted: {e}"),
                }),
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
        let parsed: ChatCompletionResponse = response.json().await?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse {
                backend: self.backend.clone(),
                reason: "response carried no choices".to_string(),
            })?;

        Ok(Completion {
            content,
            usage: parsed.usage.unwrap_or_default(),
        })
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct ChatCompletionBody {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: match msg.role {
                Role::System => "system",
                Role::Human => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: WireDelta,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn spec(backend: &str, base_url: Option<&str>) -> ModelSpec {
        ModelSpec {
            backend: backend.to_string(),
            model: "m".to_string(),
            api_key: SecretString::from("sk"),
            base_url: base_url.map(String::from),
            proxy: None,
        }
    }

    #[test]
    fn ollama_requires_explicit_endpoint() {
        assert!(OpenAiCompatibleModel::new(&spec("ollama", None)).is_err());
        assert!(OpenAiCompatibleModel::new(&spec("ollama", Some("http://localhost:11434/v1"))).is_ok());
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let model = OpenAiCompatibleModel::new(&spec("openai", Some("https://x.test/v1/"))).unwrap();
        assert_eq!(model.completions_url(), "https://x.test/v1/chat/completions");
    }

    #[test]
    fn role_mapping_matches_wire_protocol() {
        let wire = WireMessage::from(&ChatMessage::human("hi"));
        assert_eq!(wire.role, "user");
        let wire = WireMessage::from(&ChatMessage::assistant("yo"));
        assert_eq!(wire.role, "assistant");
    }

    #[test]
    fn reasoning_deltas_deserialize() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":null,"reasoning_content":"hmm"}}]}"#,
        )
        .unwrap();
        assert_eq!(
            chunk.choices[0].delta.reasoning_content.as_deref(),
            Some("hmm")
        );
    }
}
