//! Model backends.
//!
//! A [`ModelRegistry`] maps a backend identifier to a constructor;
//! adding a vendor means registering an implementation of
//! [`ChatModel`], not branching on strings at call sites.

pub mod anthropic;
pub mod catalog;
pub mod openai_compatible;
pub mod provider;

pub use provider::{
    ChatDelta, ChatMessage, ChatModel, Completion, DeltaStream, GenerationConfig, Role, TokenUsage,
};

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;

use crate::error::LlmError;
use crate::llm::anthropic::AnthropicModel;
use crate::llm::openai_compatible::OpenAiCompatibleModel;

/// Everything needed to construct a backend client for one request.
///
/// Credentials arrive per-request from the origin platform, so models
/// are built on demand rather than held in long-lived provider state.
#[derive(Clone)]
pub struct ModelSpec {
    pub backend: String,
    pub model: String,
    pub api_key: SecretString,
    /// Explicit endpoint; falls back to the backend's default base URL.
    pub base_url: Option<String>,
    /// Outbound HTTP proxy, if the deployment needs one.
    pub proxy: Option<String>,
}

impl std::fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSpec")
            .field("backend", &self.backend)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

type Factory = Box<dyn Fn(&ModelSpec) -> Result<Arc<dyn ChatModel>, LlmError> + Send + Sync>;

/// Registry of backend constructors keyed by backend identifier.
pub struct ModelRegistry {
    factories: HashMap<String, Factory>,
}

impl ModelRegistry {
    /// Empty registry; useful for tests that register their own backends.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with all built-in backends.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for backend in openai_compatible::WIRE_COMPATIBLE_BACKENDS {
            registry.register(backend, |spec| {
                Ok(Arc::new(OpenAiCompatibleModel::new(spec)?) as Arc<dyn ChatModel>)
            });
        }
        registry.register("claude", |spec| {
            Ok(Arc::new(AnthropicModel::new(spec)?) as Arc<dyn ChatModel>)
        });
        registry
    }

    /// Register (or replace) a backend constructor.
    pub fn register<F>(&mut self, backend: &str, factory: F)
    where
        F: Fn(&ModelSpec) -> Result<Arc<dyn ChatModel>, LlmError> + Send + Sync + 'static,
    {
        self.factories.insert(backend.to_string(), Box::new(factory));
    }

    /// Construct a model client for the given spec.
    pub fn create(&self, spec: &ModelSpec) -> Result<Arc<dyn ChatModel>, LlmError> {
        let factory = self
            .factories
            .get(&spec.backend)
            .ok_or_else(|| LlmError::UnsupportedBackend(spec.backend.clone()))?;
        factory(spec)
    }

    /// Registered backend identifiers, sorted.
    pub fn backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
