//! Provider bindings and the model registry.

pub mod anthropic;
pub mod openai;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ConfigError, GatewayConfig};
use crate::types::{estimate_tokens, Completion};

pub use anthropic::AnthropicBackend;
pub use openai::OpenAiBackend;

pub const ANTHROPIC_MODELS: &[&str] = &["claude-3-opus", "claude-3-sonnet", "claude-3-haiku"];
pub const OPENAI_MODELS: &[&str] = &["gpt-4", "gpt-4-turbo", "gpt-3.5-turbo"];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("upstream rate limited: {0}")]
    RateLimited(String),
    #[error("upstream server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream timeout: {0}")]
    Timeout(String),
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request rejected upstream: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Server { .. }
                | ProviderError::Network(_)
                | ProviderError::Timeout(_)
        )
    }
}

/// One upstream completion call; the binding supplies the native model.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<Completion, ProviderError>;
}

/// Immutable model → upstream mapping plus pricing.
#[derive(Clone)]
pub struct ProviderBinding {
    pub provider: String,
    pub native_model: String,
    pub price_per_token_micros: u64,
    backend: Arc<dyn CompletionBackend>,
}

impl ProviderBinding {
    pub fn new(
        provider: impl Into<String>,
        native_model: impl Into<String>,
        price_per_token_micros: u64,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            provider: provider.into(),
            native_model: native_model.into(),
            price_per_token_micros,
            backend,
        }
    }

    /// Calls the upstream and fills in any token counts it omitted with
    /// the ceil(chars/4) estimate, so callers never see a partial count.
    pub async fn complete(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        let mut completion = self.backend.complete(prompt, temperature, max_tokens).await?;
        if completion.prompt_tokens.is_none() {
            completion.prompt_tokens = Some(estimate_tokens(prompt));
        }
        if completion.completion_tokens.is_none() {
            completion.completion_tokens = Some(estimate_tokens(&completion.text));
        }
        Ok(completion)
    }
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    bindings: BTreeMap<String, ProviderBinding>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the default binding set from configuration. Providers whose
    /// API key is absent register no bindings.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::new();

        if let Some(api_key) = config.openai_api_key.as_deref() {
            for model in OPENAI_MODELS {
                let backend = Arc::new(OpenAiBackend::new(api_key, *model));
                registry.register(
                    *model,
                    ProviderBinding::new("openai", *model, config.price_micros(model)?, backend),
                );
            }
        }

        if let Some(api_key) = config.anthropic_api_key.as_deref() {
            for model in ANTHROPIC_MODELS {
                let backend = Arc::new(AnthropicBackend::new(api_key, *model));
                registry.register(
                    *model,
                    ProviderBinding::new("anthropic", *model, config.price_micros(model)?, backend),
                );
            }
        }

        Ok(registry)
    }

    pub fn register(&mut self, model: impl Into<String>, binding: ProviderBinding) {
        self.bindings.insert(model.into(), binding);
    }

    pub fn resolve(&self, model: &str) -> Option<&ProviderBinding> {
        self.bindings.get(model)
    }

    pub fn models(&self) -> impl Iterator<Item = (&str, &ProviderBinding)> {
        self.bindings
            .iter()
            .map(|(model, binding)| (model.as_str(), binding))
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}
