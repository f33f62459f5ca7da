use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub const MAX_PROMPT_CHARS: usize = 10_000;
pub const MAX_COMPLETION_TOKENS: u32 = 4096;

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

/// One inbound generation request, as accepted on `/v1/generate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub user_id: String,
}

impl GenerateRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.prompt.is_empty() {
            return Err(invalid("prompt must not be empty"));
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(invalid(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid(format!(
                "temperature {} outside [0, 2]",
                self.temperature
            )));
        }
        if self.max_tokens == 0 || self.max_tokens > MAX_COMPLETION_TOKENS {
            return Err(invalid(format!(
                "max_tokens {} outside 1..={MAX_COMPLETION_TOKENS}",
                self.max_tokens
            )));
        }
        if self.user_id.is_empty() {
            return Err(invalid("user_id must not be empty"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> GatewayError {
    GatewayError::InvalidInput {
        reason: reason.into(),
    }
}

/// The canonical response envelope. Cached copies are stored with
/// `cached=false`; readers flip the flag and restamp `request_id` and
/// `latency_ms`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionResult {
    pub completion: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub request_id: String,
    pub cached: bool,
    pub latency_ms: f64,
}

/// Raw upstream output before token-count normalization.
#[derive(Clone, Debug, Default)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// Coarse fallback when the upstream omits token accounting.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
