use thiserror::Error;

use crate::kv::KvError;
use crate::providers::ProviderError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    InvalidInput { reason: String },
    #[error("unknown model: {model}")]
    UnknownModel { model: String },
    #[error("rate limit exceeded for {window} window")]
    RateLimited {
        window: &'static str,
        retry_after_s: u64,
    },
    #[error("kv unavailable: {message}")]
    KvUnavailable { message: String },
    #[error("provider call failed after {attempts} attempt(s): {error}")]
    Provider {
        #[source]
        error: ProviderError,
        attempts: u32,
    },
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<KvError> for GatewayError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Unavailable { message } => GatewayError::KvUnavailable { message },
        }
    }
}
