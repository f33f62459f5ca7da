pub mod admin;
pub mod cache;
pub mod config;
mod error;
pub mod http;
pub mod kv;
pub mod limiter;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod telemetry;
pub mod types;
pub mod usage;

pub use config::{ConfigError, GatewayConfig};
pub use error::GatewayError;
pub use kv::{KvError, KvStore, MemoryKv, RedisKv};
pub use pipeline::Gateway;
pub use providers::{
    AnthropicBackend, CompletionBackend, OpenAiBackend, ProviderBinding, ProviderError,
    ProviderRegistry,
};
pub use types::{Completion, CompletionResult, GenerateRequest};
