//! Environment-driven configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("no price configured for model {model}")]
    MissingPrice { model: String },
}

/// Per-token USD defaults, matched to the default binding set.
const DEFAULT_MODEL_PRICES_USD: &[(&str, f64)] = &[
    ("gpt-4", 0.00003),
    ("gpt-4-turbo", 0.00003),
    ("gpt-3.5-turbo", 0.000002),
    ("claude-3-opus", 0.000015),
    ("claude-3-sonnet", 0.000015),
    ("claude-3-haiku", 0.000015),
];

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub redis_url: String,
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
    pub max_retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub cache_ttl_seconds: u64,
    pub request_timeout: Duration,
    pub log_level: String,
    /// Per-token prices in integer micro-USD, keyed by model id.
    pub model_prices_micros: BTreeMap<String, u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let model_prices_micros = DEFAULT_MODEL_PRICES_USD
            .iter()
            .filter_map(|(model, usd)| {
                usd_per_token_to_micros(*usd).map(|micros| (model.to_string(), micros))
            })
            .collect();
        Self {
            openai_api_key: None,
            anthropic_api_key: None,
            redis_url: "redis://localhost:6379".to_string(),
            max_requests_per_minute: 10,
            max_requests_per_hour: 100,
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            cache_ttl_seconds: 3600,
            request_timeout: Duration::from_secs(120),
            log_level: "info".to_string(),
            model_prices_micros,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.openai_api_key = env_nonempty("OPENAI_API_KEY");
        config.anthropic_api_key = env_nonempty("ANTHROPIC_API_KEY");
        if let Some(url) = env_nonempty("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(value) = env_parsed::<u32>("MAX_REQUESTS_PER_MINUTE")? {
            config.max_requests_per_minute = value;
        }
        if let Some(value) = env_parsed::<u32>("MAX_REQUESTS_PER_HOUR")? {
            config.max_requests_per_hour = value;
        }
        if let Some(value) = env_parsed::<u32>("MAX_RETRY_ATTEMPTS")? {
            config.max_retry_attempts = value;
        }
        if let Some(value) = env_parsed::<f64>("RETRY_BASE_DELAY")? {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: "RETRY_BASE_DELAY".to_string(),
                    value: value.to_string(),
                });
            }
            config.retry_base_delay = Duration::from_secs_f64(value);
        }
        if let Some(value) = env_parsed::<u64>("CACHE_TTL_SECONDS")? {
            config.cache_ttl_seconds = value;
        }
        if let Some(value) = env_parsed::<u64>("REQUEST_TIMEOUT_SECONDS")? {
            config.request_timeout = Duration::from_secs(value);
        }
        if let Some(level) = env_nonempty("LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        let models: Vec<String> = config.model_prices_micros.keys().cloned().collect();
        for model in models {
            let key = price_env_key(&model);
            if let Some(usd) = env_parsed::<f64>(&key)? {
                let micros =
                    usd_per_token_to_micros(usd).ok_or_else(|| ConfigError::InvalidValue {
                        key: key.clone(),
                        value: usd.to_string(),
                    })?;
                config.model_prices_micros.insert(model, micros);
            }
        }

        Ok(config)
    }

    pub fn price_micros(&self, model: &str) -> Result<u64, ConfigError> {
        self.model_prices_micros
            .get(model)
            .copied()
            .ok_or_else(|| ConfigError::MissingPrice {
                model: model.to_string(),
            })
    }
}

/// `COST_PER_TOKEN_{MODEL}` with the model id uppercased and `-`/`.`
/// folded to `_`.
pub fn price_env_key(model: &str) -> String {
    let folded: String = model
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect();
    format!("COST_PER_TOKEN_{folded}")
}

pub fn usd_per_token_to_micros(usd_per_token: f64) -> Option<u64> {
    if !usd_per_token.is_finite() || usd_per_token < 0.0 {
        return None;
    }
    let micros = (usd_per_token * 1_000_000.0).round();
    if !micros.is_finite() || micros < 0.0 || micros > u64::MAX as f64 {
        return None;
    }
    Some(micros as u64)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    let Some(raw) = env_nonempty(key) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        })
}
