//! Read-only health and admin aggregations over KV state.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::GatewayError;
use crate::limiter::RateLimitStatus;
use crate::pipeline::{Gateway, CACHE_HITS_KEY, CACHE_MISSES_KEY};
use crate::usage::{micros_to_usd, UsageTotals};

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub kv_connected: bool,
    pub providers_configured: usize,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub ttl_seconds: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RateLimitSettings {
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct GatewaySummary {
    pub users: BTreeMap<String, UsageTotals>,
    pub models: BTreeMap<String, UsageTotals>,
    pub cache: CacheStats,
    pub rate_limits: RateLimitSettings,
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub price_per_token_usd: f64,
    pub price_per_1k_tokens_usd: f64,
}

impl Gateway {
    pub async fn health(&self) -> HealthReport {
        let kv_connected = self.kv.ping().await.is_ok();
        let providers_configured = self.registry.len();
        let status = if kv_connected && providers_configured > 0 {
            "healthy"
        } else {
            "degraded"
        };
        HealthReport {
            status,
            kv_connected,
            providers_configured,
        }
    }

    pub fn models(&self) -> Vec<ModelInfo> {
        self.registry
            .models()
            .map(|(name, binding)| {
                let price_per_token_usd = micros_to_usd(binding.price_per_token_micros);
                ModelInfo {
                    name: name.to_string(),
                    provider: binding.provider.clone(),
                    price_per_token_usd,
                    price_per_1k_tokens_usd: price_per_token_usd * 1000.0,
                }
            })
            .collect()
    }

    pub async fn usage(&self, user_id: &str) -> Result<Option<UsageTotals>, GatewayError> {
        Ok(self.tracker.usage_for(user_id).await?)
    }

    pub async fn rate_limit_status(&self, user_id: &str) -> Result<RateLimitStatus, GatewayError> {
        Ok(self.limiter.status(user_id).await?)
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, GatewayError> {
        let total_entries = self.cache.entry_count().await?;
        let hits = self.read_stat(CACHE_HITS_KEY).await?;
        let misses = self.read_stat(CACHE_MISSES_KEY).await?;
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        Ok(CacheStats {
            total_entries,
            hits,
            misses,
            hit_rate,
            ttl_seconds: self.cache.ttl_seconds(),
        })
    }

    pub async fn clear_cache(&self) -> Result<u64, GatewayError> {
        Ok(self.cache.clear().await?)
    }

    pub async fn summary(&self) -> Result<GatewaySummary, GatewayError> {
        let usage = self.tracker.summary().await?;
        let cache = self.cache_stats().await?;
        let config = self.limiter.config();
        Ok(GatewaySummary {
            users: usage.users,
            models: usage.models,
            cache,
            rate_limits: RateLimitSettings {
                max_requests_per_minute: config.per_minute,
                max_requests_per_hour: config.per_hour,
            },
        })
    }

    async fn read_stat(&self, key: &str) -> Result<u64, GatewayError> {
        Ok(self
            .kv
            .get(key)
            .await?
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0))
    }
}
