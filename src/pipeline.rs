//! Request orchestration: cache, admission, dispatch, accounting.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument as _};
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::kv::KvStore;
use crate::limiter::{Admission, RateLimitConfig, RateLimiter};
use crate::providers::{ProviderError, ProviderRegistry};
use crate::retry::{self, ErrorClass, RetryPolicy};
use crate::types::{CompletionResult, GenerateRequest};
use crate::usage::{cost_usd_micros, micros_to_usd, CostTracker};

pub const CACHE_HITS_KEY: &str = "stats:cache:hits";
pub const CACHE_MISSES_KEY: &str = "stats:cache:misses";

pub struct Gateway {
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) limiter: RateLimiter,
    pub(crate) cache: ResponseCache,
    pub(crate) registry: ProviderRegistry,
    pub(crate) tracker: CostTracker,
    retry: RetryPolicy,
    request_timeout: std::time::Duration,
}

impl Gateway {
    pub fn new(kv: Arc<dyn KvStore>, registry: ProviderRegistry, config: &GatewayConfig) -> Self {
        let limiter = RateLimiter::new(
            kv.clone(),
            RateLimitConfig {
                per_minute: config.max_requests_per_minute,
                per_hour: config.max_requests_per_hour,
            },
        );
        let retry = RetryPolicy {
            max_attempts: config.max_retry_attempts,
            base_delay: config.retry_base_delay,
            ..RetryPolicy::default()
        };
        Self {
            limiter,
            cache: ResponseCache::new(kv.clone(), config.cache_ttl_seconds),
            tracker: CostTracker::new(kv.clone()),
            kv,
            registry,
            retry,
            request_timeout: config.request_timeout,
        }
    }

    /// Runs one request through the pipeline under the request deadline.
    pub async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<CompletionResult, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + self.request_timeout;

        info!(
            request_id = %request_id,
            user_id = %request.user_id,
            model = %request.model,
            prompt_chars = request.prompt.chars().count(),
            "request_received"
        );

        // Events emitted below the orchestrator (retry waits included)
        // inherit the request identity from this span.
        let span = info_span!(
            "generate",
            request_id = %request_id,
            user_id = %request.user_id,
            model = %request.model
        );
        let outcome = tokio::time::timeout(
            self.request_timeout,
            self.run(&request, &request_id, started, deadline).instrument(span),
        )
        .await
        .unwrap_or(Err(GatewayError::DeadlineExceeded));

        if let Err(err) = &outcome {
            warn!(
                request_id = %request_id,
                user_id = %request.user_id,
                model = %request.model,
                error = %err,
                "request_failed"
            );
        }
        outcome
    }

    async fn run(
        &self,
        request: &GenerateRequest,
        request_id: &str,
        started: Instant,
        deadline: Instant,
    ) -> Result<CompletionResult, GatewayError> {
        request.validate()?;

        if let Some(mut result) = self.cache.lookup(request).await {
            self.bump_counter(CACHE_HITS_KEY).await;
            result.request_id = request_id.to_string();
            result.latency_ms = elapsed_ms(started);
            info!("cache_hit");
            return Ok(result);
        }
        self.bump_counter(CACHE_MISSES_KEY).await;
        info!("cache_miss");

        if let Admission::Denied {
            window,
            retry_after_s,
        } = self.limiter.check(&request.user_id).await
        {
            info!(window, retry_after_s, "rate_limit_exceeded");
            return Err(GatewayError::RateLimited {
                window,
                retry_after_s,
            });
        }

        let binding = self
            .registry
            .resolve(&request.model)
            .ok_or_else(|| GatewayError::UnknownModel {
                model: request.model.clone(),
            })?;

        info!(provider = %binding.provider, "provider_call");
        let completion = retry::run(
            &self.retry,
            Some(deadline),
            || binding.complete(&request.prompt, request.temperature, request.max_tokens),
            |error: &ProviderError| {
                if error.is_retryable() {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Terminal
                }
            },
        )
        .await
        .map_err(|failure| GatewayError::Provider {
            error: failure.error,
            attempts: failure.attempts,
        })?;

        let prompt_tokens = completion.prompt_tokens.unwrap_or(0);
        let completion_tokens = completion.completion_tokens.unwrap_or(0);
        let total_tokens = prompt_tokens + completion_tokens;
        let cost_micros = cost_usd_micros(total_tokens, binding.price_per_token_micros);

        let tracker = self.tracker.clone();
        let user_id = request.user_id.clone();
        let model = request.model.clone();
        let record_request_id = request_id.to_string();
        tokio::spawn(async move {
            tracker
                .record(&user_id, &model, prompt_tokens, completion_tokens, cost_micros)
                .await;
            info!(
                request_id = %record_request_id,
                user_id = %user_id,
                model = %model,
                total_tokens,
                cost_usd_micros = cost_micros,
                "cost_tracked"
            );
        });

        let result = CompletionResult {
            completion: completion.text,
            model: request.model.clone(),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost_usd: micros_to_usd(cost_micros),
            request_id: request_id.to_string(),
            cached: false,
            latency_ms: elapsed_ms(started),
        };

        self.cache.store(request, &result).await;

        info!(total_tokens, latency_ms = result.latency_ms, "response_generated");
        Ok(result)
    }

    async fn bump_counter(&self, key: &str) {
        if let Err(err) = self.kv.incr_by(key, 1).await {
            warn!(key, error = %err, "stats counter update failed");
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
