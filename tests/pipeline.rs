use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tollgate::kv::{KvError, MemoryKv};
use tollgate::usage::UsageTotals;
use tollgate::{
    Completion, CompletionBackend, Gateway, GatewayConfig, GatewayError, GenerateRequest, KvStore,
    ProviderBinding, ProviderError, ProviderRegistry,
};

struct FixedBackend {
    text: &'static str,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl CompletionBackend for FixedBackend {
    async fn complete(
        &self,
        _prompt: &str,
        _temperature: f64,
        _max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: self.text.to_string(),
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
        })
    }
}

struct FlakyBackend {
    failures_before_success: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl CompletionBackend for FlakyBackend {
    async fn complete(
        &self,
        _prompt: &str,
        _temperature: f64,
        _max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            return Err(ProviderError::Server {
                status: 503,
                body: "overloaded".to_string(),
            });
        }
        Ok(Completion {
            text: "recovered".to_string(),
            prompt_tokens: Some(1),
            completion_tokens: Some(1),
        })
    }
}

struct TerminalBackend {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl CompletionBackend for TerminalBackend {
    async fn complete(
        &self,
        _prompt: &str,
        _temperature: f64,
        _max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Api {
            status: 400,
            body: "bad request".to_string(),
        })
    }
}

/// Store where every call fails, for outage scenarios.
struct DownKv;

#[async_trait]
impl KvStore for DownKv {
    async fn incr_with_expiry(&self, _: &str, _: u64) -> Result<i64, KvError> {
        Err(down())
    }
    async fn incr_by(&self, _: &str, _: i64) -> Result<i64, KvError> {
        Err(down())
    }
    async fn get(&self, _: &str) -> Result<Option<String>, KvError> {
        Err(down())
    }
    async fn set_with_ttl(&self, _: &str, _: &str, _: u64) -> Result<(), KvError> {
        Err(down())
    }
    async fn ttl(&self, _: &str) -> Result<Option<u64>, KvError> {
        Err(down())
    }
    async fn delete_matching(&self, _: &str) -> Result<u64, KvError> {
        Err(down())
    }
    async fn scan_keys(&self, _: &str) -> Result<Vec<String>, KvError> {
        Err(down())
    }
    async fn ping(&self) -> Result<(), KvError> {
        Err(down())
    }
}

fn down() -> KvError {
    KvError::Unavailable {
        message: "connection refused".to_string(),
    }
}

fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.retry_base_delay = Duration::from_millis(5);
    config
}

fn gateway_with(
    kv: Arc<dyn KvStore>,
    config: GatewayConfig,
    backend: Arc<dyn CompletionBackend>,
    price_micros: u64,
) -> Gateway {
    let mut registry = ProviderRegistry::new();
    registry.register(
        "gpt-3.5-turbo",
        ProviderBinding::new("stub", "gpt-3.5-turbo", price_micros, backend),
    );
    Gateway::new(kv, registry, &config)
}

fn request(prompt: &str, user_id: &str) -> GenerateRequest {
    GenerateRequest {
        prompt: prompt.to_string(),
        model: "gpt-3.5-turbo".to_string(),
        temperature: 0.7,
        max_tokens: 50,
        user_id: user_id.to_string(),
    }
}

/// Cost recording is fire-and-forget and lands counter by counter; poll
/// until a complete record is visible.
async fn wait_for_usage(gateway: &Gateway, user_id: &str) -> UsageTotals {
    for _ in 0..100 {
        if let Ok(Some(totals)) = gateway.usage(user_id).await {
            if totals.requests > 0 && totals.tokens > 0 && totals.cost_usd > 0.0 {
                return totals;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("usage for {user_id} never recorded");
}

#[tokio::test]
async fn happy_path_accounts_tokens_and_cost() {
    let calls = Arc::new(AtomicU32::new(0));
    let backend = Arc::new(FixedBackend {
        text: "world",
        prompt_tokens: Some(1),
        completion_tokens: Some(1),
        calls: calls.clone(),
    });
    let gateway = gateway_with(Arc::new(MemoryKv::new()), test_config(), backend, 2);

    let result = gateway.generate(request("hello", "u1")).await.expect("result");
    assert_eq!(result.completion, "world");
    assert_eq!(result.prompt_tokens, 1);
    assert_eq!(result.completion_tokens, 1);
    assert_eq!(result.total_tokens, 2);
    assert_eq!(result.cost_usd, 0.000004);
    assert!(!result.cached);
    assert!(result.latency_ms >= 0.0);
    assert!(!result.request_id.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let usage = wait_for_usage(&gateway, "u1").await;
    assert_eq!(usage.requests, 1);
    assert_eq!(usage.tokens, 2);
    assert_eq!(usage.cost_usd, 0.000004);
}

#[tokio::test]
async fn cache_hit_skips_provider_rate_limit_and_accounting() {
    let calls = Arc::new(AtomicU32::new(0));
    let backend = Arc::new(FixedBackend {
        text: "world",
        prompt_tokens: Some(1),
        completion_tokens: Some(1),
        calls: calls.clone(),
    });
    let kv = Arc::new(MemoryKv::new());
    let gateway = gateway_with(kv.clone(), test_config(), backend, 2);

    let first = gateway.generate(request("hello", "u1")).await.expect("first");
    let second = gateway.generate(request("hello", "u2")).await.expect("second");

    assert!(second.cached);
    assert_eq!(second.completion, first.completion);
    assert_eq!(second.total_tokens, first.total_tokens);
    assert_eq!(second.cost_usd, first.cost_usd);
    assert_ne!(second.request_id, first.request_id);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "provider called once");

    // Cached requests bypass admission and accounting entirely.
    assert_eq!(kv.get("ratelimit:u2:minute").await.unwrap(), None);
    assert_eq!(kv.get("ratelimit:u2:hour").await.unwrap(), None);
    assert!(gateway.usage("u2").await.unwrap().is_none());
}

#[tokio::test]
async fn rate_limit_denies_the_third_distinct_request() {
    let backend = Arc::new(FixedBackend {
        text: "ok",
        prompt_tokens: Some(1),
        completion_tokens: Some(1),
        calls: Arc::new(AtomicU32::new(0)),
    });
    let mut config = test_config();
    config.max_requests_per_minute = 2;
    let gateway = gateway_with(Arc::new(MemoryKv::new()), config, backend, 2);

    gateway.generate(request("one", "u3")).await.expect("first");
    gateway.generate(request("two", "u3")).await.expect("second");

    match gateway.generate(request("three", "u3")).await {
        Err(GatewayError::RateLimited {
            window,
            retry_after_s,
        }) => {
            assert_eq!(window, "minute");
            assert!((1..=60).contains(&retry_after_s));
        }
        other => panic!("expected rate limit denial, got {other:?}"),
    }
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let backend = Arc::new(FlakyBackend {
        failures_before_success: 2,
        calls: calls.clone(),
    });
    let gateway = gateway_with(Arc::new(MemoryKv::new()), test_config(), backend, 2);

    let started = std::time::Instant::now();
    let result = gateway.generate(request("flaky", "u4")).await.expect("result");
    assert_eq!(result.completion, "recovered");
    assert!(!result.cached);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Two waits of at least base and 2x base.
    assert!(started.elapsed() >= Duration::from_millis(15));
}

#[tokio::test]
async fn terminal_provider_errors_fail_fast_without_cache_write() {
    let calls = Arc::new(AtomicU32::new(0));
    let backend = Arc::new(TerminalBackend {
        calls: calls.clone(),
    });
    let kv = Arc::new(MemoryKv::new());
    let gateway = gateway_with(kv.clone(), test_config(), backend, 2);

    match gateway.generate(request("doomed", "u5")).await {
        Err(GatewayError::Provider { attempts, .. }) => assert_eq!(attempts, 1),
        other => panic!("expected provider failure, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Admission happened, but the failure never populated the cache.
    assert_eq!(kv.get("ratelimit:u5:minute").await.unwrap().as_deref(), Some("1"));
    assert!(kv.scan_keys("cache:*").await.unwrap().is_empty());

    // A retry of the same fingerprint reaches the provider again.
    let _ = gateway.generate(request("doomed", "u5")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn kv_outage_fails_open_and_reports_degraded() {
    let backend = Arc::new(FixedBackend {
        text: "still here",
        prompt_tokens: Some(1),
        completion_tokens: Some(1),
        calls: Arc::new(AtomicU32::new(0)),
    });
    let gateway = gateway_with(Arc::new(DownKv), test_config(), backend, 2);

    let result = gateway.generate(request("hello", "u6")).await.expect("fail open");
    assert_eq!(result.completion, "still here");
    assert!(!result.cached);

    let health = gateway.health().await;
    assert_eq!(health.status, "degraded");
    assert!(!health.kv_connected);
    assert_eq!(health.providers_configured, 1);
}

#[tokio::test]
async fn token_estimates_flow_through_cost() {
    // Upstream reports no usage: 8 chars of prompt -> 2 tokens,
    // 6 chars of text -> 2 tokens.
    let backend = Arc::new(FixedBackend {
        text: "abcdef",
        prompt_tokens: None,
        completion_tokens: None,
        calls: Arc::new(AtomicU32::new(0)),
    });
    let gateway = gateway_with(Arc::new(MemoryKv::new()), test_config(), backend, 3);

    let result = gateway.generate(request("12345678", "u7")).await.expect("result");
    assert_eq!(result.prompt_tokens, 2);
    assert_eq!(result.completion_tokens, 2);
    assert_eq!(result.total_tokens, 4);
    assert_eq!(result.cost_usd, 0.000012);
}

#[tokio::test]
async fn cache_hit_leaves_the_entry_ttl_untouched() {
    let backend = Arc::new(FixedBackend {
        text: "world",
        prompt_tokens: Some(1),
        completion_tokens: Some(1),
        calls: Arc::new(AtomicU32::new(0)),
    });
    let kv = Arc::new(MemoryKv::new());
    let mut config = test_config();
    config.cache_ttl_seconds = 10;
    let gateway = gateway_with(kv.clone(), config, backend, 2);

    gateway.generate(request("hello", "u8")).await.expect("miss");
    let keys = kv.scan_keys("cache:*").await.unwrap();
    assert_eq!(keys.len(), 1);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let hit = gateway.generate(request("hello", "u8")).await.expect("hit");
    assert!(hit.cached);
    // A refresh would have re-armed the entry close to the configured 10s;
    // untouched, the remaining lifetime reflects the elapsed wait.
    let remaining = kv.ttl(&keys[0]).await.unwrap().expect("still expiring");
    assert!(remaining <= 8);
}

#[tokio::test]
async fn cache_stats_track_hits_and_misses() {
    let backend = Arc::new(FixedBackend {
        text: "world",
        prompt_tokens: Some(1),
        completion_tokens: Some(1),
        calls: Arc::new(AtomicU32::new(0)),
    });
    let gateway = gateway_with(Arc::new(MemoryKv::new()), test_config(), backend, 2);

    gateway.generate(request("a", "u9")).await.expect("miss");
    gateway.generate(request("a", "u9")).await.expect("hit");
    gateway.generate(request("b", "u9")).await.expect("miss");

    let stats = gateway.cache_stats().await.expect("stats");
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.total_entries, 2);
    assert!((stats.hit_rate - 1.0 / 3.0).abs() < 1e-9);

    assert_eq!(gateway.clear_cache().await.expect("clear"), 2);
    let stats = gateway.cache_stats().await.expect("stats");
    assert_eq!(stats.total_entries, 0);
}

#[tokio::test]
async fn summary_aggregates_users_models_and_cache() {
    let backend = Arc::new(FixedBackend {
        text: "world",
        prompt_tokens: Some(3),
        completion_tokens: Some(2),
        calls: Arc::new(AtomicU32::new(0)),
    });
    let gateway = gateway_with(Arc::new(MemoryKv::new()), test_config(), backend, 2);

    gateway.generate(request("a", "alice")).await.expect("result");
    wait_for_usage(&gateway, "alice").await;

    let summary = gateway.summary().await.expect("summary");
    assert_eq!(summary.users["alice"].requests, 1);
    assert_eq!(summary.users["alice"].tokens, 5);
    assert_eq!(summary.models["gpt-3.5-turbo"].requests, 1);
    assert_eq!(summary.rate_limits.max_requests_per_minute, 10);
    assert_eq!(summary.cache.misses, 1);
}

#[tokio::test]
async fn invalid_requests_never_reach_admission() {
    let backend = Arc::new(FixedBackend {
        text: "never",
        prompt_tokens: Some(1),
        completion_tokens: Some(1),
        calls: Arc::new(AtomicU32::new(0)),
    });
    let kv = Arc::new(MemoryKv::new());
    let gateway = gateway_with(kv.clone(), test_config(), backend, 2);

    let bad = request("", "u10");
    assert!(matches!(
        gateway.generate(bad).await,
        Err(GatewayError::InvalidInput { .. })
    ));
    assert_eq!(kv.get("ratelimit:u10:minute").await.unwrap(), None);
}
