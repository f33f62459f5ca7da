//! Fixed-window admission control backed by the KV store.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::kv::{KvError, KvStore};

pub const MINUTE_WINDOW_SECS: u64 = 60;
pub const HOUR_WINDOW_SECS: u64 = 3600;

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 10,
            per_hour: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied {
        window: &'static str,
        retry_after_s: u64,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct WindowStatus {
    pub used: u64,
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_s: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RateLimitStatus {
    pub user_id: String,
    pub minute: WindowStatus,
    pub hour: WindowStatus,
}

#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

fn minute_key(user_id: &str) -> String {
    format!("ratelimit:{user_id}:minute")
}

fn hour_key(user_id: &str) -> String {
    format!("ratelimit:{user_id}:hour")
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Increments both window counters and admits or denies. Counters are
    /// not rolled back on denial. When the store is unreachable the
    /// limiter admits the request: gateway availability wins over strict
    /// enforcement.
    pub async fn check(&self, user_id: &str) -> Admission {
        let minute_key = minute_key(user_id);
        let hour_key = hour_key(user_id);

        let minute = self.kv.incr_with_expiry(&minute_key, MINUTE_WINDOW_SECS).await;
        let hour = self.kv.incr_with_expiry(&hour_key, HOUR_WINDOW_SECS).await;

        let (minute, hour) = match (minute, hour) {
            (Ok(minute), Ok(hour)) => (minute, hour),
            (Err(err), _) | (_, Err(err)) => {
                warn!(user_id, error = %err, "rate_limiter_fail_open");
                return Admission::Allowed;
            }
        };

        if minute > i64::from(self.config.per_minute) {
            return Admission::Denied {
                window: "minute",
                retry_after_s: self.retry_after(&minute_key, MINUTE_WINDOW_SECS).await,
            };
        }
        if hour > i64::from(self.config.per_hour) {
            return Admission::Denied {
                window: "hour",
                retry_after_s: self.retry_after(&hour_key, HOUR_WINDOW_SECS).await,
            };
        }
        Admission::Allowed
    }

    async fn retry_after(&self, key: &str, window_seconds: u64) -> u64 {
        match self.kv.ttl(key).await {
            Ok(Some(remaining)) => remaining.clamp(1, window_seconds),
            Ok(None) | Err(_) => window_seconds,
        }
    }

    /// Read-only view of the current windows for a user.
    pub async fn status(&self, user_id: &str) -> Result<RateLimitStatus, KvError> {
        let minute = self
            .window_status(&minute_key(user_id), self.config.per_minute, MINUTE_WINDOW_SECS)
            .await?;
        let hour = self
            .window_status(&hour_key(user_id), self.config.per_hour, HOUR_WINDOW_SECS)
            .await?;
        Ok(RateLimitStatus {
            user_id: user_id.to_string(),
            minute,
            hour,
        })
    }

    async fn window_status(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
    ) -> Result<WindowStatus, KvError> {
        let used = self
            .kv
            .get(key)
            .await?
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);
        let reset_in_s = self.kv.ttl(key).await?.unwrap_or(0);
        let remaining = u64::from(limit).saturating_sub(used).min(u64::from(limit)) as u32;
        Ok(WindowStatus {
            used,
            limit,
            remaining,
            reset_in_s,
        })
    }
}
