//! Token and cost accounting in the KV store.
//!
//! Monetary amounts accumulate as integer micro-dollars; only the external
//! JSON representation uses a decimal number.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::kv::{KvError, KvStore};

pub fn cost_usd_micros(total_tokens: u64, price_per_token_micros: u64) -> u64 {
    total_tokens.saturating_mul(price_per_token_micros)
}

pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub tokens: u64,
    pub cost_usd: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct UsageSummary {
    pub users: BTreeMap<String, UsageTotals>,
    pub models: BTreeMap<String, UsageTotals>,
}

#[derive(Clone)]
pub struct CostTracker {
    kv: Arc<dyn KvStore>,
}

impl CostTracker {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Best-effort: the caller already holds a completion, so accounting
    /// failures are logged and swallowed.
    pub async fn record(
        &self,
        user_id: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_micros: u64,
    ) {
        let total_tokens = prompt_tokens.saturating_add(completion_tokens);
        if let Err(err) = self.try_record(user_id, model, total_tokens, cost_micros).await {
            warn!(user_id, model, error = %err, "cost recording failed");
        }
    }

    async fn try_record(
        &self,
        user_id: &str,
        model: &str,
        total_tokens: u64,
        cost_micros: u64,
    ) -> Result<(), KvError> {
        for scope in [format!("usage:{user_id}"), format!("model_usage:{model}")] {
            self.kv.incr_by(&format!("{scope}:requests"), 1).await?;
            self.kv
                .incr_by(&format!("{scope}:tokens"), clamp_i64(total_tokens))
                .await?;
            self.kv
                .incr_by(&format!("{scope}:cost"), clamp_i64(cost_micros))
                .await?;
        }
        Ok(())
    }

    /// `None` when no counter exists for the user.
    pub async fn usage_for(&self, user_id: &str) -> Result<Option<UsageTotals>, KvError> {
        let scope = format!("usage:{user_id}");
        let requests = self.read_counter(&format!("{scope}:requests")).await?;
        let tokens = self.read_counter(&format!("{scope}:tokens")).await?;
        let cost = self.read_counter(&format!("{scope}:cost")).await?;
        match (requests, tokens, cost) {
            (None, None, None) => Ok(None),
            (requests, tokens, cost) => Ok(Some(UsageTotals {
                requests: requests.unwrap_or(0),
                tokens: tokens.unwrap_or(0),
                cost_usd: micros_to_usd(cost.unwrap_or(0)),
            })),
        }
    }

    pub async fn summary(&self) -> Result<UsageSummary, KvError> {
        let mut summary = UsageSummary::default();
        self.aggregate("usage:", &mut summary.users).await?;
        self.aggregate("model_usage:", &mut summary.models).await?;
        Ok(summary)
    }

    async fn aggregate(
        &self,
        prefix: &str,
        out: &mut BTreeMap<String, UsageTotals>,
    ) -> Result<(), KvError> {
        for key in self.kv.scan_keys(&format!("{prefix}*")).await? {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            // Scope ids are opaque and may contain ':'; the field name is
            // always the last segment.
            let Some((scope, field)) = rest.rsplit_once(':') else {
                continue;
            };
            let Some(value) = self.read_counter(&key).await? else {
                continue;
            };
            let totals = out.entry(scope.to_string()).or_default();
            match field {
                "requests" => totals.requests = value,
                "tokens" => totals.tokens = value,
                "cost" => totals.cost_usd = micros_to_usd(value),
                _ => {}
            }
        }
        Ok(())
    }

    async fn read_counter(&self, key: &str) -> Result<Option<u64>, KvError> {
        Ok(self
            .kv
            .get(key)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(|value| value.max(0) as u64))
    }
}

fn clamp_i64(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn cost_is_exact_in_micros() {
        assert_eq!(cost_usd_micros(2, 2), 4);
        assert_eq!(micros_to_usd(4), 0.000004);
        assert_eq!(cost_usd_micros(u64::MAX, 2), u64::MAX);
    }

    #[tokio::test]
    async fn records_accumulate_per_user_and_model() {
        let tracker = CostTracker::new(Arc::new(MemoryKv::new()));
        tracker.record("u1", "gpt-3.5-turbo", 1, 1, 4).await;
        tracker.record("u1", "gpt-3.5-turbo", 4, 6, 20).await;
        tracker.record("u2", "gpt-4", 2, 3, 150).await;

        let u1 = tracker.usage_for("u1").await.unwrap().expect("u1 usage");
        assert_eq!(u1.requests, 2);
        assert_eq!(u1.tokens, 12);
        assert_eq!(u1.cost_usd, 0.000024);

        assert!(tracker.usage_for("nobody").await.unwrap().is_none());

        let summary = tracker.summary().await.unwrap();
        assert_eq!(summary.users.len(), 2);
        assert_eq!(summary.models["gpt-4"].requests, 1);
        assert_eq!(summary.models["gpt-4"].tokens, 5);
        assert_eq!(summary.models["gpt-4"].cost_usd, 0.00015);
    }

    #[tokio::test]
    async fn user_ids_with_colons_survive_the_summary() {
        let tracker = CostTracker::new(Arc::new(MemoryKv::new()));
        tracker.record("org:team:alice", "gpt-4", 1, 2, 90).await;

        let summary = tracker.summary().await.unwrap();
        let totals = summary.users.get("org:team:alice").expect("scoped user");
        assert_eq!(totals.tokens, 3);
    }
}
