//! Shared response cache keyed by a request fingerprint.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::kv::{KvError, KvStore};
use crate::types::{CompletionResult, GenerateRequest};

const CACHE_PREFIX: &str = "cache:";

/// Hex digest over the request's semantic inputs. `user_id` is excluded:
/// identical prompts deduplicate across users.
pub fn fingerprint(request: &GenerateRequest) -> String {
    let canonical = format!(
        "{}|{}|{:.3}|{}",
        request.prompt, request.model, request.temperature, request.max_tokens
    );
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn cache_key(fingerprint: &str) -> String {
    format!("{CACHE_PREFIX}{fingerprint}")
}

#[derive(Clone)]
pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    ttl_seconds: u64,
}

impl ResponseCache {
    pub fn new(kv: Arc<dyn KvStore>, ttl_seconds: u64) -> Self {
        Self { kv, ttl_seconds }
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Returns the stored result with `cached` flipped to true. A store
    /// failure or an unreadable entry degrades to a miss. The entry's TTL
    /// is left untouched.
    pub async fn lookup(&self, request: &GenerateRequest) -> Option<CompletionResult> {
        let key = cache_key(&fingerprint(request));
        let raw = match self.kv.get(&key).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(error = %err, "cache lookup failed");
                return None;
            }
        };
        match serde_json::from_str::<CompletionResult>(&raw) {
            Ok(mut result) => {
                result.cached = true;
                Some(result)
            }
            Err(err) => {
                warn!(error = %err, "discarding unreadable cache entry");
                None
            }
        }
    }

    /// Best-effort write; entries always record `cached=false`.
    pub async fn store(&self, request: &GenerateRequest, result: &CompletionResult) {
        let mut entry = result.clone();
        entry.cached = false;
        let serialized = match serde_json::to_string(&entry) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(error = %err, "cache entry serialization failed");
                return;
            }
        };
        let key = cache_key(&fingerprint(request));
        if let Err(err) = self.kv.set_with_ttl(&key, &serialized, self.ttl_seconds).await {
            warn!(error = %err, "cache store failed");
        }
    }

    pub async fn clear(&self) -> Result<u64, KvError> {
        self.kv.delete_matching(&format!("{CACHE_PREFIX}*")).await
    }

    pub async fn entry_count(&self) -> Result<u64, KvError> {
        Ok(self.kv.scan_keys(&format!("{CACHE_PREFIX}*")).await?.len() as u64)
    }
}
