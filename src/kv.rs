//! Typed facade over the distributed key-value store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv unavailable: {message}")]
    Unavailable { message: String },
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        KvError::Unavailable {
            message: err.to_string(),
        }
    }
}

/// Counter, string and scan operations the gateway needs from the store.
/// Callers decide whether a failed call fails the request open or closed.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomic increment; the TTL is attached on the first increment of a
    /// key and left untouched afterwards.
    async fn incr_with_expiry(&self, key: &str, ttl_seconds: u64) -> Result<i64, KvError>;

    /// Plain unexpiring counter.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), KvError>;

    /// Remaining lifetime in seconds; `None` for missing or unexpiring keys.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, KvError>;

    async fn delete_matching(&self, pattern: &str) -> Result<u64, KvError>;

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}

#[derive(Clone, Debug)]
pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    pub fn new(url: impl AsRef<str>) -> Result<Self, KvError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, KvError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn incr_with_expiry(&self, key: &str, ttl_seconds: u64) -> Result<i64, KvError> {
        let mut conn = self.connection().await?;
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: bool = conn.expire(key, ttl_seconds as i64).await?;
        }
        Ok(count)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let mut conn = self.connection().await?;
        Ok(conn.incr(key, delta).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, KvError> {
        let mut conn = self.connection().await?;
        // -2 = missing key, -1 = no expiry.
        let remaining: i64 = conn.ttl(key).await?;
        Ok((remaining >= 0).then_some(remaining as u64))
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, KvError> {
        let keys = self.scan_keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let deleted: u64 = conn.del(keys).await?;
        Ok(deleted)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            out.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(out)
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process stand-in for the store, for tests and redis-less local runs.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, MemoryEntry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        f(&mut entries)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn incr_with_expiry(&self, key: &str, ttl_seconds: u64) -> Result<i64, KvError> {
        self.with_live_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                let count = entry.value.parse::<i64>().unwrap_or(0) + 1;
                entry.value = count.to_string();
                Ok(count)
            } else {
                entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: "1".to_string(),
                        expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
                    },
                );
                Ok(1)
            }
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        self.with_live_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert(MemoryEntry {
                value: "0".to_string(),
                expires_at: None,
            });
            let count = entry.value.parse::<i64>().unwrap_or(0) + delta;
            entry.value = count.to_string();
            Ok(count)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.with_live_entries(|entries| Ok(entries.get(key).map(|entry| entry.value.clone())))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), KvError> {
        self.with_live_entries(|entries| {
            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
                },
            );
            Ok(())
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, KvError> {
        self.with_live_entries(|entries| {
            Ok(entries.get(key).and_then(|entry| {
                entry
                    .expires_at
                    .map(|at| at.saturating_duration_since(Instant::now()).as_secs())
            }))
        })
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, KvError> {
        self.with_live_entries(|entries| {
            let before = entries.len();
            entries.retain(|key, _| !pattern_matches(pattern, key));
            Ok((before - entries.len()) as u64)
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        self.with_live_entries(|entries| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|key| pattern_matches(pattern, key))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}

/// Glob matching restricted to `*` wildcards, the only class the gateway's
/// key patterns use.
fn pattern_matches(pattern: &str, key: &str) -> bool {
    let mut segments = pattern.split('*');
    let Some(first) = segments.next() else {
        return pattern == key;
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };
    let mut segments = segments.peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            return segment.is_empty() || rest.ends_with(segment);
        }
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }
    rest.is_empty()
}
