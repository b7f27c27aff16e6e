//! Ephemeral key/value store used for WebAuthn challenges, idempotency
//! records and rate-limit counters. Backed by Redis when a URL is
//! configured, otherwise by an in-process map (tests, local dev).

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use redis::aio::MultiplexedConnection;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
    #[error("kv serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        KvError::Backend(err.to_string())
    }
}

pub type KvResult<T> = Result<T, KvError>;

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Clone)]
enum KvBackend {
    Memory(Arc<Mutex<HashMap<String, MemoryEntry>>>),
    Redis(redis::Client),
}

#[derive(Clone)]
pub struct Kv {
    backend: KvBackend,
}

impl Kv {
    pub fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            backend: KvBackend::Redis(client),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: KvBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    async fn conn(client: &redis::Client) -> KvResult<MultiplexedConnection> {
        Ok(client.get_multiplexed_async_connection().await?)
    }

    pub async fn get(&self, key: &str) -> KvResult<Option<String>> {
        match &self.backend {
            KvBackend::Memory(inner) => {
                let mut guard = inner.lock().await;
                match guard.get(key) {
                    Some(entry) if entry.expired() => {
                        guard.remove(key);
                        Ok(None)
                    }
                    Some(entry) => Ok(Some(entry.value.clone())),
                    None => Ok(None),
                }
            }
            KvBackend::Redis(client) => {
                let mut conn = Self::conn(client).await?;
                let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
                Ok(value)
            }
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        match &self.backend {
            KvBackend::Memory(inner) => {
                let mut guard = inner.lock().await;
                guard.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: value.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                Ok(())
            }
            KvBackend::Redis(client) => {
                let mut conn = Self::conn(client).await?;
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(())
            }
        }
    }

    /// Atomic set-if-absent with TTL. Returns true when the key was claimed.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        match &self.backend {
            KvBackend::Memory(inner) => {
                let mut guard = inner.lock().await;
                if guard.get(key).is_some_and(|entry| !entry.expired()) {
                    return Ok(false);
                }
                guard.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: value.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                Ok(true)
            }
            KvBackend::Redis(client) => {
                let mut conn = Self::conn(client).await?;
                let set: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await?;
                Ok(set.is_some())
            }
        }
    }

    /// Fetch-and-delete. A second concurrent caller observes a miss.
    pub async fn get_del(&self, key: &str) -> KvResult<Option<String>> {
        match &self.backend {
            KvBackend::Memory(inner) => {
                let mut guard = inner.lock().await;
                match guard.remove(key) {
                    Some(entry) if entry.expired() => Ok(None),
                    Some(entry) => Ok(Some(entry.value)),
                    None => Ok(None),
                }
            }
            KvBackend::Redis(client) => {
                let mut conn = Self::conn(client).await?;
                let value: Option<String> =
                    redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
                Ok(value)
            }
        }
    }

    pub async fn del(&self, key: &str) -> KvResult<()> {
        match &self.backend {
            KvBackend::Memory(inner) => {
                inner.lock().await.remove(key);
                Ok(())
            }
            KvBackend::Redis(client) => {
                let mut conn = Self::conn(client).await?;
                redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
                Ok(())
            }
        }
    }

    /// Increment a counter, arming the window TTL on first increment.
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> KvResult<i64> {
        match &self.backend {
            KvBackend::Memory(inner) => {
                let mut guard = inner.lock().await;
                let fresh = match guard.get(key) {
                    Some(entry) if !entry.expired() => {
                        entry.value.parse::<i64>().unwrap_or(0) + 1
                    }
                    _ => 1,
                };
                let expires_at = if fresh == 1 {
                    Some(Instant::now() + ttl)
                } else {
                    guard.get(key).and_then(|entry| entry.expires_at)
                };
                guard.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: fresh.to_string(),
                        expires_at,
                    },
                );
                Ok(fresh)
            }
            KvBackend::Redis(client) => {
                let mut conn = Self::conn(client).await?;
                let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
                if count == 1 {
                    redis::cmd("PEXPIRE")
                        .arg(key)
                        .arg(ttl.as_millis() as u64)
                        .query_async::<_, ()>(&mut conn)
                        .await?;
                }
                Ok(count)
            }
        }
    }

    /// Write one key and delete another in a single atomic step
    /// (idempotency cache publish + lock release).
    pub async fn set_ex_and_del(
        &self,
        set_key: &str,
        value: &str,
        ttl: Duration,
        del_key: &str,
    ) -> KvResult<()> {
        match &self.backend {
            KvBackend::Memory(inner) => {
                let mut guard = inner.lock().await;
                guard.insert(
                    set_key.to_string(),
                    MemoryEntry {
                        value: value.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                guard.remove(del_key);
                Ok(())
            }
            KvBackend::Redis(client) => {
                let mut conn = Self::conn(client).await?;
                redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(set_key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .ignore()
                    .cmd("DEL")
                    .arg(del_key)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> KvResult<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json_ex<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> KvResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set_ex(key, &raw, ttl).await
    }

    pub async fn get_del_json<T: DeserializeOwned>(&self, key: &str) -> KvResult<Option<T>> {
        match self.get_del(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded")]
    Exceeded,
    #[error(transparent)]
    Store(#[from] KvError),
}

/// Fixed-window counter. The window starts at the first hit and is never
/// slid; exhausted windows are not refunded on downstream failure.
#[derive(Clone)]
pub struct RateLimiter {
    kv: Kv,
}

impl RateLimiter {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub async fn consume(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<(), RateLimitError> {
        let count = self.kv.incr_with_ttl(key, window).await?;
        if count > limit {
            tracing::debug!(key, count, limit, "rate limit exceeded");
            return Err(RateLimitError::Exceeded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip_and_expiry() {
        let kv = Kv::in_memory();
        kv.set_ex("k", "v", Duration::from_millis(40)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_claims_only_once() {
        let kv = Kv::in_memory();
        assert!(kv.set_nx_ex("lock", "1", Duration::from_secs(30)).await.unwrap());
        assert!(!kv.set_nx_ex("lock", "1", Duration::from_secs(30)).await.unwrap());
        kv.del("lock").await.unwrap();
        assert!(kv.set_nx_ex("lock", "1", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn get_del_is_one_shot() {
        let kv = Kv::in_memory();
        kv.set_ex("challenge", "state", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            kv.get_del("challenge").await.unwrap().as_deref(),
            Some("state")
        );
        assert_eq!(kv.get_del("challenge").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counter_resets_after_window() {
        let kv = Kv::in_memory();
        assert_eq!(kv.incr_with_ttl("c", Duration::from_millis(40)).await.unwrap(), 1);
        assert_eq!(kv.incr_with_ttl("c", Duration::from_millis(40)).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kv.incr_with_ttl("c", Duration::from_millis(40)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rate_limiter_blocks_over_limit() {
        let limiter = RateLimiter::new(Kv::in_memory());
        for _ in 0..5 {
            limiter
                .consume("rl:login:a@x:127.0.0.1", 5, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let denied = limiter
            .consume("rl:login:a@x:127.0.0.1", 5, Duration::from_secs(60))
            .await;
        assert!(matches!(denied, Err(RateLimitError::Exceeded)));
    }

    #[tokio::test]
    async fn set_ex_and_del_publishes_and_releases() {
        let kv = Kv::in_memory();
        kv.set_ex("lock", "1", Duration::from_secs(30)).await.unwrap();
        kv.set_ex_and_del("cache", "entry", Duration::from_secs(60), "lock")
            .await
            .unwrap();
        assert_eq!(kv.get("cache").await.unwrap().as_deref(), Some("entry"));
        assert_eq!(kv.get("lock").await.unwrap(), None);
    }
}
