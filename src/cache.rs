//! Shared TTL cache used for credential lookups and minute counters
//!
//! Two backends implement [`GatewayCache`]:
//! - [`MemoryCache`]: process-local, expiry driven by the injected [`Clock`]
//! - [`RedisCache`]: DragonflyDB/Redis, shared between gateway replicas

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::CacheError;
use crate::lock_utils::lock_or_recover;

/// Purge expired memory entries every this many operations
const PURGE_EVERY_OPS: u64 = 1024;

/// Key/value cache with expiry and an atomic counter primitive
#[async_trait]
pub trait GatewayCache: Send + Sync {
    /// Get a value, `None` when missing or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Set a value with TTL
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Delete a key (missing keys are not an error)
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Atomically increment a counter and return the post-increment value.
    ///
    /// The TTL is applied when the increment creates the key; later
    /// increments leave the expiry untouched.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CacheError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at_ms: i64,
}

/// In-process cache
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
    ops: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            ops: AtomicU64::new(0),
        }
    }

    /// Number of live (non-expired) keys
    pub fn len(&self) -> usize {
        let now = self.now_ms();
        let entries = lock_or_recover(&self.entries, "memory cache");
        entries.values().filter(|e| e.expires_at_ms > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expiry(&self, ttl: Duration) -> i64 {
        self.now_ms() + ttl.as_millis() as i64
    }

    fn maybe_purge(&self, entries: &mut HashMap<String, MemoryEntry>, now: i64) {
        if self.ops.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY_OPS != 0 {
            return;
        }
        let before = entries.len();
        entries.retain(|_, e| e.expires_at_ms > now);
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = self.now_ms();
        let entries = lock_or_recover(&self.entries, "memory cache");
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at_ms > now)
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let now = self.now_ms();
        let expires_at_ms = self.expiry(ttl);
        let mut entries = lock_or_recover(&self.entries, "memory cache");
        self.maybe_purge(&mut entries, now);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = lock_or_recover(&self.entries, "memory cache");
        entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        let now = self.now_ms();
        let expires_at_ms = self.expiry(ttl);
        let mut entries = lock_or_recover(&self.entries, "memory cache");
        self.maybe_purge(&mut entries, now);

        let live = entries.get(key).filter(|e| e.expires_at_ms > now);
        let (count, expires_at_ms) = match live {
            Some(entry) => {
                let current: u64 = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        CacheError::Serialization(format!("key {} is not a counter", key))
                    })?;
                (current + 1, entry.expires_at_ms)
            }
            None => (1, expires_at_ms),
        };

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: count.to_string().into_bytes(),
                expires_at_ms,
            },
        );
        Ok(count)
    }
}

/// Cache backed by DragonflyDB/Redis
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    /// Connect to the server at `redis_url`
    pub async fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

/// Redis rejects a zero expiry
fn redis_ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl GatewayCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(key, value, redis_ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        let mut conn = self.connection.clone();
        // SET NX seeds the counter with its expiry; both run in one MULTI
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("EX")
            .arg(redis_ttl_secs(ttl))
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}
