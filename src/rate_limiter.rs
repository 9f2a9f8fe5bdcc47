//! Two-tier rate limiting
//!
//! The minute tier is an atomic counter per (client, minute bucket) in the
//! shared cache. The daily tier counts the client's logged requests for the
//! current UTC day, optionally cached for a few seconds.

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::cache::GatewayCache;
use crate::credentials::ClientCredential;
use crate::store::{day_key, AccessLogStore};

pub const DEFAULT_MINUTE_BUCKET: Duration = Duration::from_secs(60);
pub const DEFAULT_DAILY_COUNT_TTL: Duration = Duration::from_secs(5);

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitTier {
    Minute,
    Daily,
}

impl fmt::Display for LimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitTier::Minute => f.write_str("minute"),
            LimitTier::Daily => f.write_str("daily"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited {
        tier: LimitTier,
        retry_after_secs: u64,
    },
}

pub struct RateLimiter {
    cache: Arc<dyn GatewayCache>,
    logs: Arc<dyn AccessLogStore>,
    bucket: Duration,
    daily_count_ttl: Duration,
}

impl RateLimiter {
    pub fn new(
        cache: Arc<dyn GatewayCache>,
        logs: Arc<dyn AccessLogStore>,
        bucket: Duration,
        daily_count_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            logs,
            bucket: if bucket.is_zero() {
                DEFAULT_MINUTE_BUCKET
            } else {
                bucket
            },
            daily_count_ttl,
        }
    }

    pub fn with_defaults(cache: Arc<dyn GatewayCache>, logs: Arc<dyn AccessLogStore>) -> Self {
        Self::new(cache, logs, DEFAULT_MINUTE_BUCKET, DEFAULT_DAILY_COUNT_TTL)
    }

    fn bucket_secs(&self) -> i64 {
        self.bucket.as_secs().max(1) as i64
    }

    /// Counter key for the bucket containing `now`
    pub fn minute_key(&self, client_id: i64, now: DateTime<Utc>) -> String {
        format!(
            "rl:{}:{}",
            client_id,
            now.timestamp().div_euclid(self.bucket_secs())
        )
    }

    pub fn daily_key(client_id: i64, now: DateTime<Utc>) -> String {
        format!("daily:{}:{}", client_id, day_key(now.date_naive()))
    }

    /// Run both tiers, minute first
    pub async fn check(&self, credential: &ClientCredential, now: DateTime<Utc>) -> RateLimitDecision {
        if let Some(decision) = self.check_minute(credential, now).await {
            return decision;
        }
        if let Some(decision) = self.check_daily(credential, now).await {
            return decision;
        }
        RateLimitDecision::Allowed
    }

    async fn check_minute(
        &self,
        credential: &ClientCredential,
        now: DateTime<Utc>,
    ) -> Option<RateLimitDecision> {
        let key = self.minute_key(credential.id, now);
        let count = match self.cache.increment(&key, self.bucket).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    "Minute counter unavailable for client {}, allowing: {}",
                    credential.id, e
                );
                return None;
            }
        };

        let before = count.saturating_sub(1);
        if before < u64::from(credential.rate_limit_per_minute) {
            return None;
        }

        let bucket = self.bucket_secs();
        let elapsed = now.timestamp().rem_euclid(bucket);
        Some(RateLimitDecision::Limited {
            tier: LimitTier::Minute,
            retry_after_secs: (bucket - elapsed) as u64,
        })
    }

    async fn check_daily(
        &self,
        credential: &ClientCredential,
        now: DateTime<Utc>,
    ) -> Option<RateLimitDecision> {
        let count = match self.daily_count(credential.id, now).await {
            Some(count) => count,
            None => return None,
        };

        if count < u64::from(credential.daily_request_limit) {
            return None;
        }

        let elapsed = u64::from(now.num_seconds_from_midnight());
        Some(RateLimitDecision::Limited {
            tier: LimitTier::Daily,
            retry_after_secs: SECONDS_PER_DAY - elapsed,
        })
    }

    /// Requests logged today; `None` when the log store cannot answer
    async fn daily_count(&self, client_id: i64, now: DateTime<Utc>) -> Option<u64> {
        let key = Self::daily_key(client_id, now);

        if !self.daily_count_ttl.is_zero() {
            match self.cache.get(&key).await {
                Ok(Some(bytes)) => {
                    if let Some(count) = std::str::from_utf8(&bytes)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                    {
                        debug!("Daily count for client {} from cache: {}", client_id, count);
                        return Some(count);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Daily count cache unavailable: {}", e),
            }
        }

        let count = match self.logs.count_for_day(client_id, now.date_naive()).await {
            Ok(count) => count,
            Err(e) => {
                error!(
                    "Daily count query failed for client {}, allowing: {}",
                    client_id, e
                );
                return None;
            }
        };

        if !self.daily_count_ttl.is_zero() {
            if let Err(e) = self
                .cache
                .set(&key, count.to_string().as_bytes(), self.daily_count_ttl)
                .await
            {
                warn!("Failed to cache daily count: {}", e);
            }
        }

        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_log::NewAccessLogEntry;
    use crate::cache::MemoryCache;
    use crate::clock::{Clock, ManualClock};
    use crate::credentials::{KeyPair, NewClient};
    use crate::access_log::AccessLogEntry;
    use crate::error::{CacheError, StoreError};
    use crate::store::{CredentialStore, GatewayStore};
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};

    struct DownCache;

    #[async_trait]
    impl GatewayCache for DownCache {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Backend("connection reset".to_string()))
        }

        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection reset".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection reset".to_string()))
        }

        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, CacheError> {
            Err(CacheError::Backend("connection reset".to_string()))
        }
    }

    struct DownLogs;

    #[async_trait]
    impl AccessLogStore for DownLogs {
        async fn append(&self, _entry: &NewAccessLogEntry) -> Result<i64, StoreError> {
            Err(StoreError::Database("database is locked".to_string()))
        }

        async fn count_for_day(&self, _client_id: i64, _day: NaiveDate) -> Result<u64, StoreError> {
            Err(StoreError::Database("database is locked".to_string()))
        }

        async fn recent_for_client(
            &self,
            _client_id: i64,
            _limit: usize,
        ) -> Result<Vec<AccessLogEntry>, StoreError> {
            Err(StoreError::Database("database is locked".to_string()))
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<GatewayStore>,
        limiter: RateLimiter,
    }

    fn fixture(start: DateTime<Utc>, daily_ttl: Duration) -> Fixture {
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(GatewayStore::in_memory().unwrap());
        let cache = Arc::new(MemoryCache::with_clock(clock.clone()));
        let limiter = RateLimiter::new(cache, store.clone(), DEFAULT_MINUTE_BUCKET, daily_ttl);
        Fixture {
            clock,
            store,
            limiter,
        }
    }

    async fn client(store: &GatewayStore, per_minute: u32, per_day: u32) -> ClientCredential {
        let mut new_client = NewClient::named("pharmacy-chain");
        new_client.rate_limit_per_minute = per_minute;
        new_client.daily_request_limit = per_day;
        store
            .insert_client(&new_client, &KeyPair::generate(), "admin", Utc::now())
            .await
            .unwrap()
    }

    async fn log(store: &GatewayStore, client_id: i64, status: u16, at: DateTime<Utc>) {
        store
            .append(&NewAccessLogEntry {
                client_id: Some(client_id),
                endpoint: "/patients/".to_string(),
                method: "GET".to_string(),
                ip_address: "10.1.1.1".to_string(),
                user_agent: String::new(),
                request_body: String::new(),
                status_code: status,
                response_time_ms: 1.0,
                created_at: at,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_minute_limit_and_rollover() {
        // 10 seconds into a minute
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 9, 15, 10).unwrap();
        let f = fixture(start, Duration::ZERO);
        let c = client(&f.store, 3, 10_000).await;

        for _ in 0..3 {
            assert_eq!(f.limiter.check(&c, f.clock.now()).await, RateLimitDecision::Allowed);
        }
        assert_eq!(
            f.limiter.check(&c, f.clock.now()).await,
            RateLimitDecision::Limited {
                tier: LimitTier::Minute,
                retry_after_secs: 50
            }
        );

        f.clock.advance_secs(50);
        assert_eq!(f.limiter.check(&c, f.clock.now()).await, RateLimitDecision::Allowed);
    }

    #[tokio::test]
    async fn test_concurrent_requests_respect_minute_limit() {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 9, 15, 0).unwrap();
        let f = fixture(start, Duration::ZERO);
        let c = client(&f.store, 5, 10_000).await;
        let limiter = Arc::new(f.limiter);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let c = c.clone();
            let now = f.clock.now();
            handles.push(tokio::spawn(async move { limiter.check(&c, now).await }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() == RateLimitDecision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn test_daily_limit() {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 23, 0, 0).unwrap();
        let f = fixture(start, Duration::ZERO);
        let c = client(&f.store, 1000, 3).await;

        for _ in 0..3 {
            assert_eq!(f.limiter.check(&c, f.clock.now()).await, RateLimitDecision::Allowed);
            log(&f.store, c.id, 200, f.clock.now()).await;
        }
        assert_eq!(
            f.limiter.check(&c, f.clock.now()).await,
            RateLimitDecision::Limited {
                tier: LimitTier::Daily,
                retry_after_secs: 3600
            }
        );

        // Next UTC day starts a fresh count
        f.clock.advance_secs(3600);
        assert_eq!(f.limiter.check(&c, f.clock.now()).await, RateLimitDecision::Allowed);
    }

    #[tokio::test]
    async fn test_rate_limited_rows_do_not_count_toward_daily() {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap();
        let f = fixture(start, Duration::ZERO);
        let c = client(&f.store, 1000, 2).await;

        log(&f.store, c.id, 200, f.clock.now()).await;
        log(&f.store, c.id, 429, f.clock.now()).await;
        log(&f.store, c.id, 429, f.clock.now()).await;

        assert_eq!(f.limiter.check(&c, f.clock.now()).await, RateLimitDecision::Allowed);
    }

    #[tokio::test]
    async fn test_cached_daily_count_self_corrects() {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap();
        let f = fixture(start, Duration::from_secs(5));
        let c = client(&f.store, 1000, 1).await;

        assert_eq!(f.limiter.check(&c, f.clock.now()).await, RateLimitDecision::Allowed);
        log(&f.store, c.id, 200, f.clock.now()).await;

        // Stale cached count admits one more request inside the window
        assert_eq!(f.limiter.check(&c, f.clock.now()).await, RateLimitDecision::Allowed);

        f.clock.advance_secs(6);
        assert!(matches!(
            f.limiter.check(&c, f.clock.now()).await,
            RateLimitDecision::Limited {
                tier: LimitTier::Daily,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_keys() {
        let f = fixture(Utc::now(), Duration::ZERO);
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 0, 1, 30).unwrap();
        assert_eq!(
            f.limiter.minute_key(9, at),
            format!("rl:9:{}", at.timestamp() / 60)
        );
        assert_eq!(RateLimiter::daily_key(9, at), "daily:9:2026-05-04");
    }

    #[tokio::test]
    async fn test_minute_tier_fails_open_when_cache_is_down() {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let store = Arc::new(GatewayStore::in_memory().unwrap());
        let limiter = RateLimiter::new(
            Arc::new(DownCache),
            store.clone(),
            DEFAULT_MINUTE_BUCKET,
            Duration::from_secs(5),
        );
        let c = client(&store, 1, 10_000).await;

        for _ in 0..5 {
            assert_eq!(limiter.check(&c, clock.now()).await, RateLimitDecision::Allowed);
        }
    }

    #[tokio::test]
    async fn test_daily_tier_still_enforced_when_cache_is_down() {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let store = Arc::new(GatewayStore::in_memory().unwrap());
        let limiter = RateLimiter::new(
            Arc::new(DownCache),
            store.clone(),
            DEFAULT_MINUTE_BUCKET,
            Duration::from_secs(5),
        );
        let c = client(&store, 1000, 2).await;

        log(&store, c.id, 200, clock.now()).await;
        log(&store, c.id, 200, clock.now()).await;

        assert_eq!(
            limiter.check(&c, clock.now()).await,
            RateLimitDecision::Limited {
                tier: LimitTier::Daily,
                retry_after_secs: 15 * 3600
            }
        );
    }

    #[tokio::test]
    async fn test_daily_tier_fails_open_when_log_store_is_down() {
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = GatewayStore::in_memory().unwrap();
        let limiter = RateLimiter::new(
            Arc::new(MemoryCache::with_clock(clock.clone())),
            Arc::new(DownLogs),
            DEFAULT_MINUTE_BUCKET,
            Duration::ZERO,
        );
        let c = client(&store, 2, 1).await;

        assert_eq!(limiter.check(&c, clock.now()).await, RateLimitDecision::Allowed);
        assert_eq!(limiter.check(&c, clock.now()).await, RateLimitDecision::Allowed);

        // The minute tier keeps working
        assert_eq!(
            limiter.check(&c, clock.now()).await,
            RateLimitDecision::Limited {
                tier: LimitTier::Minute,
                retry_after_secs: 60
            }
        );
    }
}
