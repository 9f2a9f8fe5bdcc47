//! Credential cache
//!
//! Cache-aside lookup of client credentials by public key. Hits are served
//! for the positive TTL, so a deactivation that bypasses [`CredentialCache::invalidate`]
//! takes effect within that TTL at the latest. Unknown keys may be remembered
//! for a much shorter negative TTL to blunt key-scanning.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::GatewayCache;
use crate::credentials::{key_prefix, ClientCredential};
use crate::error::{CacheError, StoreError};
use crate::store::CredentialStore;

pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(5);

/// Stored in place of a credential for keys known not to exist
const NEGATIVE_SENTINEL: &[u8] = b"-";

/// Result of consulting the cache alone
#[derive(Debug, Clone, PartialEq)]
pub enum CachedCredential {
    Hit(ClientCredential),
    /// Recently looked up and not found
    KnownMissing,
    Miss,
}

pub struct CredentialCache {
    cache: Arc<dyn GatewayCache>,
    ttl: Duration,
    negative_ttl: Duration,
}

impl CredentialCache {
    pub fn new(cache: Arc<dyn GatewayCache>, ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            negative_ttl,
        }
    }

    pub fn with_defaults(cache: Arc<dyn GatewayCache>) -> Self {
        Self::new(cache, DEFAULT_CREDENTIAL_TTL, DEFAULT_NEGATIVE_TTL)
    }

    pub fn cache_key(public_key: &str) -> String {
        format!("cred:{}", public_key)
    }

    /// Consult the cache only
    pub async fn lookup(&self, public_key: &str) -> Result<CachedCredential, CacheError> {
        let bytes = match self.cache.get(&Self::cache_key(public_key)).await? {
            Some(bytes) => bytes,
            None => return Ok(CachedCredential::Miss),
        };

        if bytes == NEGATIVE_SENTINEL {
            return Ok(CachedCredential::KnownMissing);
        }

        let credential = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(CachedCredential::Hit(credential))
    }

    pub async fn store(&self, credential: &ClientCredential) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(credential)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.cache
            .set(&Self::cache_key(&credential.public_key), &bytes, self.ttl)
            .await
    }

    pub async fn store_missing(&self, public_key: &str) -> Result<(), CacheError> {
        if self.negative_ttl.is_zero() {
            return Ok(());
        }
        self.cache
            .set(&Self::cache_key(public_key), NEGATIVE_SENTINEL, self.negative_ttl)
            .await
    }

    pub async fn invalidate(&self, public_key: &str) {
        if let Err(e) = self.cache.delete(&Self::cache_key(public_key)).await {
            warn!(
                "Failed to invalidate cached credential {}: {}",
                key_prefix(public_key),
                e
            );
        }
    }

    /// Resolve a public key through the cache, falling back to the store.
    ///
    /// Cache failures degrade to a store lookup. Store failures propagate.
    pub async fn resolve(
        &self,
        public_key: &str,
        store: &dyn CredentialStore,
    ) -> Result<Option<ClientCredential>, StoreError> {
        match self.lookup(public_key).await {
            Ok(CachedCredential::Hit(credential)) => return Ok(Some(credential)),
            Ok(CachedCredential::KnownMissing) => return Ok(None),
            Ok(CachedCredential::Miss) => {}
            Err(e) => warn!(
                "Credential cache unavailable for {}, using store: {}",
                key_prefix(public_key),
                e
            ),
        }

        debug!("Credential cache miss for {}", key_prefix(public_key));
        let found = store.find_by_public_key(public_key).await?;

        let populated = match &found {
            Some(credential) => self.store(credential).await,
            None => self.store_missing(public_key).await,
        };
        if let Err(e) = populated {
            warn!(
                "Failed to populate credential cache for {}: {}",
                key_prefix(public_key),
                e
            );
        }

        Ok(found)
    }
}
