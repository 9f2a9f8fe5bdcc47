use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::GatewayError;

/// Gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub access_log: AccessLogConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the gateway listens on
    pub listen_addr: String,
    /// Address the admin API listens on
    pub admin_listen_addr: String,
    /// Base URL of the resource service behind the gateway
    pub upstream_url: String,
    /// Prefix stripped before permission resolution
    pub mount_prefix: String,
    pub max_body_bytes: usize,
    /// Take the caller IP from X-Forwarded-For instead of the TCP peer
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub replay_window_secs: u64,
    pub credential_cache_ttl_secs: u64,
    /// 0 disables negative caching
    pub negative_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub minute_bucket_secs: u64,
    /// 0 queries the access log on every request
    pub daily_count_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    pub body_limit_chars: usize,
    pub queue_capacity: usize,
    /// Also log requests rejected before reaching the upstream
    pub log_rejected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for the admin API; empty disables it
    pub token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            admin_listen_addr: "127.0.0.1:8081".to_string(),
            upstream_url: "http://127.0.0.1:8000".to_string(),
            mount_prefix: "/api/external".to_string(),
            max_body_bytes: 1024 * 1024,
            trust_forwarded_for: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: 300,
            credential_cache_ttl_secs: 300,
            negative_cache_ttl_secs: 5,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            minute_bucket_secs: 60,
            daily_count_cache_ttl_secs: 5,
        }
    }
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            body_limit_chars: 1000,
            queue_capacity: 10_000,
            log_rejected: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/gateway.db"),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl AuthConfig {
    pub fn replay_window(&self) -> Duration {
        Duration::from_secs(self.replay_window_secs)
    }

    pub fn credential_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_cache_ttl_secs)
    }

    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_cache_ttl_secs)
    }
}

impl RateLimitConfig {
    pub fn minute_bucket(&self) -> Duration {
        Duration::from_secs(self.minute_bucket_secs)
    }

    pub fn daily_count_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.daily_count_cache_ttl_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, GatewayError> {
        toml::from_str(contents).map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), GatewayError> {
        let contents =
            toml::to_string_pretty(&self).map_err(|e| GatewayError::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, GatewayError> {
        parse_addr("server.listen_addr", &self.server.listen_addr)
    }

    pub fn admin_listen_addr(&self) -> Result<SocketAddr, GatewayError> {
        parse_addr("server.admin_listen_addr", &self.server.admin_listen_addr)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), GatewayError> {
        self.listen_addr()?;
        self.admin_listen_addr()?;

        let upstream = url::Url::parse(&self.server.upstream_url).map_err(|e| {
            GatewayError::Config(format!("Invalid server.upstream_url: {}", e))
        })?;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err(GatewayError::Config(format!(
                "Invalid server.upstream_url scheme: {}",
                upstream.scheme()
            )));
        }

        if !self.server.mount_prefix.is_empty() && !self.server.mount_prefix.starts_with('/') {
            return Err(GatewayError::Config(
                "Invalid server.mount_prefix: must start with '/'".to_string(),
            ));
        }

        if self.server.max_body_bytes == 0 {
            return Err(invalid("server.max_body_bytes"));
        }
        if self.auth.replay_window_secs == 0 {
            return Err(invalid("auth.replay_window_secs"));
        }
        if self.auth.credential_cache_ttl_secs == 0 {
            return Err(invalid("auth.credential_cache_ttl_secs"));
        }
        if self.auth.negative_cache_ttl_secs.saturating_mul(10) > self.auth.credential_cache_ttl_secs {
            return Err(GatewayError::Config(
                "Invalid auth.negative_cache_ttl_secs: must be at most a tenth of credential_cache_ttl_secs"
                    .to_string(),
            ));
        }
        if self.rate_limit.minute_bucket_secs == 0 {
            return Err(invalid("rate_limit.minute_bucket_secs"));
        }
        if self.access_log.body_limit_chars == 0 {
            return Err(invalid("access_log.body_limit_chars"));
        }
        if self.access_log.queue_capacity == 0 {
            return Err(invalid("access_log.queue_capacity"));
        }
        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_empty() {
            return Err(GatewayError::Config(
                "Invalid cache.redis_url: required for the redis backend".to_string(),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str) -> GatewayError {
    GatewayError::Config(format!("Invalid {}: must be > 0", field))
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, GatewayError> {
    value
        .parse()
        .map_err(|e| GatewayError::Config(format!("Invalid {} '{}': {}", field, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.mount_prefix, "/api/external");
        assert_eq!(config.server.max_body_bytes, 1024 * 1024);
        assert!(!config.server.trust_forwarded_for);
        assert_eq!(config.auth.replay_window_secs, 300);
        assert_eq!(config.auth.credential_cache_ttl_secs, 300);
        assert_eq!(config.auth.negative_cache_ttl_secs, 5);
        assert_eq!(config.rate_limit.minute_bucket_secs, 60);
        assert_eq!(config.access_log.body_limit_chars, 1000);
        assert!(config.access_log.log_rejected);
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert!(config.admin.token.is_empty());
    }

    #[test]
    fn test_config_validation_succeeds() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_fails_zero_window() {
        let mut config = GatewayConfig::default();
        config.auth.replay_window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_ttl_capped() {
        let mut config = GatewayConfig::default();
        config.auth.negative_cache_ttl_secs = 31;
        assert!(config.validate().is_err());

        config.auth.negative_cache_ttl_secs = 30;
        assert!(config.validate().is_ok());

        config.auth.negative_cache_ttl_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_negative_ttl_rejected() {
        let mut config = GatewayConfig::default();
        config.auth.credential_cache_ttl_secs = u64::MAX;
        config.auth.negative_cache_ttl_secs = u64::MAX / 2;
        assert!(config.validate().is_err());

        config.auth.negative_cache_ttl_secs = u64::MAX / 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_fails_bad_addresses() {
        let mut config = GatewayConfig::default();
        config.server.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.server.upstream_url = "ftp://files.example".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [server]
            upstream_url = "http://10.0.0.5:9000"

            [rate_limit]
            daily_count_cache_ttl_secs = 0

            [cache]
            backend = "redis"
            redis_url = "redis://cache:6379"
        "#;

        let config = GatewayConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.server.upstream_url, "http://10.0.0.5:9000");
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.rate_limit.daily_count_cache_ttl(), Duration::ZERO);
        assert_eq!(config.cache.backend, CacheBackend::Redis);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");

        let mut original = GatewayConfig::default();
        original.admin.token = "s3cret".to_string();
        original.to_file(&path).unwrap();

        let loaded = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(loaded.admin.token, "s3cret");
        assert_eq!(loaded.server.listen_addr, original.server.listen_addr);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            GatewayConfig::from_toml("[server\nlisten_addr = 1"),
            Err(GatewayError::Config(_))
        ));
    }
}
