//! Gateway error taxonomy
//!
//! Authentication failures carry a precise reason for logs only. Callers
//! always receive the same 401 body regardless of which check failed.

use thiserror::Error;

/// Reasons a signed request fails authentication
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid timestamp")]
    InvalidTimestamp,

    #[error("Expired timestamp")]
    ExpiredTimestamp,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Invalid signature")]
    InvalidSignature,

    /// The credential store could not be consulted
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref err, _) = e {
            if err.code == rusqlite::ErrorCode::ConstraintViolation {
                return StoreError::Conflict(e.to_string());
            }
        }
        StoreError::Database(e.to_string())
    }
}

/// Cache backend errors
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Top-level gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Server error: {0}")]
    Server(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_messages() {
        assert_eq!(AuthError::InvalidTimestamp.to_string(), "Invalid timestamp");
        assert_eq!(AuthError::ExpiredTimestamp.to_string(), "Expired timestamp");
        assert_eq!(AuthError::InvalidApiKey.to_string(), "Invalid API key");
        assert_eq!(AuthError::InvalidSignature.to_string(), "Invalid signature");
    }

    #[test]
    fn test_constraint_violation_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (v TEXT UNIQUE)", []).unwrap();
        conn.execute("INSERT INTO t (v) VALUES ('a')", []).unwrap();
        let err = conn
            .execute("INSERT INTO t (v) VALUES ('a')", [])
            .unwrap_err();

        assert!(matches!(StoreError::from(err), StoreError::Conflict(_)));
    }

    #[test]
    fn test_gateway_error_from_store() {
        let err: GatewayError = StoreError::NotFound("client 7".to_string()).into();
        assert_eq!(err.to_string(), "Not found: client 7");
    }
}
