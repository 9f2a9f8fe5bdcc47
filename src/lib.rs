// Library interface for the HMS external API gateway
// Exposes the request pipeline, storage and admin surface for the binary and tests

pub mod access_log;
pub mod admin;
pub mod admin_api;
pub mod app;
pub mod authenticator;
pub mod cache;
pub mod clock;
pub mod config;
pub mod credential_cache;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod lock_utils;
pub mod permissions;
pub mod rate_limiter;
pub mod replay_guard;
pub mod response;
pub mod signature;
pub mod store;
pub mod webhooks;

pub use app::GatewayApp;
pub use config::GatewayConfig;
pub use error::{AuthError, CacheError, GatewayError, StoreError};
pub use gateway::{Decision, Gateway};
