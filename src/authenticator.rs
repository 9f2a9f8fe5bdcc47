//! Request authentication
//!
//! Authenticators either claim a request (success or hard failure) or
//! abstain, letting the next scheme in an [`AuthPipeline`] try.

use async_trait::async_trait;
use hyper::{HeaderMap, Method};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::credential_cache::CredentialCache;
use crate::credentials::{key_prefix, ClientCredential};
use crate::error::AuthError;
use crate::replay_guard::ReplayGuard;
use crate::signature::verify_signature;
use crate::store::CredentialStore;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// A fully buffered inbound request
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Path exactly as received, without the query string
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub client_ip: IpAddr,
    pub user_agent: String,
}

impl InboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// No opinion, required headers absent
    Abstain,
    Authenticated(ClientCredential),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self, request: &InboundRequest) -> Result<AuthOutcome, AuthError>;
}

/// Shared-secret signed request scheme
pub struct SignedRequestAuthenticator {
    credentials: Arc<CredentialCache>,
    store: Arc<dyn CredentialStore>,
    replay_guard: ReplayGuard,
    clock: Arc<dyn Clock>,
}

impl SignedRequestAuthenticator {
    pub fn new(
        credentials: Arc<CredentialCache>,
        store: Arc<dyn CredentialStore>,
        replay_guard: ReplayGuard,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            credentials,
            store,
            replay_guard,
            clock,
        }
    }
}

/// Header value as text; `Err` when present but not visible ASCII
fn header_text<'a>(
    headers: &'a HeaderMap,
    name: &str,
    invalid: AuthError,
) -> Result<Option<&'a str>, AuthError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value.to_str().map(Some).map_err(|_| invalid),
    }
}

#[async_trait]
impl Authenticator for SignedRequestAuthenticator {
    fn name(&self) -> &'static str {
        "signed-request"
    }

    async fn authenticate(&self, request: &InboundRequest) -> Result<AuthOutcome, AuthError> {
        let headers = &request.headers;
        let api_key = header_text(headers, API_KEY_HEADER, AuthError::InvalidApiKey)?;
        let signature = header_text(headers, SIGNATURE_HEADER, AuthError::InvalidSignature)?;
        let timestamp = header_text(headers, TIMESTAMP_HEADER, AuthError::InvalidTimestamp)?;

        let (api_key, signature, timestamp) = match (api_key, signature, timestamp) {
            (Some(k), Some(s), Some(t)) => (k, s, t),
            _ => return Ok(AuthOutcome::Abstain),
        };

        self.replay_guard
            .check(timestamp, self.clock.unix_seconds())?;

        let credential = self
            .credentials
            .resolve(api_key, self.store.as_ref())
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        // Inactive clients are indistinguishable from unknown ones
        let credential = match credential {
            Some(c) if c.is_active => c,
            _ => {
                debug!("No active client for key {}", key_prefix(api_key));
                return Err(AuthError::InvalidApiKey);
            }
        };

        if !verify_signature(
            &credential.secret,
            request.method.as_str(),
            &request.path,
            timestamp,
            &request.body,
            signature,
        ) {
            return Err(AuthError::InvalidSignature);
        }

        Ok(AuthOutcome::Authenticated(credential))
    }
}

/// Ordered list of authentication schemes
#[derive(Default)]
pub struct AuthPipeline {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl AuthPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticators.push(authenticator);
        self
    }

    pub fn len(&self) -> usize {
        self.authenticators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }

    /// First non-abstaining authenticator decides
    pub async fn authenticate(&self, request: &InboundRequest) -> Result<AuthOutcome, AuthError> {
        for authenticator in &self.authenticators {
            match authenticator.authenticate(request).await? {
                AuthOutcome::Abstain => {
                    debug!("Authenticator {} abstained", authenticator.name());
                }
                outcome => return Ok(outcome),
            }
        }
        Ok(AuthOutcome::Abstain)
    }
}
