//! External API gateway
//!
//! Each inbound request is authenticated, rate limited and authorized, then
//! forwarded to the resource service. Exactly one access log entry is queued
//! for every decided request once its final status is known.

use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, RETRY_AFTER, USER_AGENT,
};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, HeaderMap, Request, Response, Server, StatusCode, Uri};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::access_log::{truncate_body, AccessLogger, NewAccessLogEntry};
use crate::authenticator::{
    AuthOutcome, AuthPipeline, InboundRequest, API_KEY_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::credentials::{Access, Capabilities, ClientCredential, Resource};
use crate::error::{AuthError, GatewayError};
use crate::permissions::{resolve_raw, DenyReason, PermissionDecision};
use crate::rate_limiter::{LimitTier, RateLimitDecision, RateLimiter};
use crate::response::{json_error, json_response, ApiResponse};

pub const CLIENT_ID_HEADER: &str = "x-gateway-client-id";
pub const CLIENT_NAME_HEADER: &str = "x-gateway-client-name";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const REAL_IP_HEADER: &str = "x-real-ip";

/// Headers never passed through to the resource service
const STRIPPED_HEADERS: [&str; 7] = [
    API_KEY_HEADER,
    SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
    CLIENT_ID_HEADER,
    CLIENT_NAME_HEADER,
    FORWARDED_FOR_HEADER,
    REAL_IP_HEADER,
];

/// Connection-scoped headers that must not reach the resource service
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request-handling knobs taken from [`GatewayConfig`]
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub mount_prefix: String,
    pub max_body_bytes: usize,
    pub trust_forwarded_for: bool,
    pub body_limit_chars: usize,
    pub log_rejected: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for GatewaySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            mount_prefix: config.server.mount_prefix.clone(),
            max_body_bytes: config.server.max_body_bytes,
            trust_forwarded_for: config.server.trust_forwarded_for,
            body_limit_chars: config.access_log.body_limit_chars,
            log_rejected: config.access_log.log_rejected,
        }
    }
}

/// Identity attached to forwarded requests
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthenticatedClient {
    pub id: i64,
    pub name: String,
    pub key_prefix: String,
    pub capabilities: Capabilities,
    pub resource: Resource,
    pub access: Access,
}

/// Outcome of the authentication, quota and permission checks
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow(AuthenticatedClient),
    /// Every authenticator abstained
    NotProvided,
    Unauthenticated(AuthError),
    /// Credentials could not be checked
    Unavailable,
    RateLimited {
        client_id: i64,
        tier: LimitTier,
        retry_after_secs: u64,
    },
    Forbidden {
        client_id: i64,
        reason: DenyReason,
    },
}

impl Decision {
    pub fn status(&self) -> StatusCode {
        match self {
            Decision::Allow(_) => StatusCode::OK,
            Decision::NotProvided | Decision::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Decision::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Decision::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Decision::Forbidden { .. } => StatusCode::FORBIDDEN,
        }
    }

    /// Authenticated client, if authentication succeeded
    pub fn client_id(&self) -> Option<i64> {
        match self {
            Decision::Allow(client) => Some(client.id),
            Decision::RateLimited { client_id, .. } | Decision::Forbidden { client_id, .. } => {
                Some(*client_id)
            }
            _ => None,
        }
    }

    /// Response for a rejected request
    fn rejection(&self) -> Option<Response<Body>> {
        let response = match self {
            Decision::Allow(_) => return None,
            Decision::NotProvided => json_error(
                StatusCode::UNAUTHORIZED,
                "Authentication credentials were not provided",
            ),
            Decision::Unauthenticated(_) => {
                json_error(StatusCode::UNAUTHORIZED, "Authentication failed")
            }
            Decision::Unavailable => json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable",
            ),
            Decision::RateLimited {
                tier,
                retry_after_secs,
                ..
            } => {
                let mut response = json_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    &ApiResponse {
                        success: false,
                        message: "Rate limit exceeded".to_string(),
                        data: Some(serde_json::json!({
                            "tier": tier,
                            "retry_after": retry_after_secs,
                        })),
                    },
                );
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
                response
            }
            Decision::Forbidden { .. } => json_error(StatusCode::FORBIDDEN, "Permission denied"),
        };
        Some(response)
    }
}

/// The resource service behind the gateway
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, GatewayError>;
}

/// Forwards over HTTP with a hyper client
pub struct HttpUpstream {
    client: Client<HttpConnector>,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, GatewayError> {
        let (mut parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("{}{}", self.base_url, path_and_query)
            .parse()
            .map_err(|e| GatewayError::Upstream(format!("invalid upstream URI: {}", e)))?;
        parts.uri = uri;

        Ok(self.client.request(Request::from_parts(parts, body)).await?)
    }
}

enum BodyError {
    TooLarge,
    Read(hyper::Error),
}

/// Buffer a request body, refusing anything over `limit` bytes
async fn read_body(headers: &HeaderMap, mut body: Body, limit: usize) -> Result<Vec<u8>, BodyError> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.map_or(false, |len| len > limit as u64) {
        return Err(BodyError::TooLarge);
    }

    let mut buffer = Vec::with_capacity(declared.unwrap_or(0).min(limit as u64) as usize);
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if buffer.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

pub struct Gateway {
    settings: GatewaySettings,
    pipeline: AuthPipeline,
    rate_limiter: RateLimiter,
    logger: Arc<AccessLogger>,
    upstream: Arc<dyn Upstream>,
    clock: Arc<dyn Clock>,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        pipeline: AuthPipeline,
        rate_limiter: RateLimiter,
        logger: Arc<AccessLogger>,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            pipeline,
            rate_limiter,
            logger,
            upstream,
            clock,
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn logger(&self) -> &Arc<AccessLogger> {
        &self.logger
    }

    /// Caller address used for logging
    fn client_ip(&self, headers: &HeaderMap, remote_addr: SocketAddr) -> IpAddr {
        if self.settings.trust_forwarded_for {
            let forwarded = headers
                .get(FORWARDED_FOR_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return ip;
            }
        }
        remote_addr.ip()
    }

    /// Run authentication, rate limiting and permission checks
    pub async fn decide(&self, request: &InboundRequest) -> Decision {
        let credential: ClientCredential = match self.pipeline.authenticate(request).await {
            Ok(AuthOutcome::Authenticated(credential)) => credential,
            Ok(AuthOutcome::Abstain) => {
                debug!("No credentials on {} {}", request.method, request.path);
                return Decision::NotProvided;
            }
            Err(AuthError::Unavailable(e)) => {
                error!("Credential lookup failed: {}", e);
                return Decision::Unavailable;
            }
            Err(e) => {
                let key = request
                    .header(API_KEY_HEADER)
                    .map(crate::credentials::key_prefix)
                    .unwrap_or("-");
                warn!(
                    "Authentication failed for key {} from {}: {}",
                    key, request.client_ip, e
                );
                return Decision::Unauthenticated(e);
            }
        };

        if let RateLimitDecision::Limited {
            tier,
            retry_after_secs,
        } = self.rate_limiter.check(&credential, self.clock.now()).await
        {
            warn!(
                "Client {} ({}) exceeded {} rate limit",
                credential.id,
                credential.key_prefix(),
                tier
            );
            return Decision::RateLimited {
                client_id: credential.id,
                tier,
                retry_after_secs,
            };
        }

        match resolve_raw(
            &request.path,
            &self.settings.mount_prefix,
            &request.method,
            &credential.capabilities,
        ) {
            PermissionDecision::Allowed(resource, access) => Decision::Allow(AuthenticatedClient {
                id: credential.id,
                name: credential.name.clone(),
                key_prefix: credential.key_prefix().to_string(),
                capabilities: credential.capabilities,
                resource,
                access,
            }),
            PermissionDecision::Denied(reason) => {
                warn!(
                    "Client {} denied {} {}: {}",
                    credential.id, request.method, request.path, reason
                );
                Decision::Forbidden {
                    client_id: credential.id,
                    reason,
                }
            }
        }
    }

    /// Handle one HTTP request end to end
    pub async fn handle(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let client_ip = self.client_ip(&parts.headers, remote_addr);
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut entry = NewAccessLogEntry {
            client_id: None,
            endpoint: parts.uri.path().to_string(),
            method: parts.method.to_string(),
            ip_address: client_ip.to_string(),
            user_agent: user_agent.clone(),
            request_body: String::new(),
            status_code: 0,
            response_time_ms: 0.0,
            created_at: self.clock.now(),
        };

        let body = match read_body(&parts.headers, body, self.settings.max_body_bytes).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => {
                let response =
                    json_error(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
                self.finish(entry, &response, start, false);
                return response;
            }
            Err(BodyError::Read(e)) => {
                warn!("Failed to read request body from {}: {}", client_ip, e);
                let response = json_error(StatusCode::BAD_REQUEST, "Invalid request body");
                self.finish(entry, &response, start, false);
                return response;
            }
        };
        entry.request_body = truncate_body(&body, self.settings.body_limit_chars);

        let inbound = InboundRequest {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            headers: parts.headers.clone(),
            body,
            client_ip,
            user_agent,
        };

        let decision = self.decide(&inbound).await;
        entry.client_id = decision.client_id();

        let client = match decision {
            Decision::Allow(client) => client,
            rejected => {
                let response = rejected
                    .rejection()
                    .unwrap_or_else(|| json_error(StatusCode::FORBIDDEN, "Permission denied"));
                self.finish(entry, &response, start, false);
                return response;
            }
        };

        let mut upstream_req = Request::from_parts(parts, Body::from(inbound.body));
        prepare_upstream_headers(upstream_req.headers_mut(), &client, client_ip);
        upstream_req.extensions_mut().insert(client.clone());

        let response = match self.upstream.forward(upstream_req).await {
            Ok(response) => response,
            Err(e) => {
                error!("Upstream error for {} {}: {}", inbound.method, inbound.path, e);
                json_error(StatusCode::BAD_GATEWAY, "Upstream service unavailable")
            }
        };

        self.finish(entry, &response, start, true);
        response
    }

    /// Queue the access log entry for a decided request
    fn finish(
        &self,
        mut entry: NewAccessLogEntry,
        response: &Response<Body>,
        start: Instant,
        allowed: bool,
    ) {
        entry.status_code = response.status().as_u16();
        entry.response_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        debug!(
            "{} {} {} {:.1}ms",
            entry.method, entry.endpoint, entry.status_code, entry.response_time_ms
        );

        if allowed || self.settings.log_rejected {
            self.logger.record(entry);
        }
    }
}

/// Strip caller-controlled identity headers and attach the gateway's own
fn prepare_upstream_headers(headers: &mut HeaderMap, client: &AuthenticatedClient, client_ip: IpAddr) {
    // Headers listed in Connection are hop-by-hop too
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS.iter().chain(STRIPPED_HEADERS.iter()) {
        headers.remove(*name);
    }

    headers.insert(
        HeaderName::from_static(CLIENT_ID_HEADER),
        HeaderValue::from(client.id),
    );
    match HeaderValue::from_str(&client.name) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(CLIENT_NAME_HEADER), value);
        }
        Err(_) => debug!("Client name for {} is not a valid header value", client.id),
    }
    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert(HeaderName::from_static(FORWARDED_FOR_HEADER), value);
    }
}

/// Serve the gateway until `shutdown` resolves
pub async fn run_gateway_with_shutdown<F>(
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: F,
) -> Result<(), GatewayError>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let gateway = Arc::clone(&gateway);
        let remote_addr = conn.remote_addr();

        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let gateway = Arc::clone(&gateway);
                async move { Ok::<_, Infallible>(gateway.handle(req, remote_addr).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("Gateway listening on http://{}", addr);
    server.with_graceful_shutdown(shutdown).await?;
    Ok(())
}

pub async fn run_gateway(addr: SocketAddr, gateway: Arc<Gateway>) -> Result<(), GatewayError> {
    run_gateway_with_shutdown(addr, gateway, std::future::pending()).await
}
