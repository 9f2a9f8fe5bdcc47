//! Admin HTTP API
//!
//! JSON endpoints for client and webhook administration. Every route except
//! the health check requires `Authorization: Bearer <token>`.
//!
//! Base path: /admin/api

use hyper::header::AUTHORIZATION;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::admin::{ClientAdmin, DEFAULT_LOG_PAGE};
use crate::credentials::{ClientUpdate, NewClient};
use crate::error::{GatewayError, StoreError};
use crate::response::{json_error, json_response, ApiResponse};
use crate::webhooks::WebhookEvent;

pub const ADMIN_PREFIX: &str = "/admin/api";
const ADMIN_USER_HEADER: &str = "x-admin-user";

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub event: WebhookEvent,
    pub target_url: String,
}

pub struct AdminApi {
    admin: Arc<ClientAdmin>,
    token: String,
}

impl AdminApi {
    pub fn new(admin: Arc<ClientAdmin>, token: impl Into<String>) -> Self {
        Self {
            admin,
            token: token.into(),
        }
    }

    fn authorized(&self, req: &Request<Body>) -> bool {
        if self.token.is_empty() {
            return false;
        }
        let presented = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        presented.as_bytes().ct_eq(self.token.as_bytes()).into()
    }

    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!("Admin API request: {} {}", method, path);

        let rest = match path.strip_prefix(ADMIN_PREFIX) {
            Some(rest) => rest.trim_end_matches('/'),
            None => return Ok(not_found()),
        };

        if method == Method::GET && rest == "/health" {
            return Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({ "status": "healthy", "service": "hms-gateway-admin" }),
            ));
        }

        if !self.authorized(&req) {
            warn!("Unauthorized admin API request: {} {}", method, path);
            return Ok(json_error(StatusCode::UNAUTHORIZED, "Unauthorized"));
        }

        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        let response = match (method, segments.as_slice()) {
            // Clients
            (Method::GET, ["clients"]) => self.handle_list_clients().await,
            (Method::POST, ["clients"]) => self.handle_create_client(req).await,
            (Method::GET, ["clients", id]) => match parse_id(id) {
                Some(id) => self.handle_get_client(id).await,
                None => not_found(),
            },
            (Method::PATCH, ["clients", id]) => match parse_id(id) {
                Some(id) => self.handle_update_client(id, req).await,
                None => not_found(),
            },
            (Method::POST, ["clients", id, "rotate"]) => match parse_id(id) {
                Some(id) => self.handle_rotate(id).await,
                None => not_found(),
            },
            (Method::POST, ["clients", id, "deactivate"]) => match parse_id(id) {
                Some(id) => store_result(self.admin.deactivate(id).await, StatusCode::OK),
                None => not_found(),
            },
            (Method::POST, ["clients", id, "activate"]) => match parse_id(id) {
                Some(id) => store_result(self.admin.activate(id).await, StatusCode::OK),
                None => not_found(),
            },
            (Method::GET, ["clients", id, "logs"]) => match parse_id(id) {
                Some(id) => {
                    let limit = query_limit(req.uri().query()).unwrap_or(DEFAULT_LOG_PAGE);
                    store_result(
                        self.admin.recent_access_logs(id, limit).await,
                        StatusCode::OK,
                    )
                }
                None => not_found(),
            },

            // Webhooks
            (Method::GET, ["clients", id, "webhooks"]) => match parse_id(id) {
                Some(id) => store_result(self.admin.list_webhooks(id).await, StatusCode::OK),
                None => not_found(),
            },
            (Method::POST, ["clients", id, "webhooks"]) => match parse_id(id) {
                Some(id) => self.handle_create_webhook(id, req).await,
                None => not_found(),
            },
            (Method::POST, ["webhooks", id, "toggle"]) => match parse_id(id) {
                Some(id) => store_result(self.admin.toggle_webhook(id).await, StatusCode::OK),
                None => not_found(),
            },
            (Method::DELETE, ["webhooks", id]) => match parse_id(id) {
                Some(id) => match self.admin.delete_webhook(id).await {
                    Ok(()) => json_response(
                        StatusCode::OK,
                        &ApiResponse::<()>::success_message("Webhook deleted"),
                    ),
                    Err(e) => store_error(e),
                },
                None => not_found(),
            },

            _ => not_found(),
        };

        Ok(response)
    }

    async fn handle_list_clients(&self) -> Response<Body> {
        store_result(self.admin.list_clients().await, StatusCode::OK)
    }

    async fn handle_create_client(&self, req: Request<Body>) -> Response<Body> {
        let created_by = req
            .headers()
            .get(ADMIN_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or("admin")
            .to_string();

        let client: NewClient = match parse_body(req).await {
            Ok(c) => c,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, &e),
        };

        store_result(
            self.admin.create_client(client, &created_by).await,
            StatusCode::CREATED,
        )
    }

    async fn handle_get_client(&self, id: i64) -> Response<Body> {
        store_result(self.admin.get_client(id).await, StatusCode::OK)
    }

    async fn handle_update_client(&self, id: i64, req: Request<Body>) -> Response<Body> {
        let update: ClientUpdate = match parse_body(req).await {
            Ok(u) => u,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, &e),
        };
        store_result(self.admin.update_client(id, update).await, StatusCode::OK)
    }

    async fn handle_rotate(&self, id: i64) -> Response<Body> {
        store_result(self.admin.rotate_keys(id).await, StatusCode::OK)
    }

    async fn handle_create_webhook(&self, client_id: i64, req: Request<Body>) -> Response<Body> {
        let request: CreateWebhookRequest = match parse_body(req).await {
            Ok(r) => r,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, &e),
        };
        store_result(
            self.admin
                .create_webhook(client_id, request.event, &request.target_url)
                .await,
            StatusCode::CREATED,
        )
    }
}

fn not_found() -> Response<Body> {
    json_error(StatusCode::NOT_FOUND, "Not found")
}

fn parse_id(raw: &str) -> Option<i64> {
    raw.parse().ok()
}

fn query_limit(query: Option<&str>) -> Option<usize> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == "limit")
        .and_then(|(_, v)| v.parse().ok())
}

fn store_result<T: serde::Serialize>(result: Result<T, StoreError>, status: StatusCode) -> Response<Body> {
    match result {
        Ok(data) => json_response(status, &ApiResponse::success(data)),
        Err(e) => store_error(e),
    }
}

fn store_error(e: StoreError) -> Response<Body> {
    match e {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, &format!("Not found: {}", msg)),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, &msg),
        StoreError::Invalid(msg) => json_error(StatusCode::BAD_REQUEST, &msg),
        other => {
            error!("Admin operation failed: {}", other);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

/// Parse JSON body from request
async fn parse_body<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, String> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| format!("Failed to read body: {}", e))?;

    serde_json::from_slice(&bytes).map_err(|e| format!("Invalid JSON: {}", e))
}

/// Serve the admin API until `shutdown` resolves
pub async fn run_admin_api_with_shutdown<F>(
    addr: SocketAddr,
    api: Arc<AdminApi>,
    shutdown: F,
) -> Result<(), GatewayError>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let api = Arc::clone(&api);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let api = Arc::clone(&api);
                async move { api.handle_request(req).await }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("Admin API listening on http://{}", addr);
    server.with_graceful_shutdown(shutdown).await?;
    Ok(())
}
