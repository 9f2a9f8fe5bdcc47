// Admin API Integration Tests
//
// Exercises the admin HTTP surface through AdminApi::handle_request.

use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;

use hms_gateway::admin::ClientAdmin;
use hms_gateway::admin_api::AdminApi;
use hms_gateway::cache::MemoryCache;
use hms_gateway::clock::ManualClock;
use hms_gateway::credential_cache::CredentialCache;
use hms_gateway::store::GatewayStore;

const TOKEN: &str = "admin-test-token";

fn api_with_token(token: &str) -> AdminApi {
    let clock = Arc::new(ManualClock::at_unix(1_777_000_000));
    let store = Arc::new(GatewayStore::in_memory().unwrap());
    let credentials = Arc::new(CredentialCache::with_defaults(Arc::new(
        MemoryCache::with_clock(clock.clone()),
    )));
    let admin = Arc::new(ClientAdmin::from_store(store, credentials, clock));
    AdminApi::new(admin, token)
}

fn api() -> AdminApi {
    api_with_token(TOKEN)
}

async fn call(api: &AdminApi, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header("Authorization", format!("Bearer {}", TOKEN));
    let req = match body {
        Some(json) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    read(api.handle_request(req).await.unwrap()).await
}

async fn read(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn create_client(api: &AdminApi) -> (i64, String) {
    let (status, json) = call(
        api,
        Method::POST,
        "/admin/api/clients",
        Some(json!({
            "name": "County Lab",
            "capabilities": { "can_read_patients": true },
            "rate_limit_per_minute": 30
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (
        json["data"]["client"]["id"].as_i64().unwrap(),
        json["data"]["secret"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn test_health_needs_no_token() {
    let api = api();
    let req = Request::builder()
        .uri("/admin/api/health")
        .body(Body::empty())
        .unwrap();
    let (status, json) = read(api.handle_request(req).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_requires_bearer_token() {
    let api = api();
    let req = Request::builder()
        .uri("/admin/api/clients")
        .header("Authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = read(api.handle_request(req).await.unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let missing = Request::builder()
        .uri("/admin/api/clients")
        .body(Body::empty())
        .unwrap();
    let (status, _) = read(api.handle_request(missing).await.unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_empty_token_disables_api() {
    let api = api_with_token("");
    let req = Request::builder()
        .uri("/admin/api/clients")
        .header("Authorization", "Bearer ")
        .body(Body::empty())
        .unwrap();
    let (status, _) = read(api.handle_request(req).await.unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_client_lifecycle() {
    let api = api();
    let (id, secret) = create_client(&api).await;
    assert_eq!(secret.len(), 64);

    let (status, json) = call(&api, Method::GET, &format!("/admin/api/clients/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["name"], "County Lab");
    assert_eq!(json["data"]["rate_limit_per_minute"], 30);
    assert_eq!(json["data"]["daily_request_limit"], 10_000);
    assert!(json["data"].get("secret").is_none());

    let (status, json) = call(&api, Method::GET, "/admin/api/clients", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"].as_array().unwrap().len(), 1);
    assert!(!json.to_string().contains(&secret));

    let (status, json) = call(
        &api,
        Method::PATCH,
        &format!("/admin/api/clients/{}", id),
        Some(json!({ "daily_request_limit": 500 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["daily_request_limit"], 500);

    let (status, json) = call(
        &api,
        Method::POST,
        &format!("/admin/api/clients/{}/rotate", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(json["data"]["secret"].as_str().unwrap(), secret);

    let (status, json) = call(
        &api,
        Method::POST,
        &format!("/admin/api/clients/{}/deactivate", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["is_active"], false);

    let (status, json) = call(
        &api,
        Method::POST,
        &format!("/admin/api/clients/{}/activate", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["is_active"], true);

    let (status, json) = call(
        &api,
        Method::GET,
        &format!("/admin/api/clients/{}/logs?limit=10", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_input() {
    let api = api();

    let (status, _) = call(
        &api,
        Method::POST,
        "/admin/api/clients",
        Some(json!({ "name": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &api,
        Method::POST,
        "/admin/api/clients",
        Some(json!({ "description": "no name" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&api, Method::GET, "/admin/api/clients/404", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&api, Method::GET, "/admin/api/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_routes() {
    let api = api();
    let (id, _) = create_client(&api).await;
    let hooks = format!("/admin/api/clients/{}/webhooks", id);
    let body = json!({
        "event": "prescription.dispensed",
        "target_url": "https://pharmacy.example.org/hooks"
    });

    let (status, json) = call(&api, Method::POST, &hooks, Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let hook_id = json["data"]["id"].as_i64().unwrap();
    assert_eq!(json["data"]["event"], "prescription.dispensed");
    assert_eq!(json["data"]["is_active"], true);

    let (status, _) = call(&api, Method::POST, &hooks, Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        &api,
        Method::POST,
        &hooks,
        Some(json!({ "event": "patient.deleted", "target_url": "https://x.example/" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = call(
        &api,
        Method::POST,
        &format!("/admin/api/webhooks/{}/toggle", hook_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["is_active"], false);

    let (status, json) = call(&api, Method::GET, &hooks, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"].as_array().unwrap().len(), 1);

    let (status, _) = call(
        &api,
        Method::DELETE,
        &format!("/admin/api/webhooks/{}", hook_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &api,
        Method::DELETE,
        &format!("/admin/api/webhooks/{}", hook_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_capability_patch_keeps_unmentioned_flags() {
    let api = api();
    let (id, _) = create_client(&api).await;
    let path = format!("/admin/api/clients/{}", id);

    let (status, json) = call(
        &api,
        Method::PATCH,
        &path,
        Some(json!({ "capabilities": { "can_write_patients": true } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["capabilities"]["can_read_patients"], true);
    assert_eq!(json["data"]["capabilities"]["can_write_patients"], true);
    assert_eq!(json["data"]["capabilities"]["can_write_pharmacy"], false);

    let (status, json) = call(
        &api,
        Method::PATCH,
        &path,
        Some(json!({ "capabilities": { "can_read_patients": false } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["capabilities"]["can_read_patients"], false);
    assert_eq!(json["data"]["capabilities"]["can_write_patients"], true);
}
