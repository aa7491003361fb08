//! End-to-end HTTP tests over the in-memory store.
//!
//! The router is driven with `tower::ServiceExt::oneshot`, one request per
//! call. Covers the full token lifecycle (mint → use → replay → revoke), the
//! stable auth error strings, idempotent team creation, batch ingestion
//! counters, and the error envelope.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use meterline_api::{build_router, AppState};
use meterline_auth::MintParams;
use meterline_billing::MockGateway;
use meterline_shared::ids::{AppId, Kid, TeamId};
use meterline_shared::{Config, FixedClock};
use meterline_store::MemoryStore;

const ADMIN_KEY: &str = "test-admin-key";

fn test_config() -> Config {
    Config {
        admin_api_key: ADMIN_KEY.into(),
        secrets_encryption_key: [7u8; 32],
        stripe_secret_key: None,
        stripe_webhook_secret: None,
        database_url: None,
        max_batch_size: 10,
        jwt_ttl_seconds: 60,
        bind_addr: "127.0.0.1".into(),
        port: 0,
        pricing_poll_interval: Duration::from_secs(5),
        pricing_batch_size: 50,
        pricing_max_retries: 5,
        wallet_sweep_interval: Duration::from_secs(300),
        period_close_interval: Duration::from_secs(86_400),
        jti_sweep_interval: Duration::from_secs(3_600),
        webhook_tolerance: Duration::from_secs(300),
        public_base_url: "http://localhost".into(),
        checkout_success_url: "http://localhost/ok".into(),
        checkout_cancel_url: "http://localhost/no".into(),
        portal_return_url: "http://localhost/billing".into(),
    }
}

struct TestApp {
    router: Router,
    state: AppState,
    clock: FixedClock,
}

fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let clock = FixedClock::at(Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap());
    let state = AppState::build(
        store,
        Arc::new(clock.clone()),
        Arc::new(test_config()),
        Arc::new(MockGateway::new()),
    );
    TestApp {
        router: build_router(state.clone()),
        state,
        clock,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn admin_post(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-admin-api-key", ADMIN_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn bearer_request(method: &str, path: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Provision an app + secret through the admin API and mint a token locally
/// with the returned plaintext secret.
async fn provision(app: &TestApp) -> (AppId, Kid, Vec<u8>) {
    let (status, body) = send(
        &app.router,
        admin_post("/v1/admin/apps", json!({"name": "metertest"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let app_id: AppId = body["id"].as_str().unwrap().parse().unwrap();

    let (status, body) = send(
        &app.router,
        admin_post(&format!("/v1/admin/apps/{app_id}/secrets"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let kid = Kid(body["kid"].as_str().unwrap().to_owned());
    let secret = hex::decode(body["secret"].as_str().unwrap()).unwrap();
    (app_id, kid, secret)
}

fn mint(app: &TestApp, app_id: AppId, kid: &Kid, secret: &[u8], team_id: Option<TeamId>) -> String {
    app.state.tokens.mint(
        &MintParams {
            app_id,
            kid: kid.clone(),
            sub: "test-sdk".into(),
            team_id,
            user_id: None,
            scopes: vec!["billing:read".into()],
            ttl_seconds: 60,
        },
        secret,
    )
}

#[tokio::test]
async fn test_healthz() {
    let app = test_app();
    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "ok");
}

#[tokio::test]
async fn test_admin_key_required() {
    let app = test_app();

    let request = Request::builder()
        .method("POST")
        .uri("/v1/admin/apps")
        .header("content-type", "application/json")
        .body(Body::from(json!({"name": "x"}).to_string()))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Missing admin API key");

    let request = Request::builder()
        .method("POST")
        .uri("/v1/admin/apps")
        .header("content-type", "application/json")
        .header("x-admin-api-key", "wrong")
        .body(Body::from(json!({"name": "x"}).to_string()))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Invalid admin API key");
}

#[tokio::test]
async fn test_auth_header_error_strings() {
    let app = test_app();
    let (app_id, _, _) = provision(&app).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/apps/{app_id}/teams"))
        .header("content-type", "application/json")
        .body(Body::from(json!({"externalTeamId": "t", "name": "t"}).to_string()))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Missing Authorization header");

    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/apps/{app_id}/teams"))
        .header("authorization", "Token abc")
        .header("content-type", "application/json")
        .body(Body::from(json!({"externalTeamId": "t", "name": "t"}).to_string()))
        .unwrap();
    let (_, body) = send(&app.router, request).await;
    assert_eq!(body["message"], "Malformed Authorization header");

    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/apps/{app_id}/teams"))
        .header("authorization", "Bearer ")
        .header("content-type", "application/json")
        .body(Body::from(json!({"externalTeamId": "t", "name": "t"}).to_string()))
        .unwrap();
    let (_, body) = send(&app.router, request).await;
    assert_eq!(body["message"], "Empty bearer token");
}

#[tokio::test]
async fn test_token_lifecycle_end_to_end() {
    let app = test_app();
    let (app_id, kid, secret) = provision(&app).await;

    // Create a team with a fresh token.
    let token = mint(&app, app_id, &kid, &secret, None);
    let (status, body) = send(
        &app.router,
        bearer_request(
            "POST",
            &format!("/v1/apps/{app_id}/teams"),
            &token,
            Some(json!({"externalTeamId": "acme-1", "name": "Acme"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let team_id: TeamId = body["id"].as_str().unwrap().parse().unwrap();

    // The same token again: replay.
    let (status, body) = send(
        &app.router,
        bearer_request(
            "GET",
            &format!("/v1/apps/{app_id}/teams/{team_id}"),
            &token,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Token has already been used");

    // A fresh token reads the team.
    let token = mint(&app, app_id, &kid, &secret, Some(team_id));
    let (status, body) = send(
        &app.router,
        bearer_request(
            "GET",
            &format!("/v1/apps/{app_id}/teams/{team_id}"),
            &token,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Acme");

    // Revoke the kid: even freshly minted tokens die.
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/v1/admin/apps/{app_id}/secrets/{kid}"))
        .header("x-admin-api-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let token = mint(&app, app_id, &kid, &secret, None);
    let (status, body) = send(
        &app.router,
        bearer_request(
            "GET",
            &format!("/v1/apps/{app_id}/teams/{team_id}"),
            &token,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Key has been revoked");

    // Revoking again stays 200.
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/v1/admin/apps/{app_id}/secrets/{kid}"))
        .header("x-admin-api-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "REVOKED");
}

#[tokio::test]
async fn test_route_app_binding() {
    let app = test_app();
    let (app_a, kid_a, secret_a) = provision(&app).await;
    let (app_b, _, _) = provision(&app).await;

    let token = mint(&app, app_a, &kid_a, &secret_a, None);
    let (status, body) = send(
        &app.router,
        bearer_request(
            "POST",
            &format!("/v1/apps/{app_b}/teams"),
            &token,
            Some(json!({"externalTeamId": "x", "name": "X"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "JWT appId does not match route appId");
}

#[tokio::test]
async fn test_team_creation_is_idempotent() {
    let app = test_app();
    let (app_id, kid, secret) = provision(&app).await;

    let token = mint(&app, app_id, &kid, &secret, None);
    let (_, first) = send(
        &app.router,
        bearer_request(
            "POST",
            &format!("/v1/apps/{app_id}/teams"),
            &token,
            Some(json!({"externalTeamId": "acme", "name": "Acme"})),
        ),
    )
    .await;

    let token = mint(&app, app_id, &kid, &secret, None);
    let (status, second) = send(
        &app.router,
        bearer_request(
            "POST",
            &format!("/v1/apps/{app_id}/teams"),
            &token,
            Some(json!({"externalTeamId": "acme", "name": "Acme Again"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["id"], second["id"]);
    assert_eq!(second["name"], "Acme", "original row wins");
}

#[tokio::test]
async fn test_ingestion_counts_duplicates_and_enforces_batch_limit() {
    let app = test_app();
    let (app_id, kid, secret) = provision(&app).await;
    let token = mint(&app, app_id, &kid, &secret, None);
    let (_, team) = send(
        &app.router,
        bearer_request(
            "POST",
            &format!("/v1/apps/{app_id}/teams"),
            &token,
            Some(json!({"externalTeamId": "acme", "name": "Acme"})),
        ),
    )
    .await;
    let team_id = team["id"].as_str().unwrap();

    let event = |key: &str| {
        json!({
            "eventType": "api.request.v1",
            "idempotencyKey": key,
            "teamId": team_id,
            "payload": {"count": 1}
        })
    };

    let token = mint(&app, app_id, &kid, &secret, None);
    let (status, body) = send(
        &app.router,
        bearer_request(
            "POST",
            &format!("/v1/apps/{app_id}/usage/events"),
            &token,
            Some(json!({"events": [event("k1")]})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"accepted": 1, "duplicates": 0}));

    let token = mint(&app, app_id, &kid, &secret, None);
    let (_, body) = send(
        &app.router,
        bearer_request(
            "POST",
            &format!("/v1/apps/{app_id}/usage/events"),
            &token,
            Some(json!({"events": [event("k1"), event("k2")]})),
        ),
    )
    .await;
    assert_eq!(body, json!({"accepted": 1, "duplicates": 1}));

    // Batch limit (10 in the test config).
    let oversized: Vec<Value> = (0..11).map(|i| event(&format!("big-{i}"))).collect();
    let token = mint(&app, app_id, &kid, &secret, None);
    let (status, _) = send(
        &app.router,
        bearer_request(
            "POST",
            &format!("/v1/apps/{app_id}/usage/events"),
            &token,
            Some(json!({"events": oversized})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_capabilities_document() {
    let app = test_app();
    let (app_id, kid, secret) = provision(&app).await;
    let token = mint(&app, app_id, &kid, &secret, None);

    let (status, body) = send(
        &app.router,
        bearer_request("GET", "/v1/meta/capabilities", &token, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["apiVersion"], "v1");
    assert_eq!(body["usageIngestion"]["maxBatchSize"], 10);
    assert!(body["usageIngestion"]["supportedEventTypes"]
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t == "llm.completion.v1"));
}

#[tokio::test]
async fn test_error_envelope_carries_request_id() {
    let app = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/admin/apps")
        .header("content-type", "application/json")
        .header("x-request-id", "req-12345")
        .body(Body::from(json!({"name": "x"}).to_string()))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req-12345"
    );
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["requestId"], "req-12345");
    assert_eq!(body["statusCode"], 403);
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn test_expired_token_after_clock_advance() {
    let app = test_app();
    let (app_id, kid, secret) = provision(&app).await;
    let token = mint(&app, app_id, &kid, &secret, None);

    app.clock.advance(chrono::Duration::seconds(120));
    let (status, body) = send(
        &app.router,
        bearer_request(
            "POST",
            &format!("/v1/apps/{app_id}/teams"),
            &token,
            Some(json!({"externalTeamId": "t", "name": "T"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Token expired");
}
