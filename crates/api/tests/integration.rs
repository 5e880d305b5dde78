//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server,
//! backed by the in-memory store.
//!
//! ```bash
//! cargo test -p keel-api --test integration
//! ```

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use keel_api::middleware::auth::encode_jwt;
use keel_api::routes::create_router;
use keel_api::state::AppState;
use keel_common::config::AppConfig;
use keel_common::crypto::AesKeyManager;
use keel_common::events::{BackupFailed, DomainEvent};
use keel_common::store::MemoryStore;

// ============================================================
// Helpers
// ============================================================

/// Create a test AppConfig with a specific JWT secret.
fn test_config() -> AppConfig {
    AppConfig {
        database_url: "unused".to_string(),
        db_max_connections: 5,
        api_listen_addr: "127.0.0.1:0".to_string(),
        jwt_secret: "test-jwt-secret-for-integration-tests".to_string(),
        jwt_expiry_hours: 24,
        webhook_encryption_key: "42".repeat(32),
        webhook_default_retry_count: 5,
        webhook_default_timeout_seconds: 30,
        webhook_retry_base_seconds: 30,
        webhook_retry_cap_seconds: 3600,
        worker_concurrency: 4,
        worker_batch_size: 8,
        worker_poll_interval_ms: 2000,
        worker_sweep_interval_seconds: 30,
        worker_shutdown_timeout_seconds: 30,
    }
}

fn build_test_state() -> AppState {
    AppState::new(
        Arc::new(MemoryStore::new()),
        Arc::new(AesKeyManager::new([0x42; 32])),
        test_config(),
    )
    .unwrap()
}

/// Token for a fresh user in `org_id`.
fn token_for(org_id: Uuid) -> String {
    let config = test_config();
    encode_jwt(
        Uuid::new_v4(),
        org_id,
        &config.jwt_secret,
        config.jwt_expiry_hours,
    )
    .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

fn get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn with_json(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn empty(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn endpoint_body(url: &str) -> Value {
    json!({
        "name": "on-call",
        "url": url,
        "secret": "whsec_api_integration_secret",
        "event_types": ["backup.failed"],
        "headers": {"X-Source": "keel"},
    })
}

// ============================================================
// Health and authentication
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_router(build_test_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "keel-api");
}

#[tokio::test]
async fn test_routes_require_auth() {
    let app = create_router(build_test_state());

    for uri in [
        "/webhooks/endpoints",
        "/webhooks/deliveries",
        "/webhooks/event-types",
    ] {
        let (status, body) = send(
            &app,
            Request::builder().uri(uri).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
        assert!(body["error"].is_string());
    }

    let (status, _) = send(&app, get("/webhooks/endpoints", "invalid.jwt.token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_event_type_catalogue() {
    let app = create_router(build_test_state());
    let (status, body) = send(&app, get("/webhooks/event-types", &token_for(Uuid::new_v4()))).await;

    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["type"].as_str().unwrap())
        .collect();
    assert!(types.contains(&"backup.completed"));
    assert!(types.contains(&"webhook.test"));
    assert!(body[0]["description"].is_string());
}

// ============================================================
// Endpoints
// ============================================================

#[tokio::test]
async fn test_endpoint_crud_via_api() {
    let app = create_router(build_test_state());
    let token = token_for(Uuid::new_v4());

    // 1. Create
    let (status, created) = send(
        &app,
        with_json(
            "POST",
            "/webhooks/endpoints",
            &token,
            endpoint_body("https://hooks.example.com/keel"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["secret_configured"], true);
    assert!(created.get("secret").is_none());
    assert_eq!(created["retry_count"], 5);
    let id = created["id"].as_str().unwrap().to_string();

    // 2. List
    let (status, list) = send(&app, get("/webhooks/endpoints", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    // 3. Update
    let (status, updated) = send(
        &app,
        with_json(
            "PUT",
            &format!("/webhooks/endpoints/{}", id),
            &token,
            json!({"enabled": false, "event_types": ["backup.failed", "restore.failed"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["enabled"], false);
    assert_eq!(updated["name"], "on-call");
    assert_eq!(updated["event_types"].as_array().unwrap().len(), 2);

    // 4. Get
    let (status, fetched) = send(&app, get(&format!("/webhooks/endpoints/{}", id), &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["enabled"], false);

    // 5. Delete
    let (status, _) = send(&app, empty("DELETE", &format!("/webhooks/endpoints/{}", id), &token)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, get(&format!("/webhooks/endpoints/{}", id), &token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_endpoint_validation() {
    let app = create_router(build_test_state());
    let token = token_for(Uuid::new_v4());

    let mut short_secret = endpoint_body("https://hooks.example.com");
    short_secret["secret"] = json!("short");
    let mut bad_type = endpoint_body("https://hooks.example.com");
    bad_type["event_types"] = json!(["BACKUP"]);

    for body in [
        endpoint_body("not-a-url"),
        short_secret,
        bad_type,
    ] {
        let (status, json) = send(&app, with_json("POST", "/webhooks/endpoints", &token, body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }
}

#[tokio::test]
async fn test_malformed_id_is_bad_request() {
    let app = create_router(build_test_state());
    let token = token_for(Uuid::new_v4());

    for uri in [
        "/webhooks/endpoints/not-a-uuid",
        "/webhooks/endpoints/not-a-uuid/deliveries",
        "/webhooks/deliveries/42",
        "/webhooks/deliveries/42/attempts",
    ] {
        let (status, _) = send(&app, get(uri, &token)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
    }
}

#[tokio::test]
async fn test_other_org_gets_not_found() {
    let app = create_router(build_test_state());
    let owner = token_for(Uuid::new_v4());
    let intruder = token_for(Uuid::new_v4());

    let (_, created) = send(
        &app,
        with_json(
            "POST",
            "/webhooks/endpoints",
            &owner,
            endpoint_body("https://hooks.example.com"),
        ),
    )
    .await;
    let id = created["id"].as_str().unwrap();
    let uri = format!("/webhooks/endpoints/{}", id);
    let missing_id = Uuid::new_v4().to_string();

    // Someone else's endpoint looks exactly like one that doesn't exist
    let (status, foreign) = send(&app, get(&uri, &intruder)).await;
    let (missing_status, missing) = send(
        &app,
        get(&format!("/webhooks/endpoints/{}", missing_id), &intruder),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(missing_status, StatusCode::NOT_FOUND);
    assert_eq!(
        foreign["error"].as_str().unwrap().replace(id, "<id>"),
        missing["error"].as_str().unwrap().replace(&missing_id, "<id>")
    );

    let (status, _) = send(&app, empty("DELETE", &uri, &intruder)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, list) = send(&app, get("/webhooks/endpoints", &intruder)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.as_array().unwrap().is_empty());
}

// ============================================================
// Test delivery and delivery history
// ============================================================

#[tokio::test]
async fn test_endpoint_test_delivery_and_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let app = create_router(build_test_state());
    let token = token_for(Uuid::new_v4());

    let (_, created) = send(
        &app,
        with_json("POST", "/webhooks/endpoints", &token, endpoint_body(&server.uri())),
    )
    .await;
    let endpoint_id = created["id"].as_str().unwrap().to_string();

    // Failure is reported in the body, not as an error status
    let (status, result) = send(
        &app,
        empty("POST", &format!("/webhooks/endpoints/{}/test", endpoint_id), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], false);
    assert_eq!(result["response_status"], 500);
    assert_eq!(result["error_message"], "HTTP 500");
    let delivery_id = result["delivery_id"].as_str().unwrap().to_string();

    let (status, deliveries) = send(
        &app,
        get(&format!("/webhooks/endpoints/{}/deliveries", endpoint_id), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deliveries.as_array().unwrap().len(), 1);
    assert_eq!(deliveries[0]["status"], "failed");
    assert_eq!(deliveries[0]["payload"]["type"], "webhook.test");

    let (status, attempts) = send(
        &app,
        get(&format!("/webhooks/deliveries/{}/attempts", delivery_id), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(attempts.as_array().unwrap().len(), 1);
    assert_eq!(attempts[0]["response_status"], 500);

    // Manual retry re-queues it
    let (status, reopened) = send(
        &app,
        empty("POST", &format!("/webhooks/deliveries/{}/retry", delivery_id), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reopened["status"], "pending");
    assert_eq!(reopened["attempt_number"], 1);

    let (status, _) = send(
        &app,
        empty("POST", &format!("/webhooks/deliveries/{}/retry", delivery_id), &token),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_test_delivery_with_event_type_override() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let app = create_router(build_test_state());
    let token = token_for(Uuid::new_v4());
    let (_, created) = send(
        &app,
        with_json("POST", "/webhooks/endpoints", &token, endpoint_body(&server.uri())),
    )
    .await;

    let (status, result) = send(
        &app,
        with_json(
            "POST",
            &format!("/webhooks/endpoints/{}/test", created["id"].as_str().unwrap()),
            &token,
            json!({"event_type": "backup.failed"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], true);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        requests[0].headers.get("x-webhook-event").unwrap(),
        "backup.failed"
    );
    assert_eq!(requests[0].headers.get("x-source").unwrap(), "keel");

    let (status, _) = send(
        &app,
        with_json(
            "POST",
            &format!("/webhooks/endpoints/{}/test", created["id"].as_str().unwrap()),
            &token,
            json!({"event_type": "Not Valid"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delivery_listing_and_pagination() {
    let state = build_test_state();
    let app = create_router(state.clone());
    let org_id = Uuid::new_v4();
    let token = token_for(org_id);

    send(
        &app,
        with_json(
            "POST",
            "/webhooks/endpoints",
            &token,
            endpoint_body("https://hooks.example.com"),
        ),
    )
    .await;

    for i in 0..3 {
        state
            .dispatcher
            .dispatch_domain(
                org_id,
                DomainEvent::BackupFailed(BackupFailed {
                    backup_id: Uuid::new_v4(),
                    policy_id: Uuid::new_v4(),
                    source: format!("vol-{}", i),
                    reason: "snapshot timeout".to_string(),
                    failed_at: Utc::now(),
                }),
            )
            .await
            .unwrap();
    }

    let (status, all) = send(&app, get("/webhooks/deliveries", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 3);
    assert_eq!(all[0]["status"], "pending");
    assert_eq!(all[0]["payload"]["data"]["source"], "vol-2");

    let (_, page) = send(&app, get("/webhooks/deliveries?limit=2&offset=2", &token)).await;
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["id"], all[2]["id"]);

    let (status, _) = send(&app, get("/webhooks/deliveries?limit=0", &token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, one) = send(
        &app,
        get(&format!("/webhooks/deliveries/{}", all[1]["id"].as_str().unwrap()), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["event_type"], "backup.failed");

    // Pending deliveries cannot be retried
    let (status, _) = send(
        &app,
        empty(
            "POST",
            &format!("/webhooks/deliveries/{}/retry", all[0]["id"].as_str().unwrap()),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Invisible to other organizations
    let (_, foreign) = send(&app, get("/webhooks/deliveries", &token_for(Uuid::new_v4()))).await;
    assert!(foreign.as_array().unwrap().is_empty());
}
