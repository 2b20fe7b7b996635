use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, http::Request, http::StatusCode, Extension, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tower::ServiceExt;

use secrets_backend::audit::{AuditEvent, SecurityEventSink};
use secrets_backend::hsm::HsmKeyManagementService;
use secrets_backend::mpa::MultiPartyAuthorizationService;
use secrets_backend::routes::security_routes;
use secrets_backend::{KmsConfig, KmsProvider, KmsRegistry, SecurityResult};

/// Discards events; these tests exercise the HTTP surface, not the log.
struct NullSink;

#[async_trait]
impl SecurityEventSink for NullSink {
    async fn record(&self, _event: AuditEvent) -> SecurityResult<()> {
        Ok(())
    }
}

fn app() -> Router {
    let sink: Arc<dyn SecurityEventSink> = Arc::new(NullSink);
    let registry = KmsRegistry::from_configs(vec![KmsConfig::Local {
        master_key: "http-test-master-key".to_string(),
    }])
    .unwrap();
    let mpa = Arc::new(MultiPartyAuthorizationService::new(
        "http-test-signing-key",
        sink.clone(),
    ));
    let hsm = Arc::new(HsmKeyManagementService::new(
        registry.get(KmsProvider::Local).unwrap(),
        sink,
    ));
    security_routes()
        .layer(Extension(mpa))
        .layer(Extension(hsm))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn text_body(response: axum::response::Response) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Request an operation and drive it to APPROVED, returning its id.
async fn approved_operation(app: &Router, operation_type: &str, resource_id: &str) -> String {
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/security/mpa/operations",
            json!({
                "operationType": operation_type,
                "resourceId": resource_id,
                "requestedBy": "alice",
                "requiredApprovals": 1,
            }),
        ))
        .await
        .unwrap();
    let id = json_body(response).await["operationId"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/security/mpa/operations/{id}/approve"),
            json!({ "approverId": "bob" }),
        ))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "APPROVED");
    id
}

#[tokio::test]
async fn mpa_lifecycle_over_http() {
    let app = app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/security/mpa/operations",
            json!({
                "operationType": "DELETE_MASTER_KEY",
                "resourceId": "key-1",
                "requestedBy": "alice",
                "requiredApprovals": 2,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let operation = json_body(response).await;
    let id = operation["operationId"].as_str().unwrap().to_string();
    assert_eq!(operation["status"], "PENDING");

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/security/mpa/operations/{id}/approve"),
            json!({ "approverId": "bob" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "PENDING");

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/security/mpa/operations/{id}/approve"),
            json!({ "approverId": "carol" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "APPROVED");

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/security/mpa/operations/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = json_body(response).await;
    assert_eq!(fetched["approvals"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn self_approval_is_a_client_error() {
    let app = app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/security/mpa/operations",
            json!({
                "operationType": "EXPORT_KEY",
                "resourceId": "key-1",
                "requestedBy": "alice",
            }),
        ))
        .await
        .unwrap();
    let id = json_body(response).await["operationId"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .oneshot(post_json(
            &format!("/api/security/mpa/operations/{id}/approve"),
            json!({ "approverId": "alice" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_operation_is_404() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/api/security/mpa/operations/00000000-0000-0000-0000-000000000000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn random_endpoint_returns_requested_length() {
    let response = app()
        .oneshot(post_json("/api/security/random", json!({ "byteLength": 16 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let random = STANDARD.decode(body["random"].as_str().unwrap()).unwrap();
    assert_eq!(random.len(), 16);
}

#[tokio::test]
async fn key_deletion_is_gated_on_an_approved_operation() {
    let response = app()
        .oneshot(post_json(
            "/api/security/keys/some-key/schedule-deletion",
            json!({
                "pendingWindowDays": 7,
                "operationId": "00000000-0000-0000-0000-000000000000",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(text_body(response)
        .await
        .contains("matching approved multi-party operation"));
}

#[tokio::test]
async fn unrelated_approval_does_not_open_the_deletion_gate() {
    let app = app();

    // Approved, but for a different operation type and a different key.
    let id = approved_operation(&app, "EXPORT_KEY", "another-key").await;

    let response = app
        .oneshot(post_json(
            "/api/security/keys/some-key/schedule-deletion",
            json!({ "pendingWindowDays": 7, "operationId": id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(text_body(response)
        .await
        .contains("matching approved multi-party operation"));
}

#[tokio::test]
async fn matching_approval_opens_the_gate_exactly_once() {
    let app = app();
    let id = approved_operation(&app, "DELETE_MASTER_KEY", "some-key").await;

    // The gate passes and the call reaches the backend, which is the local
    // software KMS and refuses key management.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/security/keys/some-key/schedule-deletion",
            json!({ "pendingWindowDays": 7, "operationId": id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(text_body(response).await.contains("HSM-backed"));

    // The approval was spent by the first attempt.
    let response = app
        .oneshot(post_json(
            "/api/security/keys/some-key/schedule-deletion",
            json!({ "pendingWindowDays": 7, "operationId": id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(text_body(response)
        .await
        .contains("matching approved multi-party operation"));
}
