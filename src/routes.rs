use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    routing::{get, post},
    Extension, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditTrailFilter, AuditTrailPage, ChainVerification, TamperProofAuditLogger};
use crate::error::{SecurityError, SecurityResult};
use crate::hsm::HsmKeyManagementService;
use crate::kms::KeyMetadata;
use crate::mpa::{MultiPartyAuthorizationService, PendingOperation};

pub fn security_routes() -> Router {
    Router::new()
        .route("/api/security/audit", get(get_audit_trail))
        .route("/api/security/audit/verify", get(verify_audit_chain))
        .route("/api/security/mpa/operations", post(request_operation))
        .route("/api/security/mpa/operations/:id", get(get_operation))
        .route(
            "/api/security/mpa/operations/:id/approve",
            post(approve_operation),
        )
        .route(
            "/api/security/mpa/operations/:id/reject",
            post(reject_operation),
        )
        .route("/api/security/keys", get(list_keys).post(create_master_key))
        .route(
            "/api/security/keys/:id/schedule-deletion",
            post(schedule_key_deletion),
        )
        .route("/api/security/random", post(generate_random))
}

async fn get_audit_trail(
    Extension(audit): Extension<Arc<TamperProofAuditLogger>>,
    Query(filter): Query<AuditTrailFilter>,
) -> SecurityResult<Json<AuditTrailPage>> {
    Ok(Json(audit.get_audit_trail(filter).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyParams {
    start_from: Option<Uuid>,
    limit: Option<i64>,
}

async fn verify_audit_chain(
    Extension(audit): Extension<Arc<TamperProofAuditLogger>>,
    Query(params): Query<VerifyParams>,
) -> SecurityResult<Json<ChainVerification>> {
    let verification = audit
        .verify_chain(params.start_from, params.limit.unwrap_or(1000))
        .await?;
    Ok(Json(verification))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestOperationBody {
    operation_type: String,
    resource_id: String,
    requested_by: String,
    #[serde(default = "default_required_approvals")]
    required_approvals: u32,
    expiration_minutes: Option<i64>,
}

fn default_required_approvals() -> u32 {
    2
}

async fn request_operation(
    Extension(mpa): Extension<Arc<MultiPartyAuthorizationService>>,
    Json(body): Json<RequestOperationBody>,
) -> SecurityResult<Json<PendingOperation>> {
    let operation = mpa
        .request_operation(
            &body.operation_type,
            &body.resource_id,
            &body.requested_by,
            body.required_approvals,
            body.expiration_minutes.map(Duration::minutes),
        )
        .await?;
    Ok(Json(operation))
}

async fn get_operation(
    Extension(mpa): Extension<Arc<MultiPartyAuthorizationService>>,
    Path(id): Path<Uuid>,
) -> SecurityResult<Json<PendingOperation>> {
    mpa.get_operation(id)
        .map(Json)
        .ok_or(SecurityError::NotFound)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveBody {
    approver_id: String,
}

async fn approve_operation(
    Extension(mpa): Extension<Arc<MultiPartyAuthorizationService>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApproveBody>,
) -> SecurityResult<Json<PendingOperation>> {
    Ok(Json(mpa.approve_operation(id, &body.approver_id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectBody {
    rejected_by: String,
    reason: Option<String>,
}

async fn reject_operation(
    Extension(mpa): Extension<Arc<MultiPartyAuthorizationService>>,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectBody>,
) -> SecurityResult<Json<PendingOperation>> {
    Ok(Json(
        mpa.reject_operation(id, &body.rejected_by, body.reason)
            .await?,
    ))
}

async fn list_keys(
    Extension(hsm): Extension<Arc<HsmKeyManagementService>>,
) -> SecurityResult<Json<Vec<KeyMetadata>>> {
    Ok(Json(hsm.list_keys().await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyBody {
    alias: String,
    #[serde(default)]
    description: String,
}

async fn create_master_key(
    Extension(hsm): Extension<Arc<HsmKeyManagementService>>,
    Json(body): Json<CreateKeyBody>,
) -> SecurityResult<Json<KeyMetadata>> {
    Ok(Json(
        hsm.create_master_key(&body.alias, &body.description).await?,
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleDeletionBody {
    pending_window_days: u32,
    /// An approved multi-party operation authorizing this deletion.
    operation_id: Uuid,
}

async fn schedule_key_deletion(
    Extension(hsm): Extension<Arc<HsmKeyManagementService>>,
    Extension(mpa): Extension<Arc<MultiPartyAuthorizationService>>,
    Path(key_id): Path<String>,
    Json(body): Json<ScheduleDeletionBody>,
) -> SecurityResult<Json<serde_json::Value>> {
    // The approval must name this exact key and the deletion operation
    // type, and is spent here whether or not the backend call succeeds.
    mpa.consume_approved_operation(
        body.operation_id,
        crate::hsm::KEY_DELETION_OPERATION_TYPE,
        &key_id,
    )
    .await?;
    hsm.schedule_key_deletion(&key_id, body.pending_window_days)
        .await?;
    Ok(Json(serde_json::json!({
        "keyId": key_id,
        "pendingWindowDays": body.pending_window_days,
        "scheduled": true,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRandomBody {
    byte_length: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRandomResponse {
    random: String,
    byte_length: usize,
}

async fn generate_random(
    Extension(hsm): Extension<Arc<HsmKeyManagementService>>,
    Json(body): Json<GenerateRandomBody>,
) -> SecurityResult<Json<GenerateRandomResponse>> {
    let bytes = hsm.generate_secure_random(body.byte_length).await?;
    Ok(Json(GenerateRandomResponse {
        random: STANDARD.encode(bytes.as_slice()),
        byte_length: body.byte_length,
    }))
}
