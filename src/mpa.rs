use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::audit::{AuditEvent, SecurityEventSink};
use crate::error::{SecurityError, SecurityResult};

pub const DEFAULT_OPERATION_TTL_MINUTES: i64 = 60;

/// key: mpa-status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::Approved => "APPROVED",
            OperationStatus::Rejected => "REJECTED",
            OperationStatus::Expired => "EXPIRED",
        }
    }
}

/// An individual approval. The signature is an HMAC over the operation id,
/// approver id, and timestamp, so an approval record cannot be replayed
/// against a different operation or attributed to a different approver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub approver_id: String,
    pub approved_at: DateTime<Utc>,
    pub signature: String,
}

/// key: mpa-operation
/// A sensitive operation awaiting quorum. Expiry is evaluated lazily at the
/// moment someone acts on the operation, not by a background sweeper.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub operation_id: Uuid,
    pub operation_type: String,
    pub resource_id: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub required_approvals: u32,
    pub approvals: Vec<Approval>,
    pub status: OperationStatus,
}

/// key: mpa-service
/// In-memory multi-party authorization: no sensitive operation proceeds on a
/// single person's say-so. State transitions are recorded through the audit
/// sink before the outcome is reported to the caller.
pub struct MultiPartyAuthorizationService {
    operations: DashMap<Uuid, PendingOperation>,
    signing_key: [u8; 32],
    audit: Arc<dyn SecurityEventSink>,
}

impl MultiPartyAuthorizationService {
    pub fn new(signing_key: &str, audit: Arc<dyn SecurityEventSink>) -> Self {
        let digest = Sha256::digest(signing_key.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self {
            operations: DashMap::new(),
            signing_key: key,
            audit,
        }
    }

    pub async fn request_operation(
        &self,
        operation_type: &str,
        resource_id: &str,
        requested_by: &str,
        required_approvals: u32,
        ttl: Option<Duration>,
    ) -> SecurityResult<PendingOperation> {
        if operation_type.trim().is_empty() {
            return Err(SecurityError::Config(
                "operation type must not be empty".into(),
            ));
        }
        if required_approvals < 1 {
            return Err(SecurityError::Config(
                "required approvals must be at least 1".into(),
            ));
        }

        let now = Utc::now();
        let operation = PendingOperation {
            operation_id: Uuid::new_v4(),
            operation_type: operation_type.to_string(),
            resource_id: resource_id.to_string(),
            requested_by: requested_by.to_string(),
            requested_at: now,
            expires_at: now + ttl.unwrap_or_else(|| Duration::minutes(DEFAULT_OPERATION_TTL_MINUTES)),
            required_approvals,
            approvals: Vec::new(),
            status: OperationStatus::Pending,
        };
        self.operations
            .insert(operation.operation_id, operation.clone());

        self.audit
            .record(
                AuditEvent::new("MPA_OPERATION_REQUESTED", "mpa-operation")
                    .resource_id(operation.operation_id.to_string())
                    .metadata(json!({
                        "operationType": operation.operation_type,
                        "targetResourceId": operation.resource_id,
                        "requestedBy": operation.requested_by,
                        "requiredApprovals": required_approvals,
                    })),
            )
            .await?;
        Ok(operation)
    }

    /// Record one approval. Fails on expired or settled operations, on the
    /// requester approving their own request, and on duplicate approvers.
    pub async fn approve_operation(
        &self,
        operation_id: Uuid,
        approver_id: &str,
    ) -> SecurityResult<PendingOperation> {
        // Mutation happens inside the map guard's scope; the audit write
        // happens after the guard is dropped so the sink never runs under
        // the shard lock.
        let outcome = {
            let mut entry = self
                .operations
                .get_mut(&operation_id)
                .ok_or(SecurityError::NotFound)?;
            let operation = entry.value_mut();

            if operation.status == OperationStatus::Pending && Utc::now() > operation.expires_at {
                operation.status = OperationStatus::Expired;
            }
            match operation.status {
                OperationStatus::Pending => {}
                OperationStatus::Expired => {
                    return Err(SecurityError::Workflow("Operation has expired".into()))
                }
                other => {
                    return Err(SecurityError::Workflow(format!(
                        "Operation is {}",
                        other.as_str()
                    )))
                }
            }
            if operation.requested_by == approver_id {
                return Err(SecurityError::Workflow(
                    "Requester cannot approve their own operation".into(),
                ));
            }
            if operation
                .approvals
                .iter()
                .any(|a| a.approver_id == approver_id)
            {
                return Err(SecurityError::Workflow(
                    "Already approved by this user".into(),
                ));
            }

            let approved_at = Utc::now();
            let signature =
                approval_signature(&self.signing_key, operation_id, approver_id, &approved_at);
            operation.approvals.push(Approval {
                approver_id: approver_id.to_string(),
                approved_at,
                signature,
            });
            if operation.approvals.len() as u32 >= operation.required_approvals {
                operation.status = OperationStatus::Approved;
            }
            operation.clone()
        };

        let action = if outcome.status == OperationStatus::Approved {
            "MPA_OPERATION_APPROVED"
        } else {
            "MPA_APPROVAL_RECORDED"
        };
        self.audit
            .record(
                AuditEvent::new(action, "mpa-operation")
                    .resource_id(operation_id.to_string())
                    .metadata(json!({
                        "approverId": approver_id,
                        "approvals": outcome.approvals.len(),
                        "requiredApprovals": outcome.required_approvals,
                    })),
            )
            .await?;
        Ok(outcome)
    }

    pub async fn reject_operation(
        &self,
        operation_id: Uuid,
        rejected_by: &str,
        reason: Option<String>,
    ) -> SecurityResult<PendingOperation> {
        let outcome = {
            let mut entry = self
                .operations
                .get_mut(&operation_id)
                .ok_or(SecurityError::NotFound)?;
            let operation = entry.value_mut();

            if operation.status == OperationStatus::Pending && Utc::now() > operation.expires_at {
                operation.status = OperationStatus::Expired;
            }
            match operation.status {
                OperationStatus::Pending => {}
                OperationStatus::Expired => {
                    return Err(SecurityError::Workflow("Operation has expired".into()))
                }
                other => {
                    return Err(SecurityError::Workflow(format!(
                        "Operation is {}",
                        other.as_str()
                    )))
                }
            }
            operation.status = OperationStatus::Rejected;
            operation.clone()
        };

        self.audit
            .record(
                AuditEvent::new("MPA_OPERATION_REJECTED", "mpa-operation")
                    .resource_id(operation_id.to_string())
                    .metadata(json!({
                        "rejectedBy": rejected_by,
                        "reason": reason,
                    })),
            )
            .await?;
        Ok(outcome)
    }

    /// Atomically take an APPROVED operation that authorizes exactly this
    /// action. The approval binds to one operation type and one resource and
    /// is single-use: a consumed operation cannot open the gate again.
    pub async fn consume_approved_operation(
        &self,
        operation_id: Uuid,
        operation_type: &str,
        resource_id: &str,
    ) -> SecurityResult<PendingOperation> {
        let removed = self.operations.remove_if(&operation_id, |_, operation| {
            operation.status == OperationStatus::Approved
                && operation.operation_type == operation_type
                && operation.resource_id == resource_id
        });
        let (_, operation) = removed.ok_or_else(|| {
            SecurityError::Workflow(
                "action requires a matching approved multi-party operation".into(),
            )
        })?;

        self.audit
            .record(
                AuditEvent::new("MPA_OPERATION_CONSUMED", "mpa-operation")
                    .resource_id(operation_id.to_string())
                    .metadata(json!({
                        "operationType": operation.operation_type,
                        "targetResourceId": operation.resource_id,
                    })),
            )
            .await?;
        Ok(operation)
    }

    pub fn get_operation(&self, operation_id: Uuid) -> Option<PendingOperation> {
        self.operations
            .get(&operation_id)
            .map(|entry| entry.value().clone())
    }

    /// True only for an operation that reached quorum and has not expired.
    pub fn is_operation_approved(&self, operation_id: Uuid) -> bool {
        let Some(mut entry) = self.operations.get_mut(&operation_id) else {
            return false;
        };
        let operation = entry.value_mut();
        if operation.status == OperationStatus::Pending && Utc::now() > operation.expires_at {
            operation.status = OperationStatus::Expired;
        }
        operation.status == OperationStatus::Approved
    }

    pub fn verify_approval_signature(&self, operation_id: Uuid, approval: &Approval) -> bool {
        approval_signature(
            &self.signing_key,
            operation_id,
            &approval.approver_id,
            &approval.approved_at,
        ) == approval.signature
    }
}

fn approval_signature(
    signing_key: &[u8; 32],
    operation_id: Uuid,
    approver_id: &str,
    timestamp: &DateTime<Utc>,
) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(signing_key).expect("HMAC accepts any key length");
    mac.update(
        format!(
            "{}:{}:{}",
            operation_id,
            approver_id,
            timestamp.timestamp_millis()
        )
        .as_bytes(),
    );
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Sink that remembers every event so tests can assert on transitions.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl SecurityEventSink for RecordingSink {
        async fn record(&self, event: AuditEvent) -> SecurityResult<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn service() -> (MultiPartyAuthorizationService, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (
            MultiPartyAuthorizationService::new("test-signing-key", sink.clone()),
            sink,
        )
    }

    fn actions(sink: &RecordingSink) -> Vec<String> {
        sink.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }

    #[tokio::test]
    async fn two_approvals_reach_quorum() {
        let (mpa, sink) = service();
        let op = mpa
            .request_operation("DELETE_MASTER_KEY", "key-1", "alice", 2, None)
            .await
            .unwrap();

        let after_one = mpa.approve_operation(op.operation_id, "bob").await.unwrap();
        assert_eq!(after_one.status, OperationStatus::Pending);
        assert!(!mpa.is_operation_approved(op.operation_id));

        let after_two = mpa
            .approve_operation(op.operation_id, "carol")
            .await
            .unwrap();
        assert_eq!(after_two.status, OperationStatus::Approved);
        assert!(mpa.is_operation_approved(op.operation_id));

        assert_eq!(
            actions(&sink),
            vec![
                "MPA_OPERATION_REQUESTED",
                "MPA_APPROVAL_RECORDED",
                "MPA_OPERATION_APPROVED",
            ]
        );
    }

    #[tokio::test]
    async fn settled_operations_reject_further_approvals() {
        let (mpa, _) = service();
        let op = mpa
            .request_operation("DELETE_MASTER_KEY", "key-1", "alice", 2, None)
            .await
            .unwrap();
        mpa.approve_operation(op.operation_id, "bob").await.unwrap();
        mpa.approve_operation(op.operation_id, "carol")
            .await
            .unwrap();

        let err = mpa
            .approve_operation(op.operation_id, "dave")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Operation is APPROVED");
    }

    #[tokio::test]
    async fn requester_cannot_self_approve() {
        let (mpa, _) = service();
        let op = mpa
            .request_operation("EXPORT_KEY", "key-1", "alice", 2, None)
            .await
            .unwrap();
        let err = mpa
            .approve_operation(op.operation_id, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Requester cannot approve their own operation");
    }

    #[tokio::test]
    async fn duplicate_approver_is_rejected() {
        let (mpa, _) = service();
        let op = mpa
            .request_operation("EXPORT_KEY", "key-1", "alice", 3, None)
            .await
            .unwrap();
        mpa.approve_operation(op.operation_id, "bob").await.unwrap();
        let err = mpa
            .approve_operation(op.operation_id, "bob")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Already approved by this user");
    }

    #[tokio::test]
    async fn rejection_settles_the_operation() {
        let (mpa, sink) = service();
        let op = mpa
            .request_operation("EXPORT_KEY", "key-1", "alice", 2, None)
            .await
            .unwrap();
        let rejected = mpa
            .reject_operation(op.operation_id, "bob", Some("not justified".into()))
            .await
            .unwrap();
        assert_eq!(rejected.status, OperationStatus::Rejected);

        let err = mpa
            .approve_operation(op.operation_id, "carol")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Operation is REJECTED");
        assert!(actions(&sink).contains(&"MPA_OPERATION_REJECTED".to_string()));
    }

    #[tokio::test]
    async fn expiry_is_applied_lazily() {
        let (mpa, _) = service();
        let op = mpa
            .request_operation(
                "EXPORT_KEY",
                "key-1",
                "alice",
                2,
                Some(Duration::milliseconds(-1)),
            )
            .await
            .unwrap();

        let err = mpa
            .approve_operation(op.operation_id, "bob")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Operation has expired");
        assert_eq!(
            mpa.get_operation(op.operation_id).unwrap().status,
            OperationStatus::Expired
        );
        assert!(!mpa.is_operation_approved(op.operation_id));
    }

    #[tokio::test]
    async fn approval_signatures_verify_and_bind_to_operation() {
        let (mpa, _) = service();
        let op = mpa
            .request_operation("EXPORT_KEY", "key-1", "alice", 1, None)
            .await
            .unwrap();
        let approved = mpa.approve_operation(op.operation_id, "bob").await.unwrap();
        let approval = &approved.approvals[0];

        assert!(mpa.verify_approval_signature(op.operation_id, approval));
        assert!(!mpa.verify_approval_signature(Uuid::new_v4(), approval));

        let mut forged = approval.clone();
        forged.approver_id = "mallory".into();
        assert!(!mpa.verify_approval_signature(op.operation_id, &forged));
    }

    #[tokio::test]
    async fn consume_requires_a_matching_approved_operation() {
        let (mpa, sink) = service();
        let op = mpa
            .request_operation("DELETE_MASTER_KEY", "key-1", "alice", 1, None)
            .await
            .unwrap();
        mpa.approve_operation(op.operation_id, "bob").await.unwrap();

        // Wrong operation type and wrong resource both leave the gate shut.
        assert!(mpa
            .consume_approved_operation(op.operation_id, "EXPORT_KEY", "key-1")
            .await
            .is_err());
        assert!(mpa
            .consume_approved_operation(op.operation_id, "DELETE_MASTER_KEY", "key-2")
            .await
            .is_err());
        // Failed attempts do not spend the approval.
        assert!(mpa.get_operation(op.operation_id).is_some());

        let consumed = mpa
            .consume_approved_operation(op.operation_id, "DELETE_MASTER_KEY", "key-1")
            .await
            .unwrap();
        assert_eq!(consumed.status, OperationStatus::Approved);

        // Single-use: the approval is gone.
        assert!(mpa.get_operation(op.operation_id).is_none());
        assert!(mpa
            .consume_approved_operation(op.operation_id, "DELETE_MASTER_KEY", "key-1")
            .await
            .is_err());
        assert!(actions(&sink).contains(&"MPA_OPERATION_CONSUMED".to_string()));
    }

    #[tokio::test]
    async fn pending_operations_cannot_be_consumed() {
        let (mpa, _) = service();
        let op = mpa
            .request_operation("DELETE_MASTER_KEY", "key-1", "alice", 2, None)
            .await
            .unwrap();
        mpa.approve_operation(op.operation_id, "bob").await.unwrap();

        let err = mpa
            .consume_approved_operation(op.operation_id, "DELETE_MASTER_KEY", "key-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::Workflow(_)));
        assert!(mpa.get_operation(op.operation_id).is_some());
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let (mpa, _) = service();
        let err = mpa
            .approve_operation(Uuid::new_v4(), "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::NotFound));
        assert!(mpa.get_operation(Uuid::new_v4()).is_none());
    }
}
