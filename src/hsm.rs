use std::sync::Arc;

use serde_json::json;
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, SecurityEventSink};
use crate::error::{SecurityError, SecurityResult};
use crate::kms::{KmsBackend, KeyMetadata};
use crate::shamir::{self, SplitKeyShare};

pub const MIN_DELETION_WINDOW_DAYS: u32 = 7;
pub const MAX_DELETION_WINDOW_DAYS: u32 = 30;

/// Operation type a multi-party approval must carry to authorize destroying
/// a master key.
pub const KEY_DELETION_OPERATION_TYPE: &str = "DELETE_MASTER_KEY";

/// key: hsm-service
/// Master-key lifecycle operations against an HSM-backed KMS provider, each
/// recorded in the tamper-evident audit log. The cryptographic operation
/// runs first; a failure to record it is then surfaced to the caller rather
/// than swallowed, so no completed operation goes unlogged.
pub struct HsmKeyManagementService {
    backend: Arc<dyn KmsBackend>,
    audit: Arc<dyn SecurityEventSink>,
}

impl HsmKeyManagementService {
    pub fn new(backend: Arc<dyn KmsBackend>, audit: Arc<dyn SecurityEventSink>) -> Self {
        Self { backend, audit }
    }

    pub async fn generate_secure_random(
        &self,
        byte_length: usize,
    ) -> SecurityResult<Zeroizing<Vec<u8>>> {
        if byte_length == 0 || byte_length > 1024 {
            return Err(SecurityError::Config(
                "random byte length must be between 1 and 1024".into(),
            ));
        }
        let bytes = self.backend.generate_random(byte_length).await?;
        self.audit
            .record(
                AuditEvent::new("HSM_RANDOM_GENERATED", "hsm").metadata(json!({
                    "byteLength": byte_length,
                    "provider": self.backend.provider().as_str(),
                })),
            )
            .await?;
        Ok(bytes)
    }

    pub async fn create_master_key(
        &self,
        alias: &str,
        description: &str,
    ) -> SecurityResult<KeyMetadata> {
        if alias.trim().is_empty() {
            return Err(SecurityError::Config("key alias must not be empty".into()));
        }
        let metadata = self.backend.create_master_key(alias, description).await?;
        self.audit
            .record(
                AuditEvent::new("MASTER_KEY_CREATED", "master-key")
                    .resource_id(&metadata.key_id)
                    .metadata(json!({
                        "alias": alias,
                        "algorithm": metadata.algorithm,
                        "provider": metadata.provider.as_str(),
                    })),
            )
            .await?;
        Ok(metadata)
    }

    pub async fn list_keys(&self) -> SecurityResult<Vec<KeyMetadata>> {
        self.backend.list_keys().await
    }

    /// Schedule destruction of a master key after a pending window. Deletion
    /// is the one operation dangerous enough to also require multi-party
    /// authorization; the HTTP layer enforces that gate before calling here.
    pub async fn schedule_key_deletion(
        &self,
        key_id: &str,
        pending_window_days: u32,
    ) -> SecurityResult<()> {
        if !(MIN_DELETION_WINDOW_DAYS..=MAX_DELETION_WINDOW_DAYS).contains(&pending_window_days) {
            return Err(SecurityError::Config(format!(
                "pending window must be between {MIN_DELETION_WINDOW_DAYS} and {MAX_DELETION_WINDOW_DAYS} days"
            )));
        }
        self.backend
            .schedule_key_deletion(key_id, pending_window_days)
            .await?;
        self.audit
            .record(
                AuditEvent::new("MASTER_KEY_DELETION_SCHEDULED", "master-key")
                    .resource_id(key_id)
                    .metadata(json!({
                        "pendingWindowDays": pending_window_days,
                        "provider": self.backend.provider().as_str(),
                    })),
            )
            .await?;
        Ok(())
    }

    /// Split key material into Shamir shares. Only share counts and
    /// parameters reach the audit log, never the material itself.
    pub async fn split_key_with_shamir_sharing(
        &self,
        key_material: &[u8],
        total_shares: u8,
        threshold: u8,
    ) -> SecurityResult<Vec<SplitKeyShare>> {
        let shares = shamir::split_secret(key_material, total_shares, threshold)?;
        self.audit
            .record(
                AuditEvent::new("KEY_SPLIT", "master-key").metadata(json!({
                    "totalShares": total_shares,
                    "threshold": threshold,
                    "keyLengthBytes": key_material.len(),
                })),
            )
            .await?;
        Ok(shares)
    }

    pub async fn reconstruct_key_from_shares(
        &self,
        shares: &[SplitKeyShare],
    ) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let secret = shamir::reconstruct_secret(shares)?;
        self.audit
            .record(
                AuditEvent::new("KEY_RECONSTRUCTED", "master-key").metadata(json!({
                    "sharesProvided": shares.len(),
                    "threshold": shares.first().map(|s| s.threshold),
                })),
            )
            .await?;
        Ok(secret)
    }
}
