pub mod audit;
pub mod config;
pub mod envelope;
pub mod error;
pub mod hsm;
pub mod kms;
pub mod mpa;
pub mod records;
pub mod routes;
pub mod shamir;

pub use audit::{AuditEntry, AuditEvent, SecurityEventSink, TamperProofAuditLogger};
pub use envelope::{EncryptionEnvelope, EnvelopeEncryptionService};
pub use error::{SecurityError, SecurityResult};
pub use hsm::HsmKeyManagementService;
pub use kms::{KmsBackend, KmsConfig, KmsProvider, KmsRegistry};
pub use mpa::MultiPartyAuthorizationService;
pub use shamir::SplitKeyShare;
