use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{EncryptionEnvelope, EnvelopeEncryptionService};
use crate::error::SecurityResult;

/// Plaintext OAuth credential set as handed over by a connector.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// key: encrypted-token-record
/// Storage form of a connector credential set: each token sits in its own
/// envelope, non-secret routing fields stay in the clear.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedTokenRecord {
    pub access_token_envelope: EncryptionEnvelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_envelope: Option<EncryptionEnvelope>,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// key: secret-payload
/// A stored secret column is either a serialized envelope or, for rows that
/// predate envelope encryption, the raw plaintext. Parsing never fails: what
/// does not deserialize as a complete envelope is treated as legacy.
#[derive(Clone, Debug)]
pub enum SecretPayload {
    Envelope(Box<EncryptionEnvelope>),
    Legacy(String),
}

impl SecretPayload {
    pub fn parse(stored: &str) -> Self {
        match serde_json::from_str::<EncryptionEnvelope>(stored) {
            Ok(envelope) => SecretPayload::Envelope(Box::new(envelope)),
            Err(_) => SecretPayload::Legacy(stored.to_string()),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, SecretPayload::Legacy(_))
    }

    /// Recover the plaintext secret, decrypting the envelope form and
    /// passing legacy plaintext through unchanged.
    pub async fn reveal(&self, service: &EnvelopeEncryptionService) -> SecurityResult<String> {
        match self {
            SecretPayload::Envelope(envelope) => service.decrypt_to_string(envelope).await,
            SecretPayload::Legacy(plaintext) => Ok(plaintext.clone()),
        }
    }
}

pub async fn encrypt_oauth_tokens(
    service: &EnvelopeEncryptionService,
    tokens: &OAuthTokens,
) -> SecurityResult<EncryptedTokenRecord> {
    let access_token_envelope = service.encrypt(tokens.access_token.as_bytes()).await?;
    let refresh_token_envelope = match &tokens.refresh_token {
        Some(refresh) => Some(service.encrypt(refresh.as_bytes()).await?),
        None => None,
    };
    Ok(EncryptedTokenRecord {
        access_token_envelope,
        refresh_token_envelope,
        token_type: tokens.token_type.clone(),
        expires_at: tokens.expires_at,
        instance_url: tokens.instance_url.clone(),
        scope: tokens.scope.clone(),
        metadata: tokens.metadata.clone(),
    })
}

pub async fn decrypt_oauth_tokens(
    service: &EnvelopeEncryptionService,
    record: &EncryptedTokenRecord,
) -> SecurityResult<OAuthTokens> {
    let access_token = service
        .decrypt_to_string(&record.access_token_envelope)
        .await?;
    let refresh_token = match &record.refresh_token_envelope {
        Some(envelope) => Some(service.decrypt_to_string(envelope).await?),
        None => None,
    };
    Ok(OAuthTokens {
        access_token,
        refresh_token,
        token_type: record.token_type.clone(),
        expires_at: record.expires_at,
        instance_url: record.instance_url.clone(),
        scope: record.scope.clone(),
        metadata: record.metadata.clone(),
    })
}
