use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{SecurityError, SecurityResult};
use crate::kms::{gcm_decrypt, gcm_encrypt, KmsProvider, KmsRegistry, IV_SIZE};

pub const ENVELOPE_ALGORITHM: &str = "aes-256-gcm";

/// key: encryption-envelope
/// Immutable wire/storage form of an envelope-encrypted secret: the payload
/// ciphertext under a one-shot DEK, plus the DEK wrapped by the provider's
/// KEK. Field names match the rows the platform already persists.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionEnvelope {
    pub ciphertext: String,
    #[serde(rename = "encryptedDEK")]
    pub encrypted_dek: String,
    pub iv: String,
    pub auth_tag: String,
    pub algorithm: String,
    pub provider: KmsProvider,
    pub kek_version: String,
    pub timestamp: DateTime<Utc>,
}

/// key: envelope-service
/// Provider-agnostic envelope encryption. Encrypt always uses the configured
/// provider; decrypt routes by the envelope's own provider tag through the
/// injected registry so rotated-away envelopes stay readable.
pub struct EnvelopeEncryptionService {
    provider: KmsProvider,
    registry: Arc<KmsRegistry>,
}

impl EnvelopeEncryptionService {
    pub fn new(provider: KmsProvider, registry: Arc<KmsRegistry>) -> SecurityResult<Self> {
        // Fail at construction, not on the first encrypt.
        registry.get(provider)?;
        Ok(Self { provider, registry })
    }

    pub fn provider(&self) -> KmsProvider {
        self.provider
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> SecurityResult<EncryptionEnvelope> {
        let backend = self.registry.get(self.provider)?;
        let generated = backend.generate_dek().await?;

        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let (ciphertext, tag) = gcm_encrypt(generated.dek.as_slice(), &iv, plaintext)?;
        // `generated.dek` is a Zeroizing buffer scoped to this call; it is
        // wiped on drop no matter how we leave this function.

        Ok(EncryptionEnvelope {
            ciphertext: STANDARD.encode(ciphertext),
            encrypted_dek: STANDARD.encode(&generated.encrypted_dek),
            iv: STANDARD.encode(iv),
            auth_tag: STANDARD.encode(tag),
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            provider: self.provider,
            kek_version: generated.kek_version,
            timestamp: Utc::now(),
        })
    }

    pub async fn decrypt(&self, envelope: &EncryptionEnvelope) -> SecurityResult<Zeroizing<Vec<u8>>> {
        if envelope.algorithm != ENVELOPE_ALGORITHM {
            return Err(SecurityError::DecryptionFailed);
        }
        // Cross-provider decrypt: the envelope's tag wins over our own
        // configuration, which is what makes KEK rotation workable.
        let backend = self.registry.get(envelope.provider)?;

        let encrypted_dek = decode_field(&envelope.encrypted_dek)?;
        let iv = decode_field(&envelope.iv)?;
        let tag = decode_field(&envelope.auth_tag)?;
        let ciphertext = decode_field(&envelope.ciphertext)?;

        let dek = backend.unwrap_dek(&encrypted_dek).await?;
        gcm_decrypt(dek.as_slice(), &iv, &ciphertext, &tag)
    }

    pub async fn decrypt_to_string(&self, envelope: &EncryptionEnvelope) -> SecurityResult<String> {
        let plaintext = self.decrypt(envelope).await?;
        std::str::from_utf8(&plaintext)
            .map(str::to_string)
            .map_err(|_| SecurityError::DecryptionFailed)
    }

    /// Re-encrypt an envelope under a different provider. The intermediate
    /// plaintext lives in a Zeroizing buffer for the duration of the call.
    pub async fn rotate_kek(
        &self,
        old_envelope: &EncryptionEnvelope,
        new_provider: KmsProvider,
    ) -> SecurityResult<EncryptionEnvelope> {
        let plaintext = self.decrypt(old_envelope).await?;
        let rotated = EnvelopeEncryptionService::new(new_provider, self.registry.clone())?;
        rotated.encrypt(plaintext.as_slice()).await
    }
}

fn decode_field(encoded: &str) -> SecurityResult<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|_| SecurityError::DecryptionFailed)
}
