use std::sync::Arc;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use secrets_backend::kms::{GeneratedDek, KeyMetadata, KmsBackend};
use secrets_backend::records::{
    decrypt_oauth_tokens, encrypt_oauth_tokens, OAuthTokens, SecretPayload,
};
use secrets_backend::{
    EnvelopeEncryptionService, KmsConfig, KmsProvider, KmsRegistry, SecurityError, SecurityResult,
};

fn local_registry(master_key: &str) -> Arc<KmsRegistry> {
    Arc::new(
        KmsRegistry::from_configs(vec![KmsConfig::Local {
            master_key: master_key.to_string(),
        }])
        .unwrap(),
    )
}

fn local_service(master_key: &str) -> EnvelopeEncryptionService {
    EnvelopeEncryptionService::new(KmsProvider::Local, local_registry(master_key)).unwrap()
}

/// In-process stand-in for a remote KEK holder. Wraps DEKs under its own
/// key so cross-provider routing is observable without a network.
struct FakeRemoteBackend {
    kek: [u8; 32],
}

impl FakeRemoteBackend {
    fn new(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut kek = [0u8; 32];
        kek.copy_from_slice(&digest);
        Self { kek }
    }
}

#[async_trait]
impl KmsBackend for FakeRemoteBackend {
    fn provider(&self) -> KmsProvider {
        KmsProvider::Vault
    }

    async fn generate_dek(&self) -> SecurityResult<GeneratedDek> {
        let mut dek = Zeroizing::new(vec![0u8; 32]);
        OsRng.fill_bytes(dek.as_mut_slice());

        let mut iv = [0u8; 12];
        OsRng.fill_bytes(&mut iv);
        let cipher = Aes256Gcm::new_from_slice(&self.kek).unwrap();
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), dek.as_slice())
            .unwrap();

        let mut encrypted_dek = iv.to_vec();
        encrypted_dek.extend_from_slice(&sealed);
        Ok(GeneratedDek {
            dek,
            encrypted_dek,
            kek_version: "fake-remote:v1".to_string(),
        })
    }

    async fn unwrap_dek(&self, encrypted_dek: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let (iv, sealed) = encrypted_dek.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(&self.kek).unwrap();
        cipher
            .decrypt(Nonce::from_slice(iv), sealed)
            .map(Zeroizing::new)
            .map_err(|_| SecurityError::DecryptionFailed)
    }

    async fn generate_random(&self, byte_length: usize) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(vec![0u8; byte_length]);
        OsRng.fill_bytes(out.as_mut_slice());
        Ok(out)
    }

    async fn create_master_key(
        &self,
        _alias: &str,
        _description: &str,
    ) -> SecurityResult<KeyMetadata> {
        unimplemented!("not exercised here")
    }

    async fn list_keys(&self) -> SecurityResult<Vec<KeyMetadata>> {
        Ok(Vec::new())
    }

    async fn schedule_key_deletion(&self, _key_id: &str, _pending_days: u32) -> SecurityResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn round_trip_through_local_provider() {
    let service = local_service("unit-test-master-key");
    let envelope = service.encrypt(b"sk-super-secret").await.unwrap();

    assert_eq!(envelope.algorithm, "aes-256-gcm");
    assert_eq!(envelope.provider, KmsProvider::Local);
    assert_eq!(envelope.kek_version, "local-v1");

    let plaintext = service.decrypt_to_string(&envelope).await.unwrap();
    assert_eq!(plaintext, "sk-super-secret");
}

#[tokio::test]
async fn every_envelope_gets_a_fresh_dek_and_iv() {
    let service = local_service("unit-test-master-key");
    let a = service.encrypt(b"same plaintext").await.unwrap();
    let b = service.encrypt(b"same plaintext").await.unwrap();

    assert_ne!(a.ciphertext, b.ciphertext);
    assert_ne!(a.iv, b.iv);
    assert_ne!(a.encrypted_dek, b.encrypted_dek);
}

#[tokio::test]
async fn tampered_ciphertext_fails_generically() {
    let service = local_service("unit-test-master-key");
    let mut envelope = service.encrypt(b"payload").await.unwrap();

    let mut raw = STANDARD.decode(&envelope.ciphertext).unwrap();
    raw[0] ^= 0x01;
    envelope.ciphertext = STANDARD.encode(raw);

    let err = service.decrypt(&envelope).await.unwrap_err();
    assert!(matches!(err, SecurityError::DecryptionFailed));
}

#[tokio::test]
async fn tampered_auth_tag_fails_generically() {
    let service = local_service("unit-test-master-key");
    let mut envelope = service.encrypt(b"payload").await.unwrap();

    let mut raw = STANDARD.decode(&envelope.auth_tag).unwrap();
    raw[3] ^= 0x80;
    envelope.auth_tag = STANDARD.encode(raw);

    let err = service.decrypt(&envelope).await.unwrap_err();
    assert!(matches!(err, SecurityError::DecryptionFailed));
}

#[tokio::test]
async fn wrong_master_key_fails_generically() {
    let service = local_service("the-right-key");
    let envelope = service.encrypt(b"payload").await.unwrap();

    let other = local_service("the-wrong-key");
    let err = other.decrypt(&envelope).await.unwrap_err();
    assert!(matches!(err, SecurityError::DecryptionFailed));
}

#[tokio::test]
async fn decrypt_routes_by_the_envelope_provider_tag() {
    let registry = local_registry("unit-test-master-key");
    registry.register(Arc::new(FakeRemoteBackend::new("remote-seed")));

    let remote = EnvelopeEncryptionService::new(KmsProvider::Vault, registry.clone()).unwrap();
    let envelope = remote.encrypt(b"written under the remote KEK").await.unwrap();
    assert_eq!(envelope.provider, KmsProvider::Vault);

    // A service configured for local still reads the remote envelope.
    let local = EnvelopeEncryptionService::new(KmsProvider::Local, registry).unwrap();
    let plaintext = local.decrypt_to_string(&envelope).await.unwrap();
    assert_eq!(plaintext, "written under the remote KEK");
}

#[tokio::test]
async fn rotate_kek_rewraps_under_the_new_provider() {
    let registry = local_registry("unit-test-master-key");
    registry.register(Arc::new(FakeRemoteBackend::new("remote-seed")));

    let remote = EnvelopeEncryptionService::new(KmsProvider::Vault, registry.clone()).unwrap();
    let old = remote.encrypt(b"long-lived secret").await.unwrap();

    let rotated = remote.rotate_kek(&old, KmsProvider::Local).await.unwrap();
    assert_eq!(rotated.provider, KmsProvider::Local);
    assert_eq!(rotated.kek_version, "local-v1");
    assert_ne!(rotated.ciphertext, old.ciphertext);

    let local = EnvelopeEncryptionService::new(KmsProvider::Local, registry).unwrap();
    assert_eq!(
        local.decrypt_to_string(&rotated).await.unwrap(),
        "long-lived secret"
    );
}

#[tokio::test]
async fn unregistered_provider_is_a_configuration_error() {
    let registry = local_registry("unit-test-master-key");
    let result = EnvelopeEncryptionService::new(KmsProvider::Vault, registry);
    assert!(matches!(result.err(), Some(SecurityError::Config(_))));
}

#[tokio::test]
async fn stored_payloads_distinguish_envelopes_from_legacy_plaintext() {
    let service = local_service("unit-test-master-key");
    let envelope = service.encrypt(b"modern secret").await.unwrap();
    let stored = serde_json::to_string(&envelope).unwrap();

    let parsed = SecretPayload::parse(&stored);
    assert!(!parsed.is_legacy());
    assert_eq!(parsed.reveal(&service).await.unwrap(), "modern secret");

    let legacy = SecretPayload::parse("sk-legacy-plaintext-key");
    assert!(legacy.is_legacy());
    assert_eq!(
        legacy.reveal(&service).await.unwrap(),
        "sk-legacy-plaintext-key"
    );
}

#[tokio::test]
async fn oauth_token_records_round_trip() {
    let service = local_service("unit-test-master-key");
    let tokens = OAuthTokens {
        access_token: "access-abc".to_string(),
        refresh_token: Some("refresh-xyz".to_string()),
        token_type: "Bearer".to_string(),
        expires_at: Some(Utc::now()),
        instance_url: Some("https://example.my.salesforce.com".to_string()),
        scope: Some("read write".to_string()),
        metadata: None,
    };

    let record = encrypt_oauth_tokens(&service, &tokens).await.unwrap();
    assert_ne!(record.access_token_envelope.ciphertext, tokens.access_token);
    assert!(record.refresh_token_envelope.is_some());
    assert_eq!(record.token_type, "Bearer");

    let recovered = decrypt_oauth_tokens(&service, &record).await.unwrap();
    assert_eq!(recovered.access_token, "access-abc");
    assert_eq!(recovered.refresh_token.as_deref(), Some("refresh-xyz"));
    assert_eq!(recovered.scope.as_deref(), Some("read write"));
}
