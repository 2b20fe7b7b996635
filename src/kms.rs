use std::sync::Arc;
use std::time::Duration;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::{SecurityError, SecurityResult};

pub const DEK_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// key: kms-provider
/// Tag identifying which KEK backend produced an envelope. Stored inside
/// every envelope so decrypt can route to the matching backend.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum KmsProvider {
    Local,
    Vault,
}

impl KmsProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            KmsProvider::Local => "local",
            KmsProvider::Vault => "vault",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "local" => Some(KmsProvider::Local),
            "vault" => Some(KmsProvider::Vault),
            _ => None,
        }
    }
}

/// key: kms-config
/// Tagged union over backend kind. Each variant carries only its own
/// required fields; missing fields are rejected when the backend is built,
/// not discovered mid-call.
#[derive(Clone, Debug)]
pub enum KmsConfig {
    Local {
        master_key: String,
    },
    Vault {
        addr: String,
        token: String,
        mount: String,
        transit_key: String,
    },
}

impl KmsConfig {
    pub fn provider(&self) -> KmsProvider {
        match self {
            KmsConfig::Local { .. } => KmsProvider::Local,
            KmsConfig::Vault { .. } => KmsProvider::Vault,
        }
    }

    pub fn build_backend(self) -> SecurityResult<Arc<dyn KmsBackend>> {
        match self {
            KmsConfig::Local { master_key } => {
                if master_key.trim().is_empty() {
                    return Err(SecurityError::Config(
                        "local KMS requires a non-empty master key".into(),
                    ));
                }
                Ok(Arc::new(LocalKmsBackend::new(master_key)))
            }
            KmsConfig::Vault {
                addr,
                token,
                mount,
                transit_key,
            } => {
                if addr.trim().is_empty() || token.trim().is_empty() {
                    return Err(SecurityError::Config(
                        "vault KMS requires both an address and a token".into(),
                    ));
                }
                if transit_key.trim().is_empty() {
                    return Err(SecurityError::Config(
                        "vault KMS requires a transit key name".into(),
                    ));
                }
                Ok(Arc::new(VaultTransitBackend::new(
                    addr,
                    token,
                    mount,
                    transit_key,
                )))
            }
        }
    }
}

/// Fresh DEK paired with its wrapped form. The plaintext half is zeroed when
/// the holder drops it.
pub struct GeneratedDek {
    pub dek: Zeroizing<Vec<u8>>,
    pub encrypted_dek: Vec<u8>,
    pub kek_version: String,
}

/// key: key-metadata
/// Master-key lifecycle record returned by HSM-backed providers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub key_id: String,
    pub algorithm: String,
    pub key_usage: KeyUsage,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub provider: KmsProvider,
    pub key_state: KeyState,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyUsage {
    EncryptDecrypt,
    SignVerify,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyState {
    Enabled,
    Disabled,
    PendingDeletion,
}

/// key: kms-backend
/// Capability seam between the envelope/HSM services and a concrete KEK
/// holder. Business logic depends only on this trait; the single place a
/// provider tag is consulted is the registry lookup during decrypt.
#[async_trait]
pub trait KmsBackend: Send + Sync {
    fn provider(&self) -> KmsProvider;

    /// Generate a fresh 256-bit DEK together with its KEK-wrapped form.
    async fn generate_dek(&self) -> SecurityResult<GeneratedDek>;

    /// Recover the plaintext DEK from its wrapped form.
    async fn unwrap_dek(&self, encrypted_dek: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>>;

    /// Draw cryptographically secure randomness from the backend.
    async fn generate_random(&self, byte_length: usize) -> SecurityResult<Zeroizing<Vec<u8>>>;

    async fn create_master_key(
        &self,
        alias: &str,
        description: &str,
    ) -> SecurityResult<KeyMetadata>;

    async fn list_keys(&self) -> SecurityResult<Vec<KeyMetadata>>;

    async fn schedule_key_deletion(&self, key_id: &str, pending_days: u32) -> SecurityResult<()>;
}

/// key: kms-registry
/// Provider -> backend lookup injected wherever a cross-provider decrypt can
/// happen. Makes the provider/config mapping explicit instead of re-reading
/// environment state per call.
#[derive(Default)]
pub struct KmsRegistry {
    backends: DashMap<KmsProvider, Arc<dyn KmsBackend>>,
}

impl KmsRegistry {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    pub fn from_configs(configs: Vec<KmsConfig>) -> SecurityResult<Self> {
        let registry = Self::new();
        for config in configs {
            registry.register(config.build_backend()?);
        }
        Ok(registry)
    }

    pub fn register(&self, backend: Arc<dyn KmsBackend>) {
        self.backends.insert(backend.provider(), backend);
    }

    pub fn get(&self, provider: KmsProvider) -> SecurityResult<Arc<dyn KmsBackend>> {
        self.backends
            .get(&provider)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                SecurityError::Config(format!(
                    "no KMS backend registered for provider '{}'",
                    provider.as_str()
                ))
            })
    }
}

fn aes256_gcm(key: &[u8]) -> SecurityResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| SecurityError::Config("KEK must be exactly 256 bits".into()))
}

/// AES-256-GCM encrypt, returning `(ciphertext, tag)` separately.
pub(crate) fn gcm_encrypt(
    key: &[u8],
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> SecurityResult<(Vec<u8>, Vec<u8>)> {
    let cipher = aes256_gcm(key)?;
    let mut combined = cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| SecurityError::Message("AEAD encryption failed".into()))?;
    let tag = combined.split_off(combined.len() - TAG_SIZE);
    Ok((combined, tag))
}

/// AES-256-GCM decrypt from split `ciphertext`/`tag`. Every failure collapses
/// to the one generic decrypt error.
pub(crate) fn gcm_decrypt(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> SecurityResult<Zeroizing<Vec<u8>>> {
    if iv.len() != IV_SIZE || tag.len() != TAG_SIZE {
        return Err(SecurityError::DecryptionFailed);
    }
    let cipher = aes256_gcm(key).map_err(|_| SecurityError::DecryptionFailed)?;
    let mut combined = Vec::with_capacity(ciphertext.len() + tag.len());
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), combined.as_slice())
        .map_err(|_| SecurityError::DecryptionFailed)?;
    Ok(Zeroizing::new(plaintext))
}

/// key: kms-local-backend
/// Software fallback: KEK derived from the configured master key via SHA-256,
/// DEKs wrapped locally as `iv || tag || ciphertext`. Carries no
/// key-management API.
pub struct LocalKmsBackend {
    master_key: String,
}

pub const LOCAL_KEK_VERSION: &str = "local-v1";

impl LocalKmsBackend {
    pub fn new(master_key: String) -> Self {
        Self { master_key }
    }

    fn kek(&self) -> Zeroizing<[u8; 32]> {
        let digest = Sha256::digest(self.master_key.as_bytes());
        let mut kek = Zeroizing::new([0u8; 32]);
        kek.copy_from_slice(&digest);
        kek
    }

    fn unsupported(&self, operation: &str) -> SecurityError {
        SecurityError::Config(format!(
            "{operation} requires an HSM-backed KMS provider; the local backend has no key-management API"
        ))
    }
}

#[async_trait]
impl KmsBackend for LocalKmsBackend {
    fn provider(&self) -> KmsProvider {
        KmsProvider::Local
    }

    async fn generate_dek(&self) -> SecurityResult<GeneratedDek> {
        let mut dek = Zeroizing::new(vec![0u8; DEK_SIZE]);
        OsRng.fill_bytes(dek.as_mut_slice());

        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let kek = self.kek();
        let (ciphertext, tag) = gcm_encrypt(kek.as_slice(), &iv, dek.as_slice())?;

        let mut encrypted_dek = Vec::with_capacity(IV_SIZE + TAG_SIZE + ciphertext.len());
        encrypted_dek.extend_from_slice(&iv);
        encrypted_dek.extend_from_slice(&tag);
        encrypted_dek.extend_from_slice(&ciphertext);

        Ok(GeneratedDek {
            dek,
            encrypted_dek,
            kek_version: LOCAL_KEK_VERSION.to_string(),
        })
    }

    async fn unwrap_dek(&self, encrypted_dek: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>> {
        if encrypted_dek.len() <= IV_SIZE + TAG_SIZE {
            return Err(SecurityError::DecryptionFailed);
        }
        let iv = &encrypted_dek[..IV_SIZE];
        let tag = &encrypted_dek[IV_SIZE..IV_SIZE + TAG_SIZE];
        let ciphertext = &encrypted_dek[IV_SIZE + TAG_SIZE..];
        let kek = self.kek();
        gcm_decrypt(kek.as_slice(), iv, ciphertext, tag)
    }

    async fn generate_random(&self, byte_length: usize) -> SecurityResult<Zeroizing<Vec<u8>>> {
        // HSM simulation: OS randomness stretched through an HMAC keyed by a
        // seed-and-timestamp digest, mirroring a hardware DRBG chain.
        let context = Sha256::digest(
            format!("{}{}", self.master_key, Utc::now().timestamp_millis()).as_bytes(),
        );
        let mut out = Zeroizing::new(Vec::with_capacity(byte_length));
        while out.len() < byte_length {
            let mut seed = Zeroizing::new([0u8; 64]);
            OsRng.fill_bytes(seed.as_mut());
            let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(&context)
                .map_err(|_| SecurityError::Message("HMAC key setup failed".into()))?;
            mac.update(seed.as_ref());
            out.extend_from_slice(&mac.finalize().into_bytes());
        }
        out.truncate(byte_length);
        Ok(out)
    }

    async fn create_master_key(
        &self,
        _alias: &str,
        _description: &str,
    ) -> SecurityResult<KeyMetadata> {
        Err(self.unsupported("master key creation"))
    }

    async fn list_keys(&self) -> SecurityResult<Vec<KeyMetadata>> {
        Err(self.unsupported("key listing"))
    }

    async fn schedule_key_deletion(&self, _key_id: &str, _pending_days: u32) -> SecurityResult<()> {
        Err(self.unsupported("key deletion"))
    }
}

/// key: kms-vault-backend
/// HashiCorp Vault transit backend. DEKs come from the transit datakey
/// endpoint so the KEK never leaves Vault; key lifecycle maps onto the
/// transit keys API.
pub struct VaultTransitBackend {
    base: String,
    token: String,
    mount: String,
    transit_key: String,
    client: Client,
}

impl VaultTransitBackend {
    pub fn new(base: String, token: String, mount: String, transit_key: String) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            token,
            mount,
            transit_key,
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("client build"),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> SecurityResult<Value> {
        let url = format!("{}/v1/{}", self.base, path);
        let mut req = self
            .client
            .request(method, &url)
            .header("X-Vault-Token", &self.token);
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await?.error_for_status()?;
        if resp.content_length().unwrap_or(0) == 0 {
            return Ok(Value::Null);
        }
        Ok(resp.json().await?)
    }

    fn decode_b64_secret(value: &Value, pointer: &str) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let encoded = value
            .pointer(pointer)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SecurityError::Message(format!("vault response missing {pointer}"))
            })?;
        STANDARD
            .decode(encoded)
            .map(Zeroizing::new)
            .map_err(|_| SecurityError::Message("vault returned invalid base64".into()))
    }

    async fn read_key_metadata(&self, name: &str) -> SecurityResult<KeyMetadata> {
        let value = self
            .request(
                reqwest::Method::GET,
                &format!("{}/keys/{}", self.mount, name),
                None,
            )
            .await?;
        Ok(Self::key_metadata_from_value(name, &value))
    }

    fn key_metadata_from_value(name: &str, value: &Value) -> KeyMetadata {
        let algorithm = value
            .pointer("/data/type")
            .and_then(Value::as_str)
            .unwrap_or("aes256-gcm96")
            .to_string();
        let deletion_allowed = value
            .pointer("/data/deletion_allowed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let created_at = value
            .pointer("/data/keys/1/creation_time")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        KeyMetadata {
            key_id: name.to_string(),
            algorithm,
            key_usage: KeyUsage::EncryptDecrypt,
            created_at,
            expires_at: None,
            provider: KmsProvider::Vault,
            key_state: if deletion_allowed {
                KeyState::PendingDeletion
            } else {
                KeyState::Enabled
            },
        }
    }
}

#[async_trait]
impl KmsBackend for VaultTransitBackend {
    fn provider(&self) -> KmsProvider {
        KmsProvider::Vault
    }

    async fn generate_dek(&self) -> SecurityResult<GeneratedDek> {
        let value = self
            .request(
                reqwest::Method::POST,
                &format!("{}/datakey/plaintext/{}", self.mount, self.transit_key),
                Some(serde_json::json!({ "bits": 256 })),
            )
            .await?;
        let dek = Self::decode_b64_secret(&value, "/data/plaintext")?;
        let wrapped = value
            .pointer("/data/ciphertext")
            .and_then(Value::as_str)
            .ok_or_else(|| SecurityError::Message("vault datakey response missing ciphertext".into()))?;
        let version = value
            .pointer("/data/key_version")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        Ok(GeneratedDek {
            dek,
            encrypted_dek: wrapped.as_bytes().to_vec(),
            kek_version: format!("{}:v{}", self.transit_key, version),
        })
    }

    async fn unwrap_dek(&self, encrypted_dek: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let ciphertext = std::str::from_utf8(encrypted_dek)
            .map_err(|_| SecurityError::DecryptionFailed)?;
        let value = self
            .request(
                reqwest::Method::POST,
                &format!("{}/decrypt/{}", self.mount, self.transit_key),
                Some(serde_json::json!({ "ciphertext": ciphertext })),
            )
            .await
            .map_err(|err| match err {
                // Vault answers 400 for a bad ciphertext; keep the decrypt
                // oracle closed.
                SecurityError::Kms(inner) if inner.status().map_or(false, |s| s.is_client_error()) => {
                    SecurityError::DecryptionFailed
                }
                other => other,
            })?;
        Self::decode_b64_secret(&value, "/data/plaintext")
            .map_err(|_| SecurityError::DecryptionFailed)
    }

    async fn generate_random(&self, byte_length: usize) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let value = self
            .request(
                reqwest::Method::POST,
                &format!("sys/tools/random/{byte_length}"),
                Some(serde_json::json!({ "format": "base64" })),
            )
            .await?;
        Self::decode_b64_secret(&value, "/data/random_bytes")
    }

    async fn create_master_key(
        &self,
        alias: &str,
        description: &str,
    ) -> SecurityResult<KeyMetadata> {
        self.request(
            reqwest::Method::POST,
            &format!("{}/keys/{}", self.mount, alias),
            Some(serde_json::json!({
                "type": "aes256-gcm96",
                "description": description,
            })),
        )
        .await?;
        self.read_key_metadata(alias).await
    }

    async fn list_keys(&self) -> SecurityResult<Vec<KeyMetadata>> {
        let list_method =
            reqwest::Method::from_bytes(b"LIST").expect("LIST is a valid HTTP method");
        let value = self
            .request(list_method, &format!("{}/keys", self.mount), None)
            .await?;
        let names: Vec<String> = value
            .pointer("/data/keys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut keys = Vec::with_capacity(names.len());
        for name in names {
            keys.push(self.read_key_metadata(&name).await?);
        }
        Ok(keys)
    }

    async fn schedule_key_deletion(&self, key_id: &str, _pending_days: u32) -> SecurityResult<()> {
        // Transit keys are delete-locked by default. Lifting the lock parks
        // the key in PENDING_DELETION; actual destruction is a later,
        // separate step, since Vault has no timed pending window of its own.
        self.request(
            reqwest::Method::POST,
            &format!("{}/keys/{}/config", self.mount, key_id),
            Some(serde_json::json!({ "deletion_allowed": true })),
        )
        .await?;
        Ok(())
    }
}
