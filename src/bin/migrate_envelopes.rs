//! One-shot migration of legacy single-layer API key encryption to envelope
//! encryption. Safe to re-run: already-migrated rows are filtered out by
//! `encryption_version`.

use std::sync::Arc;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing_subscriber::{fmt, EnvFilter};
use zeroize::Zeroizing;

use secrets_backend::audit::bootstrap_audit_table;
use secrets_backend::{config, EnvelopeEncryptionService, KmsRegistry};

#[derive(Default)]
struct MigrationResult {
    total_records: usize,
    migrated_records: usize,
    failed_records: usize,
    errors: Vec<(String, String)>,
}

/// Decrypt the pre-envelope format: AES-256-GCM keyed directly by
/// SHA-256(master key), with ciphertext, IV, and tag stored base64 in
/// separate columns.
fn decrypt_old_format(
    encrypted_data: &str,
    iv: &str,
    auth_tag: &str,
    master_key: &str,
) -> anyhow::Result<Zeroizing<String>> {
    let key = Sha256::digest(master_key.as_bytes());
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow!("bad key length"))?;

    let iv = STANDARD.decode(iv).context("invalid iv encoding")?;
    let mut combined = STANDARD
        .decode(encrypted_data)
        .context("invalid ciphertext encoding")?;
    combined.extend_from_slice(&STANDARD.decode(auth_tag).context("invalid tag encoding")?);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), combined.as_slice())
        .map_err(|_| anyhow!("legacy decryption failed"))?;
    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .context("legacy plaintext is not utf-8")
}

async fn add_envelope_columns(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        "ALTER TABLE ai_configurations \
         ADD COLUMN IF NOT EXISTS encrypted_dek TEXT, \
         ADD COLUMN IF NOT EXISTS kms_provider VARCHAR(50), \
         ADD COLUMN IF NOT EXISTS kek_version TEXT",
    )
    .execute(pool)
    .await
    .context("adding envelope columns")?;
    Ok(())
}

async fn migrate_api_keys(
    pool: &PgPool,
    service: &EnvelopeEncryptionService,
    master_key: &str,
) -> anyhow::Result<MigrationResult> {
    let mut result = MigrationResult::default();

    let rows = sqlx::query(
        "SELECT id, encrypted_api_key, encryption_iv, encryption_auth_tag \
         FROM ai_configurations \
         WHERE encrypted_api_key IS NOT NULL \
           AND (encryption_version IS NULL OR encryption_version < 2)",
    )
    .fetch_all(pool)
    .await?;
    result.total_records = rows.len();

    if rows.is_empty() {
        tracing::info!("no API keys to migrate");
        return Ok(result);
    }

    for row in rows {
        let id: i32 = row.get("id");
        let migrated = migrate_row(pool, service, master_key, &row, id).await;
        match migrated {
            Ok(()) => {
                result.migrated_records += 1;
                tracing::info!(id, "migrated API key");
            }
            Err(error) => {
                result.failed_records += 1;
                tracing::error!(id, %error, "failed to migrate API key");
                result.errors.push((id.to_string(), error.to_string()));
            }
        }
    }

    Ok(result)
}

async fn migrate_row(
    pool: &PgPool,
    service: &EnvelopeEncryptionService,
    master_key: &str,
    row: &sqlx::postgres::PgRow,
    id: i32,
) -> anyhow::Result<()> {
    let encrypted_api_key: String = row.get("encrypted_api_key");
    let iv: String = row.get("encryption_iv");
    let auth_tag: String = row.get("encryption_auth_tag");

    let plaintext = decrypt_old_format(&encrypted_api_key, &iv, &auth_tag, master_key)?;
    let envelope = service.encrypt(plaintext.as_bytes()).await?;

    sqlx::query(
        "UPDATE ai_configurations SET \
         encrypted_api_key = $1, encryption_iv = $2, encryption_auth_tag = $3, \
         encryption_version = 2, encrypted_dek = $4, kms_provider = $5, kek_version = $6 \
         WHERE id = $7",
    )
    .bind(&envelope.ciphertext)
    .bind(&envelope.iv)
    .bind(&envelope.auth_tag)
    .bind(&envelope.encrypted_dek)
    .bind(envelope.provider.as_str())
    .bind(&envelope.kek_version)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    let master_key =
        std::env::var("MASTER_ENCRYPTION_KEY").context("MASTER_ENCRYPTION_KEY must be set")?;
    let registry = Arc::new(KmsRegistry::from_configs(config::kms_configs_from_env()?)?);
    let service = EnvelopeEncryptionService::new(config::kms_provider_from_env()?, registry)?;

    add_envelope_columns(&pool).await?;
    bootstrap_audit_table(&pool).await?;

    let result = migrate_api_keys(&pool, &service, &master_key).await?;
    tracing::info!(
        total = result.total_records,
        migrated = result.migrated_records,
        failed = result.failed_records,
        "migration finished"
    );
    for (record_id, error) in &result.errors {
        tracing::error!(record_id, error, "migration error");
    }

    if result.failed_records > 0 {
        std::process::exit(1);
    }
    Ok(())
}
