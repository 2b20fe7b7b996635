use once_cell::sync::Lazy;

use crate::audit::{AuditLogConfig, ChainTipMode, ProofOfWorkPolicy};
use crate::error::{SecurityError, SecurityResult};
use crate::kms::{KmsConfig, KmsProvider};

pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(3005)
});

fn read_optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_required_env(name: &str) -> SecurityResult<String> {
    read_optional_env(name)
        .ok_or_else(|| SecurityError::Config(format!("{name} must be set")))
}

/// Which provider newly created envelopes use. Defaults to the local
/// software backend.
pub fn kms_provider_from_env() -> SecurityResult<KmsProvider> {
    match read_optional_env("KMS_PROVIDER") {
        None => Ok(KmsProvider::Local),
        Some(raw) => KmsProvider::from_str(&raw).ok_or_else(|| {
            SecurityError::Config(format!("unknown KMS_PROVIDER '{raw}'"))
        }),
    }
}

/// Every backend the environment can support gets registered, not just the
/// active one: envelopes written under a previous provider must stay
/// decryptable after a switch.
pub fn kms_configs_from_env() -> SecurityResult<Vec<KmsConfig>> {
    let mut configs = Vec::new();

    if let Some(master_key) = read_optional_env("MASTER_ENCRYPTION_KEY") {
        configs.push(KmsConfig::Local { master_key });
    }

    if let (Some(addr), Some(token)) =
        (read_optional_env("VAULT_ADDR"), read_optional_env("VAULT_TOKEN"))
    {
        configs.push(KmsConfig::Vault {
            addr,
            token,
            mount: read_optional_env("VAULT_TRANSIT_MOUNT")
                .unwrap_or_else(|| "transit".to_string()),
            transit_key: read_optional_env("VAULT_TRANSIT_KEY")
                .unwrap_or_else(|| "envelope-kek".to_string()),
        });
    }

    if configs.is_empty() {
        return Err(SecurityError::Config(
            "no KMS backend configured: set MASTER_ENCRYPTION_KEY or VAULT_ADDR/VAULT_TOKEN".into(),
        ));
    }
    Ok(configs)
}

pub fn audit_config_from_env() -> SecurityResult<AuditLogConfig> {
    let signing_key = read_required_env("AUDIT_SIGNING_KEY")?;

    let enabled = read_optional_env("AUDIT_ENABLE_POW")
        .map(|raw| matches!(raw.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    let difficulty = read_optional_env("AUDIT_POW_DIFFICULTY")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(2);
    let max_iterations = read_optional_env("AUDIT_POW_MAX_ITERATIONS")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(1_000_000);

    let chain_tip_mode = match read_optional_env("AUDIT_CHAIN_TIP_MODE").as_deref() {
        None | Some("single-writer") => ChainTipMode::SingleWriter,
        Some("fenced") => ChainTipMode::FencedAppend,
        Some(other) => {
            return Err(SecurityError::Config(format!(
                "unknown AUDIT_CHAIN_TIP_MODE '{other}' (expected 'single-writer' or 'fenced')"
            )))
        }
    };

    Ok(AuditLogConfig {
        signing_key,
        proof_of_work: ProofOfWorkPolicy {
            enabled,
            difficulty,
            max_iterations,
        },
        chain_tip_mode,
    })
}

/// Approval signatures get their own key when provided, otherwise they share
/// the audit signing key.
pub fn mpa_signing_key_from_env() -> SecurityResult<String> {
    match read_optional_env("MPA_SIGNING_KEY") {
        Some(key) => Ok(key),
        None => read_required_env("AUDIT_SIGNING_KEY"),
    }
}
