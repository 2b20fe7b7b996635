use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, QueryBuilder};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{SecurityError, SecurityResult};

/// Sentinel `previousHash` for the first entry of a chain.
pub const GENESIS: &str = "GENESIS";

const FENCED_APPEND_ATTEMPTS: u32 = 5;
const PG_UNIQUE_VIOLATION: &str = "23505";

/// key: audit-entry
/// One link of the tamper-evident chain. `hash` is a digest over every other
/// field, `previousHash` points at the prior entry's hash, and `signature`
/// is a keyed MAC over `hash` proving the entry came from a signing-key
/// holder independent of storage integrity. Never mutated after insert.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub user_id: Option<i32>,
    pub organization_id: Option<i32>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub metadata: Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub previous_hash: String,
    pub hash: String,
    pub signature: String,
    pub nonce: i64,
}

/// Caller-facing fields of a new audit record; the chain fields are filled
/// in by the logger.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub action: String,
    pub user_id: Option<i32>,
    pub organization_id: Option<i32>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub metadata: Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            user_id: None,
            organization_id: None,
            resource_type: resource_type.into(),
            resource_id: None,
            metadata: json!({}),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// key: audit-event-sink
/// Seam through which the HSM and MPA services record security events. The
/// crypto result is computed first; a sink failure then surfaces to the
/// caller instead of being swallowed, so an unrecorded action is never
/// reported as complete.
#[async_trait]
pub trait SecurityEventSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> SecurityResult<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct ProofOfWorkPolicy {
    pub enabled: bool,
    /// Number of leading zero hex characters required of the entry hash.
    pub difficulty: usize,
    /// Upper bound on nonce trials. Exceeding it is accepted best-effort
    /// (availability over strict difficulty) and logged loudly.
    pub max_iterations: u64,
}

impl Default for ProofOfWorkPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            difficulty: 2,
            max_iterations: 1_000_000,
        }
    }
}

/// key: audit-chain-tip
/// How the append path learns the current chain tip. `SingleWriter` keeps an
/// in-process cache behind a mutex and is only safe when exactly one process
/// appends; `FencedAppend` re-reads the tip per append and relies on the
/// unique index on `previous_hash` to reject concurrent forks, retrying on
/// conflict. The deployment must pick one explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainTipMode {
    SingleWriter,
    FencedAppend,
}

#[derive(Clone, Debug)]
pub struct AuditLogConfig {
    pub signing_key: String,
    pub proof_of_work: ProofOfWorkPolicy,
    pub chain_tip_mode: ChainTipMode,
}

/// Structured verification outcome. Integrity findings are returned, never
/// thrown: a verifier needs to localize tampering, not merely detect it.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub valid: bool,
    pub entries_verified: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at_entry: Option<Uuid>,
}

impl ChainVerification {
    fn ok(entries_verified: usize) -> Self {
        Self {
            valid: true,
            entries_verified,
            error: None,
            broken_at_entry: None,
        }
    }

    fn broken(entries_verified: usize, entry: Uuid, error: String) -> Self {
        Self {
            valid: false,
            entries_verified,
            error: Some(error),
            broken_at_entry: Some(entry),
        }
    }
}

/// key: audit-trail-filter
/// Filter envelope for trail queries, bound straight from query strings.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrailFilter {
    pub user_id: Option<i32>,
    pub organization_id: Option<i32>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub action: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditTrailPage {
    pub entries: Vec<AuditEntry>,
    pub total: i64,
}

/// key: audit-logger
/// Append-only, hash-chained audit log persisted in Postgres. The table is
/// created lazily on first write so the logger can be pointed at a fresh
/// database.
pub struct TamperProofAuditLogger {
    pool: PgPool,
    signing_key: [u8; 32],
    pow: ProofOfWorkPolicy,
    chain_tip_mode: ChainTipMode,
    last_hash: Mutex<Option<String>>,
    bootstrapped: AtomicBool,
}

/// Canonical fields of an entry before hashing/signing.
#[derive(Clone, Debug)]
struct EntryDraft {
    id: Uuid,
    timestamp: DateTime<Utc>,
    event: AuditEvent,
    previous_hash: String,
    nonce: i64,
}

impl EntryDraft {
    fn new(event: AuditEvent, previous_hash: String) -> Self {
        // Truncate to microseconds so the hashed timestamp survives the
        // round trip through TIMESTAMPTZ exactly.
        let now = Utc::now();
        let timestamp = now
            .with_nanosecond(now.nanosecond() / 1_000 * 1_000)
            .unwrap_or(now);
        Self {
            id: Uuid::new_v4(),
            timestamp,
            event,
            previous_hash,
            nonce: 0,
        }
    }
}

fn canonical_json(
    id: Uuid,
    timestamp: &DateTime<Utc>,
    event: &AuditEvent,
    previous_hash: &str,
    nonce: i64,
) -> String {
    // serde_json object keys are sorted, which is the canonical form here.
    json!({
        "id": id,
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        "action": event.action,
        "userId": event.user_id,
        "organizationId": event.organization_id,
        "resourceType": event.resource_type,
        "resourceId": event.resource_id,
        "metadata": event.metadata,
        "ipAddress": event.ip_address,
        "userAgent": event.user_agent,
        "previousHash": previous_hash,
        "nonce": nonce,
    })
    .to_string()
}

fn compute_hash(draft: &EntryDraft) -> String {
    let data = canonical_json(
        draft.id,
        &draft.timestamp,
        &draft.event,
        &draft.previous_hash,
        draft.nonce,
    );
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn recompute_hash(entry: &AuditEntry) -> String {
    let event = AuditEvent {
        action: entry.action.clone(),
        user_id: entry.user_id,
        organization_id: entry.organization_id,
        resource_type: entry.resource_type.clone(),
        resource_id: entry.resource_id.clone(),
        metadata: entry.metadata.clone(),
        ip_address: entry.ip_address.clone(),
        user_agent: entry.user_agent.clone(),
    };
    let data = canonical_json(
        entry.id,
        &entry.timestamp,
        &event,
        &entry.previous_hash,
        entry.nonce,
    );
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn sign_hash(signing_key: &[u8; 32], hash: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(signing_key)
        .expect("HMAC accepts any key length");
    mac.update(hash.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Find a nonce whose hash satisfies the difficulty target, bounded by
/// `max_iterations`. Returns the final hash; on bound exhaustion the last
/// hash is accepted and a warning emitted.
fn mine(draft: &mut EntryDraft, pow: &ProofOfWorkPolicy) -> String {
    let mut hash = compute_hash(draft);
    if !pow.enabled {
        return hash;
    }
    let target = "0".repeat(pow.difficulty);
    let mut iterations = 0u64;
    while !hash.starts_with(&target) {
        if iterations >= pow.max_iterations {
            tracing::warn!(
                entry_id = %draft.id,
                difficulty = pow.difficulty,
                max_iterations = pow.max_iterations,
                "proof-of-work bound exhausted; accepting best-effort hash"
            );
            break;
        }
        draft.nonce += 1;
        iterations += 1;
        hash = compute_hash(draft);
    }
    hash
}

fn merkle_root_of_hashes(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return hex::encode(Sha256::digest(b"EMPTY"));
    }
    let mut level: Vec<String> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            let combined = format!("{left}{right}");
            next.push(hex::encode(Sha256::digest(combined.as_bytes())));
        }
        level = next;
    }
    level.remove(0)
}

impl TamperProofAuditLogger {
    pub fn new(pool: PgPool, config: AuditLogConfig) -> Self {
        let digest = Sha256::digest(config.signing_key.as_bytes());
        let mut signing_key = [0u8; 32];
        signing_key.copy_from_slice(&digest);
        Self {
            pool,
            signing_key,
            pow: config.proof_of_work,
            chain_tip_mode: config.chain_tip_mode,
            last_hash: Mutex::new(None),
            bootstrapped: AtomicBool::new(false),
        }
    }

    /// Append one entry to the chain. Which tip strategy runs is fixed at
    /// construction; see [`ChainTipMode`].
    pub async fn log(&self, event: AuditEvent) -> SecurityResult<AuditEntry> {
        self.ensure_table().await?;
        match self.chain_tip_mode {
            ChainTipMode::SingleWriter => self.append_single_writer(event).await,
            ChainTipMode::FencedAppend => self.append_fenced(event).await,
        }
    }

    async fn append_single_writer(&self, event: AuditEvent) -> SecurityResult<AuditEntry> {
        // Holding the tip lock across read-tip + insert serializes appends
        // within this process; that is the whole safety argument of this
        // mode.
        let mut tip = self.last_hash.lock().await;
        let previous_hash = match tip.as_ref() {
            Some(hash) => hash.clone(),
            None => self.read_tip().await?,
        };
        let entry = self.seal(event, previous_hash);
        self.insert_entry(&entry).await?;
        *tip = Some(entry.hash.clone());
        Ok(entry)
    }

    async fn append_fenced(&self, event: AuditEvent) -> SecurityResult<AuditEntry> {
        for attempt in 1..=FENCED_APPEND_ATTEMPTS {
            let previous_hash = self.read_tip().await?;
            let entry = self.seal(event.clone(), previous_hash);
            match self.insert_entry(&entry).await {
                Ok(()) => return Ok(entry),
                Err(SecurityError::Db(sqlx::Error::Database(db)))
                    if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION) =>
                {
                    // Another writer extended the chain between our tip read
                    // and insert; rebuild against the new tip.
                    tracing::debug!(attempt, "audit append lost tip race, retrying");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
        Err(SecurityError::Message(
            "audit append contention: exhausted fenced retry attempts".into(),
        ))
    }

    fn seal(&self, event: AuditEvent, previous_hash: String) -> AuditEntry {
        let mut draft = EntryDraft::new(event, previous_hash);
        let hash = mine(&mut draft, &self.pow);
        let signature = sign_hash(&self.signing_key, &hash);
        AuditEntry {
            id: draft.id,
            timestamp: draft.timestamp,
            action: draft.event.action,
            user_id: draft.event.user_id,
            organization_id: draft.event.organization_id,
            resource_type: draft.event.resource_type,
            resource_id: draft.event.resource_id,
            metadata: draft.event.metadata,
            ip_address: draft.event.ip_address,
            user_agent: draft.event.user_agent,
            previous_hash: draft.previous_hash,
            hash,
            signature,
            nonce: draft.nonce,
        }
    }

    async fn read_tip(&self) -> SecurityResult<String> {
        let tip: Option<String> = sqlx::query_scalar(
            "SELECT hash FROM tamper_proof_audit_logs ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(tip.unwrap_or_else(|| GENESIS.to_string()))
    }

    async fn insert_entry(&self, entry: &AuditEntry) -> SecurityResult<()> {
        sqlx::query(
            "INSERT INTO tamper_proof_audit_logs \
             (id, timestamp, action, user_id, organization_id, resource_type, resource_id, \
              metadata, ip_address, user_agent, previous_hash, hash, signature, nonce) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
        )
        .bind(entry.id)
        .bind(entry.timestamp)
        .bind(&entry.action)
        .bind(entry.user_id)
        .bind(entry.organization_id)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.metadata)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(&entry.previous_hash)
        .bind(&entry.hash)
        .bind(&entry.signature)
        .bind(entry.nonce)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_table(&self) -> SecurityResult<()> {
        if self.bootstrapped.load(Ordering::Acquire) {
            return Ok(());
        }
        bootstrap_audit_table(&self.pool).await?;
        self.bootstrapped.store(true, Ordering::Release);
        Ok(())
    }

    /// Walk a window of the chain in append order and recheck every
    /// invariant: content hash, signature, linkage, and (when enabled) the
    /// proof-of-work property.
    pub async fn verify_chain(
        &self,
        start_from: Option<Uuid>,
        limit: i64,
    ) -> SecurityResult<ChainVerification> {
        self.ensure_table().await?;
        let entries = self.chain_window(start_from, limit).await?;
        if entries.is_empty() {
            return Ok(ChainVerification::ok(0));
        }

        let target = "0".repeat(self.pow.difficulty);
        for (i, entry) in entries.iter().enumerate() {
            if recompute_hash(entry) != entry.hash {
                return Ok(ChainVerification::broken(
                    i,
                    entry.id,
                    format!("hash mismatch at entry {}", entry.id),
                ));
            }
            if sign_hash(&self.signing_key, &entry.hash) != entry.signature {
                return Ok(ChainVerification::broken(
                    i,
                    entry.id,
                    format!("invalid signature at entry {}", entry.id),
                ));
            }
            if i > 0 && entry.previous_hash != entries[i - 1].hash {
                return Ok(ChainVerification::broken(
                    i,
                    entry.id,
                    format!("chain broken at entry {}", entry.id),
                ));
            }
            if self.pow.enabled && !entry.hash.starts_with(&target) {
                return Ok(ChainVerification::broken(
                    i,
                    entry.id,
                    format!("invalid proof-of-work at entry {}", entry.id),
                ));
            }
        }

        Ok(ChainVerification::ok(entries.len()))
    }

    async fn chain_window(
        &self,
        start_from: Option<Uuid>,
        limit: i64,
    ) -> SecurityResult<Vec<AuditEntry>> {
        let rows = if let Some(start) = start_from {
            sqlx::query_as::<_, AuditEntryRow>(
                "SELECT id, timestamp, action, user_id, organization_id, resource_type, \
                 resource_id, metadata, ip_address, user_agent, previous_hash, hash, signature, nonce \
                 FROM tamper_proof_audit_logs \
                 WHERE seq >= (SELECT seq FROM tamper_proof_audit_logs WHERE id = $1) \
                 ORDER BY seq ASC LIMIT $2",
            )
            .bind(start)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, AuditEntryRow>(
                "SELECT id, timestamp, action, user_id, organization_id, resource_type, \
                 resource_id, metadata, ip_address, user_agent, previous_hash, hash, signature, nonce \
                 FROM tamper_proof_audit_logs ORDER BY seq ASC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows.into_iter().map(AuditEntry::from).collect())
    }

    pub async fn get_audit_trail(
        &self,
        filter: AuditTrailFilter,
    ) -> SecurityResult<AuditTrailPage> {
        self.ensure_table().await?;

        let mut count_builder =
            QueryBuilder::new("SELECT COUNT(*) FROM tamper_proof_audit_logs WHERE 1=1");
        push_trail_filters(&mut count_builder, &filter);
        let (total,): (i64,) = count_builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await?;

        let mut builder = QueryBuilder::new(
            "SELECT id, timestamp, action, user_id, organization_id, resource_type, resource_id, \
             metadata, ip_address, user_agent, previous_hash, hash, signature, nonce \
             FROM tamper_proof_audit_logs WHERE 1=1",
        );
        push_trail_filters(&mut builder, &filter);
        builder.push(" ORDER BY timestamp DESC");
        builder.push(" LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(100));
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset.unwrap_or(0));

        let rows = builder
            .build_query_as::<AuditEntryRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(AuditTrailPage {
            entries: rows.into_iter().map(AuditEntry::from).collect(),
            total,
        })
    }

    /// Pairwise-hash the entry hashes bottom-up into a single root, used for
    /// compact batch attestations. The last node is duplicated on odd
    /// levels. An empty batch yields the fixed digest of "EMPTY".
    pub fn generate_merkle_root(&self, entries: &[AuditEntry]) -> String {
        let hashes: Vec<String> = entries.iter().map(|e| e.hash.clone()).collect();
        merkle_root_of_hashes(&hashes)
    }
}

#[async_trait]
impl SecurityEventSink for TamperProofAuditLogger {
    async fn record(&self, event: AuditEvent) -> SecurityResult<()> {
        self.log(event).await.map(|_| ())
    }
}

fn push_trail_filters(builder: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &AuditTrailFilter) {
    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ");
        builder.push_bind(user_id);
    }
    if let Some(organization_id) = filter.organization_id {
        builder.push(" AND organization_id = ");
        builder.push_bind(organization_id);
    }
    if let Some(resource_type) = &filter.resource_type {
        builder.push(" AND resource_type = ");
        builder.push_bind(resource_type.clone());
    }
    if let Some(resource_id) = &filter.resource_id {
        builder.push(" AND resource_id = ");
        builder.push_bind(resource_id.clone());
    }
    if let Some(action) = &filter.action {
        builder.push(" AND action = ");
        builder.push_bind(action.clone());
    }
    if let Some(start) = filter.start {
        builder.push(" AND timestamp >= ");
        builder.push_bind(start);
    }
    if let Some(end) = filter.end {
        builder.push(" AND timestamp <= ");
        builder.push_bind(end);
    }
}

/// Create the append-only audit table and its indexes if absent. `seq` is
/// the append order used for chain walks; the unique index on
/// `previous_hash` is the fence that rejects concurrent forks.
pub async fn bootstrap_audit_table(pool: &PgPool) -> SecurityResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tamper_proof_audit_logs (
            id UUID PRIMARY KEY,
            seq BIGSERIAL,
            timestamp TIMESTAMPTZ NOT NULL,
            action VARCHAR(255) NOT NULL,
            user_id INTEGER,
            organization_id INTEGER,
            resource_type VARCHAR(255) NOT NULL,
            resource_id VARCHAR(255),
            metadata JSONB NOT NULL DEFAULT '{}',
            ip_address VARCHAR(45),
            user_agent TEXT,
            previous_hash VARCHAR(64) NOT NULL,
            hash VARCHAR(64) NOT NULL,
            signature VARCHAR(64) NOT NULL,
            nonce BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_previous_hash \
         ON tamper_proof_audit_logs(previous_hash)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_hash ON tamper_proof_audit_logs(hash)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON tamper_proof_audit_logs(timestamp)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_user ON tamper_proof_audit_logs(user_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_org ON tamper_proof_audit_logs(organization_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct AuditEntryRow {
    id: Uuid,
    timestamp: DateTime<Utc>,
    action: String,
    user_id: Option<i32>,
    organization_id: Option<i32>,
    resource_type: String,
    resource_id: Option<String>,
    metadata: Value,
    ip_address: Option<String>,
    user_agent: Option<String>,
    previous_hash: String,
    hash: String,
    signature: String,
    nonce: i64,
}

impl From<AuditEntryRow> for AuditEntry {
    fn from(row: AuditEntryRow) -> Self {
        AuditEntry {
            id: row.id,
            timestamp: row.timestamp,
            action: row.action,
            user_id: row.user_id,
            organization_id: row.organization_id,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            metadata: row.metadata,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            previous_hash: row.previous_hash,
            hash: row.hash,
            signature: row.signature,
            nonce: row.nonce,
        }
    }
}
