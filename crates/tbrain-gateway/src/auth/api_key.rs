//! In-memory API key store.
//!
//! Keys are issued as `<prefix><32 random bytes, base64url>`; only a SHA-256
//! digest of the plaintext is kept, and records are keyed by that digest so
//! validation is a single map lookup. The plaintext is returned to the caller
//! exactly once at generation time.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{GatewayError, GatewayResult};

/// Permission wildcard matching every permission check.
pub const PERMISSION_ALL: &str = "*";

/// A stored API key. The secret digest lives in the store's map key, so
/// listing records never exposes it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    pub permissions: HashSet<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// True if the record grants `permission`, either exactly or via `"*"`.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(PERMISSION_ALL) || self.permissions.contains(permission)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory API key store keyed by secret digest.
pub struct ApiKeyStore {
    prefix: String,
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
}

impl ApiKeyStore {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), keys: RwLock::new(HashMap::new()) }
    }

    /// Load keys declared as configuration lines `name:secret:perm1,perm2,...`.
    ///
    /// The plaintext presented by callers is `<prefix><secret>`. The key named
    /// by `primary` is granted the `"*"` permission regardless of its declared
    /// list.
    pub async fn bootstrap(&self, lines: &[String], primary: Option<&str>) -> GatewayResult<()> {
        for line in lines {
            let mut parts = line.splitn(3, ':');
            let (Some(name), Some(secret)) = (parts.next(), parts.next()) else {
                return Err(GatewayError::invalid_request(format!(
                    "malformed API key declaration: {line:?}"
                )));
            };
            if name.is_empty() || secret.is_empty() {
                return Err(GatewayError::invalid_request(format!(
                    "malformed API key declaration: {line:?}"
                )));
            }

            let mut permissions: HashSet<String> = parts
                .next()
                .unwrap_or_default()
                .split(',')
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect();
            if primary == Some(name) {
                permissions.insert(PERMISSION_ALL.to_owned());
            }

            let plaintext = format!("{}{}", self.prefix, secret);
            let record = ApiKeyRecord {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_owned(),
                permissions,
                created_at: Utc::now(),
                last_used_at: None,
                expires_at: None,
            };

            self.keys.write().await.insert(digest(&plaintext), record);
            tracing::info!(name = %name, "Bootstrapped API key");
        }
        Ok(())
    }

    /// Generate a new key. Returns the plaintext (shown exactly once) and the
    /// stored record.
    pub async fn generate(
        &self,
        name: impl Into<String>,
        permissions: HashSet<String>,
        expires_in: Option<Duration>,
    ) -> (String, ApiKeyRecord) {
        let now = Utc::now();
        let plaintext =
            format!("{}{}", self.prefix, URL_SAFE_NO_PAD.encode(super::random_bytes()));

        let record = ApiKeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            permissions,
            created_at: now,
            last_used_at: None,
            expires_at: expires_in
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| now + ttl),
        };

        self.keys.write().await.insert(digest(&plaintext), record.clone());
        tracing::info!(id = %record.id, name = %record.name, "Generated API key");

        (plaintext, record)
    }

    /// Validate a plaintext key. Returns the record and stamps `lastUsedAt`.
    ///
    /// Keys without the expected prefix are rejected before any digest work.
    pub async fn validate(&self, plaintext: &str) -> Option<ApiKeyRecord> {
        if !plaintext.starts_with(&self.prefix) {
            return None;
        }

        let now = Utc::now();
        let mut keys = self.keys.write().await;
        let record = keys.get_mut(&digest(plaintext))?;
        if record.is_expired(now) {
            return None;
        }

        record.last_used_at = Some(now);
        Some(record.clone())
    }

    /// Remove a key by record id. Returns whether it existed.
    pub async fn revoke(&self, id: &str) -> bool {
        let mut keys = self.keys.write().await;
        let before = keys.len();
        keys.retain(|_, record| record.id != id);
        before != keys.len()
    }

    /// Look up a record by id.
    pub async fn get(&self, id: &str) -> Option<ApiKeyRecord> {
        let keys = self.keys.read().await;
        keys.values().find(|record| record.id == id).cloned()
    }

    /// All records, sorted by creation time. Secret digests are never part of
    /// the record, so nothing needs redacting.
    pub async fn list(&self) -> Vec<ApiKeyRecord> {
        let keys = self.keys.read().await;
        let mut records: Vec<ApiKeyRecord> = keys.values().cloned().collect();
        records.sort_by_key(|record| record.created_at);
        records
    }
}

impl std::fmt::Debug for ApiKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyStore").field("prefix", &self.prefix).finish()
    }
}

/// Hex SHA-256 digest of the plaintext key.
///
/// The map lookup by digest is not constant-time; acceptable for a
/// high-entropy 256-bit keyspace, though a constant-time comparison would be
/// a hardening improvement.
fn digest(plaintext: &str) -> String {
    use std::fmt::Write as _;

    let hash = Sha256::digest(plaintext.as_bytes());
    let mut out = String::with_capacity(hash.len() * 2);
    for byte in hash {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
