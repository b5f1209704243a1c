//! Client API keys and the warehouse credential
//!
//! Issued keys have the form `sk_<id>_<secret>` where `id` is 12 hex
//! characters and `secret` is 32 random alphanumerics. Only the SHA-256 of the
//! full key is kept; the raw key is handed out once at issue time.
//! Bootstrap keys supplied through the environment may have any shape; their
//! id is derived from their digest.
//!
//! Digest comparisons (client keys and the admin secret) are constant-time.
//!
//! ## Configuration
//!
//! - `DATAPRODUCT_API_KEYS` (alias `API_KEY`): comma-separated bootstrap keys
//! - `DATAPRODUCT_ADMIN_SECRET` (alias `ADMIN_SECRET`): admin shared secret;
//!   when unset the admin operations answer 503
//! - `DATAPRODUCT_KEY_FILE`: JSON file persisting key records (hashes only)

use chrono::{DateTime, Utc};
use dataproduct_gateway_core::env::{env_first, env_string};
use dataproduct_gateway_core::{ApiKeyRecord, GatewayError, Result};
use dataproduct_gateway_warehouse::{CredentialProvider, WarehouseCredential};
use parking_lot::RwLock;
use rand::{distributions::Alphanumeric, Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const KEY_PREFIX: &str = "sk_";

/// Hex characters in a key id
const KEY_ID_LEN: usize = 12;

/// Random alphanumerics in the secret part of an issued key
const SECRET_LEN: usize = 32;

/// Longest presented key considered at all
const MAX_PRESENTED_KEY_LEN: usize = 256;

const INVALID_KEY_MESSAGE: &str = "Invalid API Key provided. Please check your credentials.";

#[derive(Clone, Default)]
pub struct KeyStoreConfig {
    pub bootstrap_keys: Vec<String>,
    pub admin_secret: Option<String>,
    pub key_file: Option<PathBuf>,
}

impl std::fmt::Debug for KeyStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStoreConfig")
            .field("bootstrap_keys", &self.bootstrap_keys.len())
            .field("admin_secret", &self.admin_secret.as_ref().map(|_| "<redacted>"))
            .field("key_file", &self.key_file)
            .finish()
    }
}

impl KeyStoreConfig {
    pub fn from_env() -> Self {
        let bootstrap_keys = env_first(&["DATAPRODUCT_API_KEYS", "API_KEY"])
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bootstrap_keys,
            admin_secret: env_first(&["DATAPRODUCT_ADMIN_SECRET", "ADMIN_SECRET"]),
            key_file: env_string("DATAPRODUCT_KEY_FILE").map(PathBuf::from),
        }
    }

    pub fn with_bootstrap_key(mut self, key: impl Into<String>) -> Self {
        self.bootstrap_keys.push(key.into());
        self
    }

    pub fn with_admin_secret(mut self, secret: impl Into<String>) -> Self {
        self.admin_secret = Some(secret.into());
        self
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }
}

/// A freshly issued key. `raw_key` is never retrievable again.
#[derive(Clone)]
pub struct IssuedKey {
    pub record: ApiKeyRecord,
    pub raw_key: String,
}

impl std::fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedKey")
            .field("record", &self.record)
            .field("raw_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    keys: Vec<StoredKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    id: String,
    secret_hash: String,
    created_at: DateTime<Utc>,
    revoked: bool,
}

impl StoredKey {
    fn from_record(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id.clone(),
            secret_hash: hex::encode(record.secret_hash),
            created_at: record.created_at,
            revoked: record.revoked,
        }
    }

    fn into_record(self) -> Option<ApiKeyRecord> {
        let secret_hash: [u8; 32] = hex::decode(&self.secret_hash).ok()?.try_into().ok()?;
        Some(ApiKeyRecord {
            id: self.id,
            secret_hash,
            created_at: self.created_at,
            revoked: self.revoked,
        })
    }
}

/// Owns client key records, the admin secret and the warehouse credential.
pub struct KeyStore {
    records: RwLock<HashMap<String, ApiKeyRecord>>,
    admin_secret_hash: Option<[u8; 32]>,
    key_file: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
    credentials: Arc<dyn CredentialProvider>,
}

impl KeyStore {
    /// Build the store, loading the key file (if any) and hashing bootstrap keys.
    pub fn new(config: KeyStoreConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        let mut records = HashMap::new();

        if let Some(path) = &config.key_file {
            match load_key_file(path) {
                Ok(loaded) => {
                    info!(path = %path.display(), keys = loaded.len(), "Loaded API keys");
                    records.extend(loaded.into_iter().map(|r| (r.id.clone(), r)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Key file not present yet");
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to load API keys");
                }
            }
        }

        for raw in &config.bootstrap_keys {
            let id = key_id_for(raw);
            // A record loaded from disk keeps its revocation state.
            records.entry(id.clone()).or_insert_with(|| ApiKeyRecord {
                id,
                secret_hash: hash_secret(raw),
                created_at: Utc::now(),
                revoked: false,
            });
        }

        if records.is_empty() {
            warn!("No API keys configured; every data request will be rejected");
        }
        if config.admin_secret.is_none() {
            warn!("Admin secret not configured; key issuance is disabled");
        }

        Self {
            records: RwLock::new(records),
            admin_secret_hash: config.admin_secret.as_deref().map(hash_secret),
            key_file: config.key_file,
            persist_lock: tokio::sync::Mutex::new(()),
            credentials,
        }
    }

    /// Validate a presented client key.
    pub fn authenticate_client(&self, presented: Option<&str>) -> Result<ApiKeyRecord> {
        let presented = presented.map(str::trim).unwrap_or_default();
        if presented.is_empty() {
            return Err(GatewayError::Unauthorized(
                "Missing API Key. Provide it in the X-API-KEY header.".to_string(),
            ));
        }
        if presented.len() > MAX_PRESENTED_KEY_LEN
            || presented.chars().any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(GatewayError::Unauthorized(INVALID_KEY_MESSAGE.to_string()));
        }

        let digest = hash_secret(presented);
        let id = key_id_for(presented);
        let record = self.records.read().get(&id).cloned();

        match record {
            Some(record) if constant_time_eq(&digest, &record.secret_hash) && !record.revoked => {
                Ok(record)
            }
            Some(record) => {
                debug!(key_id = %mask_key_id(&record.id), revoked = record.revoked, "API key rejected");
                Err(GatewayError::Unauthorized(INVALID_KEY_MESSAGE.to_string()))
            }
            None => Err(GatewayError::Unauthorized(INVALID_KEY_MESSAGE.to_string())),
        }
    }

    fn verify_admin(&self, presented: Option<&str>) -> Result<()> {
        let Some(expected) = &self.admin_secret_hash else {
            warn!("Admin operation attempted but admin secret is not configured");
            return Err(GatewayError::Unavailable(
                "Admin access not configured".to_string(),
            ));
        };
        let presented = presented.unwrap_or_default();
        if !constant_time_eq(&hash_secret(presented), expected) {
            warn!("Admin operation attempted with invalid secret");
            return Err(GatewayError::Forbidden("Invalid Admin Secret".to_string()));
        }
        Ok(())
    }

    /// Issue a new client key. The raw key is returned exactly once.
    pub async fn issue_key(&self, admin_secret: Option<&str>) -> Result<IssuedKey> {
        self.verify_admin(admin_secret)?;

        let issued = {
            let mut records = self.records.write();
            let (id, raw_key) = loop {
                let (id, raw_key) = generate_key();
                if !records.contains_key(&id) {
                    break (id, raw_key);
                }
            };
            let record = ApiKeyRecord {
                id: id.clone(),
                secret_hash: hash_secret(&raw_key),
                created_at: Utc::now(),
                revoked: false,
            };
            records.insert(id, record.clone());
            IssuedKey { record, raw_key }
        };

        info!(key_id = %mask_key_id(&issued.record.id), "Issued API key");
        self.persist().await;
        Ok(issued)
    }

    /// Revoke a key by id. The record is retained.
    pub async fn revoke_key(&self, admin_secret: Option<&str>, key_id: &str) -> Result<ApiKeyRecord> {
        self.verify_admin(admin_secret)?;

        let record = {
            let mut records = self.records.write();
            let record = records
                .get_mut(key_id)
                .ok_or_else(|| GatewayError::NotFound(format!("API key '{}' not found", mask_key_id(key_id))))?;
            record.revoked = true;
            record.clone()
        };

        info!(key_id = %mask_key_id(key_id), "Revoked API key");
        self.persist().await;
        Ok(record)
    }

    pub fn is_admin_configured(&self) -> bool {
        self.admin_secret_hash.is_some()
    }

    /// Live warehouse credential, refreshed transparently by the provider.
    pub fn current_warehouse_credential(&self) -> Result<WarehouseCredential> {
        self.credentials.current().map_err(|e| {
            error!(error = %e, "Warehouse credential unavailable");
            GatewayError::Unavailable("Warehouse credential unavailable".to_string())
        })
    }

    pub fn invalidate_warehouse_credential(&self) {
        warn!("Invalidating cached warehouse credential");
        self.credentials.invalidate();
    }

    /// Rewrite the key file. Failures are logged only.
    async fn persist(&self) {
        let Some(path) = &self.key_file else {
            return;
        };
        let _guard = self.persist_lock.lock().await;

        let snapshot = {
            let records = self.records.read();
            let mut keys: Vec<StoredKey> = records.values().map(StoredKey::from_record).collect();
            keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            KeyFile { keys }
        };

        let body = match serde_json::to_vec_pretty(&snapshot) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to serialize API keys");
                return;
            }
        };

        let tmp = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, &body).await {
            error!(path = %tmp.display(), error = %e, "Failed to write API keys");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            error!(path = %path.display(), error = %e, "Failed to replace API key file");
        }
    }
}

fn load_key_file(path: &Path) -> std::io::Result<Vec<ApiKeyRecord>> {
    let content = std::fs::read_to_string(path)?;
    let file: KeyFile = serde_json::from_str(&content)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    Ok(file
        .keys
        .into_iter()
        .filter_map(|stored| {
            let id = stored.id.clone();
            let record = stored.into_record();
            if record.is_none() {
                warn!(key_id = %mask_key_id(&id), "Skipping key record with malformed hash");
            }
            record
        })
        .collect())
}

fn hash_secret(raw: &str) -> [u8; 32] {
    Sha256::digest(raw.as_bytes()).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Id of a presented key: parsed from issued keys, digest-derived otherwise.
fn key_id_for(raw: &str) -> String {
    if let Some((id, secret)) = raw
        .strip_prefix(KEY_PREFIX)
        .and_then(|rest| rest.split_once('_'))
    {
        if id.len() == KEY_ID_LEN
            && id.chars().all(|c| c.is_ascii_hexdigit())
            && secret.len() == SECRET_LEN
            && secret.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return id.to_ascii_lowercase();
        }
    }
    hex::encode(&hash_secret(raw)[..KEY_ID_LEN / 2])
}

fn generate_key() -> (String, String) {
    let mut rng = rand::thread_rng();
    let mut id_bytes = [0u8; KEY_ID_LEN / 2];
    rng.fill_bytes(&mut id_bytes);
    let id = hex::encode(id_bytes);
    let secret: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect();
    let raw_key = format!("{}{}_{}", KEY_PREFIX, id, secret);
    (id, raw_key)
}

/// Partially redacted key id, safe to log.
pub fn mask_key_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
