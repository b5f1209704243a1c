//! Signed warehouse credentials
//!
//! The gateway authenticates to the warehouse with a short-lived RS256 JWT
//! derived from a long-lived key pair. The token is reused until it is within
//! the refresh margin of expiry and can be discarded early when the warehouse
//! rejects it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dataproduct_gateway_core::env::env_string;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Token lifetime; the warehouse rejects tokens valid for more than an hour.
pub const TOKEN_LIFETIME_MINUTES: i64 = 59;

/// A cached token is replaced once it is this close to expiry.
pub const REFRESH_MARGIN_MINUTES: i64 = 5;

/// How far the clock may move backwards before signing is refused.
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 60;

pub const DEFAULT_PRIVATE_KEY_PATH: &str = "rsa_key.p8";
pub const DEFAULT_PUBLIC_KEY_PATH: &str = "rsa_key.pub";

/// A bearer token accepted by the warehouse.
#[derive(Clone, PartialEq, Eq)]
pub struct WarehouseCredential {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WarehouseCredential {
    /// Whether the credential is still good for at least `margin`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now < self.expires_at - margin
    }
}

impl std::fmt::Debug for WarehouseCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseCredential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("Private key unreadable: {0}")]
    KeyUnreadable(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Token signing failed: {0}")]
    Signing(String),

    #[error("System clock moved backwards by {0}s")]
    ClockSkew(i64),
}

/// Source of warehouse credentials.
pub trait CredentialProvider: Send + Sync {
    /// Return a credential valid for at least the refresh margin.
    fn current(&self) -> Result<WarehouseCredential, CredentialError>;

    /// Discard any cached credential so the next `current` re-signs.
    fn invalidate(&self);
}

/// Key-pair settings for the warehouse service user.
///
/// # Environment Variables
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `SNOWFLAKE_ACCOUNT` | (required) | Account identifier |
/// | `SNOWFLAKE_USER` | (required) | Service user |
/// | `SNOWFLAKE_PRIVATE_KEY_CONTENT` | - | PKCS#8 PEM, takes precedence over the path |
/// | `SNOWFLAKE_PRIVATE_KEY_PATH` | `rsa_key.p8` | PKCS#8 PEM file |
/// | `SNOWFLAKE_PUBLIC_KEY_FP` | - | `SHA256:<base64>` fingerprint, takes precedence over the path |
/// | `SNOWFLAKE_PUBLIC_KEY_PATH` | `rsa_key.pub` | SubjectPublicKeyInfo PEM file |
#[derive(Clone)]
pub struct KeypairConfig {
    pub account: String,
    pub user: String,
    pub private_key_pem: String,
    /// Base64 SHA-256 of the DER public key, without the `SHA256:` prefix
    pub public_key_fingerprint: String,
}

impl std::fmt::Debug for KeypairConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeypairConfig")
            .field("account", &self.account)
            .field("user", &self.user)
            .field("private_key_pem", &"<redacted>")
            .field("public_key_fingerprint", &self.public_key_fingerprint)
            .finish()
    }
}

impl KeypairConfig {
    pub fn new(
        account: impl Into<String>,
        user: impl Into<String>,
        private_key_pem: impl Into<String>,
        public_key_fingerprint: impl AsRef<str>,
    ) -> Self {
        Self {
            account: account.into(),
            user: user.into(),
            private_key_pem: private_key_pem.into(),
            public_key_fingerprint: strip_fingerprint_prefix(public_key_fingerprint.as_ref()),
        }
    }

    /// Build from a private key and the matching public key PEM.
    pub fn from_public_key_pem(
        account: impl Into<String>,
        user: impl Into<String>,
        private_key_pem: impl Into<String>,
        public_key_pem: &str,
    ) -> Result<Self, CredentialError> {
        let fingerprint = public_key_fingerprint(public_key_pem)?;
        Ok(Self::new(account, user, private_key_pem, fingerprint))
    }

    /// Load key material from environment variables and key files.
    pub fn from_env() -> Result<Self, CredentialError> {
        let account = env_string("SNOWFLAKE_ACCOUNT").unwrap_or_default();
        let user = env_string("SNOWFLAKE_USER").unwrap_or_default();

        let private_key_pem = match env_string("SNOWFLAKE_PRIVATE_KEY_CONTENT") {
            Some(content) => content,
            None => {
                let path = env_string("SNOWFLAKE_PRIVATE_KEY_PATH")
                    .unwrap_or_else(|| DEFAULT_PRIVATE_KEY_PATH.to_string());
                read_key_file(&path)?
            }
        };

        let fingerprint = match env_string("SNOWFLAKE_PUBLIC_KEY_FP") {
            Some(fp) => strip_fingerprint_prefix(&fp),
            None => {
                let path = env_string("SNOWFLAKE_PUBLIC_KEY_PATH")
                    .unwrap_or_else(|| DEFAULT_PUBLIC_KEY_PATH.to_string());
                public_key_fingerprint(&read_key_file(&path)?)?
            }
        };

        let config = Self::new(account, user, private_key_pem, fingerprint);
        config.validate().map_err(CredentialError::InvalidKey)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.account.trim().is_empty() {
            return Err("SNOWFLAKE_ACCOUNT must be set".to_string());
        }
        if self.user.trim().is_empty() {
            return Err("SNOWFLAKE_USER must be set".to_string());
        }
        if self.public_key_fingerprint.is_empty() {
            return Err("public key fingerprint must not be empty".to_string());
        }
        Ok(())
    }

    /// `ACCOUNT.USER`, upper-cased as the warehouse expects.
    pub fn qualified_username(&self) -> String {
        format!(
            "{}.{}",
            self.account.trim().to_uppercase(),
            self.user.trim().to_uppercase()
        )
    }
}

fn read_key_file(path: &str) -> Result<String, CredentialError> {
    std::fs::read_to_string(Path::new(path))
        .map_err(|e| CredentialError::KeyUnreadable(format!("{}: {}", path, e)))
}

fn strip_fingerprint_prefix(fp: &str) -> String {
    let fp = fp.trim();
    fp.strip_prefix("SHA256:").unwrap_or(fp).to_string()
}

/// Base64 SHA-256 of the DER-encoded SubjectPublicKeyInfo in a PEM document.
pub fn public_key_fingerprint(public_key_pem: &str) -> Result<String, CredentialError> {
    let body: String = public_key_pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return Err(CredentialError::InvalidKey(
            "public key PEM has no body".to_string(),
        ));
    }
    let der = BASE64
        .decode(body.as_bytes())
        .map_err(|e| CredentialError::InvalidKey(format!("public key is not base64: {}", e)))?;
    Ok(BASE64.encode(Sha256::digest(&der)))
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
}

#[derive(Default)]
struct SignerState {
    cached: Option<WarehouseCredential>,
    last_issued_at: Option<DateTime<Utc>>,
}

/// Signs RS256 JWTs for key-pair authentication and caches the result.
pub struct KeypairCredentialProvider {
    issuer: String,
    subject: String,
    key: EncodingKey,
    state: Mutex<SignerState>,
}

impl KeypairCredentialProvider {
    pub fn new(config: &KeypairConfig) -> Result<Self, CredentialError> {
        config.validate().map_err(CredentialError::InvalidKey)?;
        let key = EncodingKey::from_rsa_pem(config.private_key_pem.as_bytes())
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        let subject = config.qualified_username();
        Ok(Self {
            issuer: format!("{}.SHA256:{}", subject, config.public_key_fingerprint),
            subject,
            key,
            state: Mutex::new(SignerState::default()),
        })
    }

    /// The `iss` claim placed in every token.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub(crate) fn current_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<WarehouseCredential, CredentialError> {
        let mut state = self.state.lock();

        if let Some(cached) = &state.cached {
            if cached.is_fresh_at(now, Duration::minutes(REFRESH_MARGIN_MINUTES)) {
                return Ok(cached.clone());
            }
        }

        if let Some(last) = state.last_issued_at {
            let drift = (last - now).num_seconds();
            if drift > CLOCK_SKEW_TOLERANCE_SECS {
                tracing::error!(drift_secs = drift, "Refusing to sign warehouse token");
                return Err(CredentialError::ClockSkew(drift));
            }
        }

        let expires_at = now + Duration::minutes(TOKEN_LIFETIME_MINUTES);
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: self.subject.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        let credential = WarehouseCredential {
            token,
            issued_at: now,
            expires_at,
        };
        state.cached = Some(credential.clone());
        state.last_issued_at = Some(now);
        tracing::debug!(expires_at = %expires_at, "Signed new warehouse token");
        Ok(credential)
    }
}

impl CredentialProvider for KeypairCredentialProvider {
    fn current(&self) -> Result<WarehouseCredential, CredentialError> {
        self.current_at(Utc::now())
    }

    fn invalidate(&self) {
        if self.state.lock().cached.take().is_some() {
            tracing::info!("Discarded cached warehouse token");
        }
    }
}
