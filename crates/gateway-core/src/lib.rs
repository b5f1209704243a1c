//! Data Product Gateway Core
//!
//! Core types, the client-facing error taxonomy, and input validation shared by
//! the warehouse connector and the request pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod env;
pub mod validation;

/// A dataset exposed through the gateway.
///
/// Built once at startup from the allow-list and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Public, URL-friendly name (e.g. `companies`, `company-index`)
    pub slug: String,
    /// Warehouse table or view the slug maps to (e.g. `COMPANY_INDEX`)
    pub backing_identifier: String,
}

impl DatasetDescriptor {
    pub fn new(slug: impl Into<String>, backing_identifier: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            backing_identifier: backing_identifier.into(),
        }
    }
}

/// A client API key as held by the key store.
///
/// Only the SHA-256 digest of the raw key is kept. The raw key is returned to
/// the caller once, at issue time.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    /// Opaque identifier; safe to surface only in masked form
    pub id: String,
    /// SHA-256 digest of the full raw key
    pub secret_hash: [u8; 32],
    /// When the key was created
    pub created_at: DateTime<Utc>,
    /// Revoked keys are retained for audit continuity
    pub revoked: bool,
}

impl std::fmt::Debug for ApiKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyRecord")
            .field("id", &self.id)
            .field("secret_hash", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("revoked", &self.revoked)
            .finish()
    }
}

/// Limit/offset window requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u64,
}

/// Column equality filters, ordered by column name.
///
/// Keys are validated column names; values are opaque strings whose type
/// coercion is left to the warehouse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSet(BTreeMap<String, String>);

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a filter after validating the column name and value.
    ///
    /// A repeated column replaces the earlier value.
    pub fn insert(
        &mut self,
        column: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let column = column.into();
        let value = value.into();
        validation::validate_column_name(&column)?;
        validation::validate_filter_value(&column, &value)?;
        if !self.0.contains_key(&column) && self.0.len() >= validation::MAX_FILTERS {
            return Err(GatewayError::validation(format!(
                "Too many filters: at most {} columns may be filtered",
                validation::MAX_FILTERS
            )));
        }
        self.0.insert(column, value);
        Ok(())
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What the warehouse connector is asked to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    /// Backing warehouse identifier (already resolved from the slug)
    pub dataset: String,
    pub filters: FilterSet,
    /// `None` for streamed exports, which are not paginated
    pub pagination: Option<Pagination>,
}

/// One result record, keyed by lower-cased column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Symbolic error codes used in the client-facing error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    ValidationError,
    RateLimitExceeded,
    ServiceUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code the transport layer must use for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::ValidationError => 400,
            ErrorCode::RateLimitExceeded => 429,
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::InternalError => 500,
        }
    }
}

/// Errors surfaced to gateway clients.
///
/// `Clone` because a single failed warehouse computation is delivered to every
/// request waiting on the same cache fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Vec<String>,
    },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn validation_with_details(message: impl Into<String>, details: Vec<String>) -> Self {
        GatewayError::Validation {
            message: message.into(),
            details,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Unauthorized(_) => ErrorCode::Unauthorized,
            GatewayError::Forbidden(_) => ErrorCode::Forbidden,
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::Validation { .. } => ErrorCode::ValidationError,
            GatewayError::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            GatewayError::Unavailable(_) => ErrorCode::ServiceUnavailable,
            GatewayError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.code().http_status()
    }

    /// Human-readable message safe to return to clients.
    ///
    /// Internal errors are replaced by a generic message; their detail is only logged.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Unauthorized(msg)
            | GatewayError::Forbidden(msg)
            | GatewayError::NotFound(msg)
            | GatewayError::Unavailable(msg) => msg.clone(),
            GatewayError::Validation { message, .. } => message.clone(),
            GatewayError::RateLimited { retry_after_secs } => format!(
                "Too many requests. Please retry after {} seconds.",
                retry_after_secs
            ),
            GatewayError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// Optional structured context for the error envelope.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            GatewayError::Validation { details, .. } if !details.is_empty() => {
                Some(serde_json::json!(details))
            }
            GatewayError::RateLimited { retry_after_secs } => {
                Some(serde_json::json!({ "retry_after": retry_after_secs }))
            }
            _ => None,
        }
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
