//! Data Product Gateway Warehouse
//!
//! The outbound side of the gateway: the [`WarehouseConnector`] seam the request
//! pipeline calls through, the signed [`WarehouseCredential`] it authenticates
//! with, statement translation, and the Snowflake SQL API v2 connector.
//!
//! Connector failures are classified into [`ConnectorError`] kinds so the
//! circuit breaker can tell a sick warehouse (auth, timeout, transport) apart
//! from a bad request (unknown object, invalid query).

use async_trait::async_trait;
use dataproduct_gateway_core::{QuerySpec, Row};
use futures::stream::BoxStream;

pub mod credential;
pub mod snowflake;
pub mod statement;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use credential::{
    CredentialError, CredentialProvider, KeypairConfig, KeypairCredentialProvider,
    WarehouseCredential,
};
pub use snowflake::{SnowflakeConfig, SnowflakeConnector};

/// Lazily produced, single-pass sequence of result rows.
///
/// Dropping the stream aborts any in-flight warehouse request.
pub type RowStream = BoxStream<'static, Result<Row, ConnectorError>>;

/// Classified connector failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("Warehouse authentication failed: {0}")]
    Auth(String),

    #[error("Warehouse call timed out: {0}")]
    Timeout(String),

    #[error("Warehouse object not found: {0}")]
    NotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected warehouse response: {0}")]
    Protocol(String),

    #[error("Warehouse error: {0}")]
    Generic(String),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

impl ConnectorError {
    /// Whether this failure says something about warehouse health.
    ///
    /// Unknown objects and rejected queries are caller mistakes and must not
    /// trip the circuit breaker.
    pub fn is_health_failure(&self) -> bool {
        !matches!(
            self,
            ConnectorError::NotFound(_) | ConnectorError::InvalidQuery(_)
        )
    }

    /// Whether the warehouse rejected the credential.
    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectorError::Auth(_))
    }
}

/// Executes read queries against the warehouse.
///
/// Implementations own statement translation and type coercion; callers only
/// hand over a resolved [`QuerySpec`] and a live credential.
#[async_trait]
pub trait WarehouseConnector: Send + Sync {
    /// Execute the query and buffer every row.
    async fn fetch(
        &self,
        credential: &WarehouseCredential,
        spec: &QuerySpec,
    ) -> Result<Vec<Row>, ConnectorError>;

    /// Start the query and return rows as they arrive.
    ///
    /// Failures before the first row are returned directly; failures after
    /// that terminate the stream with an `Err` item.
    async fn open_stream(
        &self,
        credential: &WarehouseCredential,
        spec: &QuerySpec,
    ) -> Result<RowStream, ConnectorError>;

    /// Cheap connectivity check (`SELECT 1`).
    async fn ping(&self, credential: &WarehouseCredential) -> Result<(), ConnectorError>;
}
