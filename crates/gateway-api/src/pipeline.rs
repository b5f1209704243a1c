//! Request pipeline
//!
//! Sequences every data request:
//! authenticate → admit → resolve dataset → parse query → fingerprint →
//! (buffered) cache with breaker-guarded fetch, or (stream) breaker-guarded
//! stream that bypasses the cache → audit.
//!
//! Each stage short-circuits with its own error. The audit record is written
//! for every request, including failed and abandoned ones. A streamed read
//! holds its breaker permit until the last row, so failures after the first
//! chunk still count against the warehouse.

use crate::api_keys::{mask_key_id, IssuedKey, KeyStore};
use crate::audit::{AuditDraft, AuditLogger};
use crate::cache::{CacheManager, CacheStatus, Fingerprint};
use crate::circuit_breaker::{CallError, CircuitBreaker, OwnedPermit};
use crate::config::GatewayConfig;
use crate::rate_limiting::{Admission, RateLimitMetadata, RateLimiter};
use crate::registry::DatasetRegistry;
use axum::body::Bytes;
use dataproduct_gateway_core::validation::{parse_flag, parse_pagination, PaginationBounds};
use dataproduct_gateway_core::{
    ApiKeyRecord, DatasetDescriptor, FilterSet, GatewayError, Pagination, QuerySpec, Result, Row,
};
use dataproduct_gateway_warehouse::{ConnectorError, RowStream, WarehouseConnector};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Query parameters with a fixed meaning; everything else is a column filter.
pub const RESERVED_PARAMS: &[&str] = &["limit", "offset", "stream", "test_filter_col", "test_filter_val"];

/// Newline-delimited JSON records.
pub type NdjsonStream = BoxStream<'static, Bytes>;

/// Transport-independent facts about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub path: String,
    pub client_ip: String,
}

#[derive(Debug, Clone)]
pub struct DataRequest {
    pub context: RequestContext,
    pub api_key: Option<String>,
    pub slug: String,
    /// Raw query parameters in arrival order
    pub params: Vec<(String, String)>,
    /// Set when the query string could not be decoded at all
    pub malformed_query: Option<String>,
}

pub enum DataBody {
    Buffered {
        rows: Arc<Vec<Row>>,
        pagination: Pagination,
        cache: CacheStatus,
    },
    Stream(NdjsonStream),
}

pub struct DataOutcome {
    pub dataset: DatasetDescriptor,
    pub rate_limit: RateLimitMetadata,
    pub body: DataBody,
}

/// A failed data request, with rate-limit metadata once the request was admitted.
#[derive(Debug, Clone)]
pub struct DataError {
    pub error: GatewayError,
    pub rate_limit: Option<RateLimitMetadata>,
}

impl DataError {
    fn before_admission(error: GatewayError) -> Self {
        Self {
            error,
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub warehouse: &'static str,
    pub circuit: &'static str,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Parsed and validated query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub filters: FilterSet,
    pub pagination: Pagination,
    pub stream: bool,
}

/// Split raw parameters into pagination, the stream flag and column filters.
///
/// A later occurrence of a parameter wins. The `test_filter_col` /
/// `test_filter_val` pair adds one filter when both are non-empty; an explicit
/// parameter for the same column overrides it.
pub fn parse_query(params: &[(String, String)], bounds: &PaginationBounds) -> Result<ParsedQuery> {
    let mut reserved: HashMap<&str, &str> = HashMap::new();
    let mut columns: Vec<(&str, &str)> = Vec::new();
    for (key, value) in params {
        if RESERVED_PARAMS.contains(&key.as_str()) {
            reserved.insert(key.as_str(), value.as_str());
        } else {
            columns.push((key.as_str(), value.as_str()));
        }
    }

    let pagination = parse_pagination(
        reserved.get("limit").copied(),
        reserved.get("offset").copied(),
        bounds,
    )?;
    let stream = parse_flag("stream", reserved.get("stream").copied())?;

    let mut filters = FilterSet::new();
    if let (Some(column), Some(value)) = (
        reserved.get("test_filter_col").copied(),
        reserved.get("test_filter_val").copied(),
    ) {
        if !column.is_empty() && !value.is_empty() {
            filters.insert(column, value)?;
        }
    }
    for (column, value) in columns {
        filters.insert(column, value)?;
    }

    Ok(ParsedQuery {
        filters,
        pagination,
        stream,
    })
}

enum Prepared {
    Buffered {
        dataset: DatasetDescriptor,
        rate_limit: RateLimitMetadata,
        rows: Arc<Vec<Row>>,
        pagination: Pagination,
        cache: CacheStatus,
    },
    Stream {
        dataset: DatasetDescriptor,
        rate_limit: RateLimitMetadata,
        rows: GuardedRows,
    },
}

/// An open warehouse stream that still owes the breaker its outcome.
///
/// The permit is settled by the first failure or by the end of the stream.
/// Dropping the stream early leaves the breaker untouched.
struct GuardedRows {
    rows: RowStream,
    permit: Option<OwnedPermit>,
    breaker: Arc<CircuitBreaker>,
    keys: Arc<KeyStore>,
    idle_timeout: Duration,
    started: Instant,
}

impl GuardedRows {
    /// Next row; `None` after the end of the stream or its first failure.
    async fn next(&mut self) -> Option<std::result::Result<Row, CallError>> {
        self.permit.as_ref()?;
        let result = match tokio::time::timeout(self.idle_timeout, self.rows.next()).await {
            Ok(Some(Ok(row))) => return Some(Ok(row)),
            Ok(None) => Ok(()),
            Ok(Some(Err(e))) => Err(CallError::Connector(e)),
            Err(_) => Err(CallError::Timeout(self.idle_timeout)),
        };

        observe(&result, self.started);
        if let Err(e) = &result {
            refresh_on_auth_failure(&self.breaker, &self.keys, e);
        }
        if let Some(permit) = self.permit.take() {
            permit.settle(&result);
        }
        result.err().map(Err)
    }
}

/// Owns every pipeline component; shared by all request handlers.
pub struct Pipeline {
    registry: DatasetRegistry,
    keys: Arc<KeyStore>,
    limiter: RateLimiter,
    cache: CacheManager<Vec<Row>>,
    breaker: Arc<CircuitBreaker>,
    connector: Arc<dyn WarehouseConnector>,
    audit: AuditLogger,
    pagination: PaginationBounds,
    warehouse_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        registry: DatasetRegistry,
        keys: KeyStore,
        connector: Arc<dyn WarehouseConnector>,
        audit: AuditLogger,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            registry,
            keys: Arc::new(keys),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            cache: CacheManager::new(config.cache.clone()),
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            connector,
            audit,
            pagination: config.pagination,
            warehouse_timeout: config.warehouse_timeout,
        }
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &CacheManager<Vec<Row>> {
        &self.cache
    }

    pub fn audit_logger(&self) -> &AuditLogger {
        &self.audit
    }

    /// Serve one data request.
    pub async fn handle(&self, request: DataRequest) -> std::result::Result<DataOutcome, DataError> {
        let initial_key = if request.api_key.is_some() {
            "rejected"
        } else {
            "anonymous"
        };
        let mut audit = AuditDraft::new(self.audit.clone(), request.context.clone(), initial_key);

        match self.process(request, &mut audit).await {
            Ok(Prepared::Buffered {
                dataset,
                rate_limit,
                rows,
                pagination,
                cache,
            }) => {
                audit.status = 200;
                Ok(DataOutcome {
                    dataset,
                    rate_limit,
                    body: DataBody::Buffered {
                        rows,
                        pagination,
                        cache,
                    },
                })
            }
            Ok(Prepared::Stream {
                dataset,
                rate_limit,
                rows,
            }) => {
                // Status is settled by the body once the stream ends.
                Ok(DataOutcome {
                    dataset,
                    rate_limit,
                    body: DataBody::Stream(ndjson(rows, audit)),
                })
            }
            Err(e) => {
                audit.status = e.error.http_status();
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        request: DataRequest,
        audit: &mut AuditDraft,
    ) -> std::result::Result<Prepared, DataError> {
        let record: ApiKeyRecord = self
            .keys
            .authenticate_client(request.api_key.as_deref())
            .map_err(DataError::before_admission)?;
        audit.masked_key_id = mask_key_id(&record.id);

        let rate_limit = match self.limiter.admit(&record.id) {
            Admission::Allowed(metadata) => metadata,
            Admission::Denied {
                retry_after_secs,
                metadata,
            } => {
                return Err(DataError {
                    error: GatewayError::RateLimited { retry_after_secs },
                    rate_limit: Some(metadata),
                });
            }
        };
        let admitted = |error: GatewayError| DataError {
            error,
            rate_limit: Some(rate_limit),
        };

        let dataset = self.registry.resolve(&request.slug).map_err(admitted)?;
        if let Some(detail) = request.malformed_query {
            return Err(admitted(GatewayError::validation_with_details(
                "The request inputs were invalid.",
                vec![format!("query: {}", detail)],
            )));
        }
        let query = parse_query(&request.params, &self.pagination).map_err(admitted)?;

        let pagination = (!query.stream).then_some(query.pagination);
        let fingerprint = Fingerprint::compute(
            &dataset.backing_identifier,
            &query.filters,
            pagination,
            query.stream,
        );
        debug!(
            request_id = %request.context.request_id,
            dataset = %dataset.backing_identifier,
            fingerprint = %fingerprint,
            stream = query.stream,
            "Request admitted"
        );

        let spec = QuerySpec {
            dataset: dataset.backing_identifier.clone(),
            filters: query.filters,
            pagination,
        };

        if query.stream {
            let rows = self.open_stream(&spec, &dataset).await.map_err(admitted)?;
            return Ok(Prepared::Stream {
                dataset,
                rate_limit,
                rows,
            });
        }

        let (rows, cache) = self
            .cache
            .get_or_compute(&fingerprint, || self.fetch_rows(spec, &dataset))
            .await
            .map_err(admitted)?;

        #[cfg(feature = "metrics")]
        crate::metrics::record_cache_lookup(match cache {
            CacheStatus::Hit => "hit",
            CacheStatus::Shared => "shared",
            CacheStatus::Miss => "miss",
        });

        Ok(Prepared::Buffered {
            dataset,
            rate_limit,
            rows,
            pagination: query.pagination,
            cache,
        })
    }

    async fn fetch_rows(&self, spec: QuerySpec, dataset: &DatasetDescriptor) -> Result<Vec<Row>> {
        let credential = self.keys.current_warehouse_credential()?;
        let started = Instant::now();
        let result = self
            .breaker
            .call(self.warehouse_timeout, self.connector.fetch(&credential, &spec))
            .await;
        observe(&result, started);
        result.map_err(|e| self.classify(e, dataset))
    }

    /// Open a streamed read. The breaker permit travels with the stream and is
    /// settled when the stream ends, not when it opens.
    async fn open_stream(&self, spec: &QuerySpec, dataset: &DatasetDescriptor) -> Result<GuardedRows> {
        let credential = self.keys.current_warehouse_credential()?;
        let started = Instant::now();
        let permit = self
            .breaker
            .acquire_owned()
            .map_err(|e| self.classify(e, dataset))?;

        let opened = match tokio::time::timeout(
            self.warehouse_timeout,
            self.connector.open_stream(&credential, spec),
        )
        .await
        {
            Err(_) => Err(CallError::Timeout(self.warehouse_timeout)),
            Ok(result) => result.map_err(CallError::Connector),
        };

        match opened {
            Ok(rows) => Ok(GuardedRows {
                rows,
                permit: Some(permit),
                breaker: Arc::clone(&self.breaker),
                keys: Arc::clone(&self.keys),
                idle_timeout: self.warehouse_timeout,
                started,
            }),
            Err(e) => {
                permit.settle(&Err::<(), _>(e.clone()));
                observe(&Err::<(), _>(e.clone()), started);
                Err(self.classify(e, dataset))
            }
        }
    }

    /// Map a guarded-call failure to the client taxonomy.
    fn classify(&self, err: CallError, dataset: &DatasetDescriptor) -> GatewayError {
        refresh_on_auth_failure(&self.breaker, &self.keys, &err);
        match err {
            CallError::Open => {
                GatewayError::Unavailable("Warehouse temporarily unavailable. Please retry later.".to_string())
            }
            CallError::Timeout(after) => {
                warn!(timeout_secs = after.as_secs(), "Warehouse call timed out");
                GatewayError::Unavailable("Warehouse request timed out.".to_string())
            }
            CallError::Connector(e) => match e {
                ConnectorError::NotFound(_) => GatewayError::NotFound(format!(
                    "View '{}' not found or not allowed.",
                    dataset.slug
                )),
                ConnectorError::InvalidQuery(detail) => {
                    warn!(dataset = %dataset.backing_identifier, detail = %detail, "Warehouse rejected query");
                    GatewayError::validation_with_details(
                        "The request inputs were invalid.",
                        vec!["query: rejected by the warehouse, check filter column names".to_string()],
                    )
                }
                other => {
                    error!(dataset = %dataset.backing_identifier, error = %other, "Warehouse call failed");
                    GatewayError::Unavailable("Warehouse unavailable.".to_string())
                }
            },
        }
    }

    /// Issue a client key (admin).
    pub async fn issue_key(
        &self,
        context: RequestContext,
        admin_secret: Option<&str>,
    ) -> Result<IssuedKey> {
        let mut audit = AuditDraft::new(self.audit.clone(), context, "admin");
        let result = self.keys.issue_key(admin_secret).await;
        audit.status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status(),
        };
        result
    }

    /// Revoke a client key (admin).
    pub async fn revoke_key(
        &self,
        context: RequestContext,
        admin_secret: Option<&str>,
        key_id: &str,
    ) -> Result<ApiKeyRecord> {
        let mut audit = AuditDraft::new(self.audit.clone(), context, "admin");
        let result = self.keys.revoke_key(admin_secret, key_id).await;
        audit.status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status(),
        };
        result
    }

    /// Connectivity report. Bypasses the cache and breaker accounting.
    pub async fn health(&self) -> HealthReport {
        let connected = match self.keys.current_warehouse_credential() {
            Ok(credential) => matches!(
                tokio::time::timeout(self.warehouse_timeout, self.connector.ping(&credential)).await,
                Ok(Ok(()))
            ),
            Err(_) => false,
        };
        if !connected {
            warn!("Health check could not reach the warehouse");
        }

        HealthReport {
            status: if connected { "healthy" } else { "degraded" },
            service: "up",
            warehouse: if connected { "connected" } else { "disconnected" },
            circuit: self.breaker.state().as_str(),
        }
    }
}

fn observe<T>(result: &std::result::Result<T, CallError>, started: Instant) {
    let outcome = match result {
        Ok(_) => "success",
        Err(CallError::Open) => "rejected",
        Err(CallError::Timeout(_)) => "timeout",
        Err(CallError::Connector(e)) if e.is_auth() => "auth",
        Err(CallError::Connector(ConnectorError::NotFound(_))) => "not_found",
        Err(CallError::Connector(ConnectorError::InvalidQuery(_))) => "invalid_query",
        Err(CallError::Connector(_)) => "error",
    };
    let elapsed = started.elapsed();
    debug!(outcome, elapsed_ms = elapsed.as_millis() as u64, "Warehouse call finished");

    #[cfg(feature = "metrics")]
    if !matches!(result, Err(CallError::Open)) {
        crate::metrics::record_warehouse_call(outcome, elapsed.as_secs_f64());
    }
}

/// Invalidate the warehouse credential after repeated auth rejections.
fn refresh_on_auth_failure(breaker: &CircuitBreaker, keys: &KeyStore, err: &CallError) {
    if let CallError::Connector(e) = err {
        if e.is_auth() && breaker.record_auth_failure() {
            keys.invalidate_warehouse_credential();
        }
    }
}

/// Serialize rows one line at a time. A row failure ends the body early;
/// lines already sent stay valid. The audit record is written when the
/// body finishes or is dropped; a body dropped before its end is recorded
/// as a client disconnect.
fn ndjson(rows: GuardedRows, audit: AuditDraft) -> NdjsonStream {
    stream::unfold((rows, audit), |(mut rows, mut audit)| async move {
        match rows.next().await {
            Some(Ok(row)) => match serde_json::to_vec(&row) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Some((Bytes::from(line), (rows, audit)))
                }
                Err(e) => {
                    error!(request_id = %audit.context.request_id, error = %e, "Failed to serialize row");
                    audit.status = 200;
                    None
                }
            },
            Some(Err(e)) => {
                warn!(request_id = %audit.context.request_id, error = %e, "Warehouse stream failed, ending response early");
                audit.status = 200;
                None
            }
            None => {
                audit.status = 200;
                None
            }
        }
    })
    .boxed()
}
