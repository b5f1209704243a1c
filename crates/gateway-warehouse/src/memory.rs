//! In-memory warehouse for tests.
//!
//! Serves rows from named tables with equality filtering and limit/offset,
//! counts calls, and can be told to fail, stall, or break mid-stream.

use crate::credential::{CredentialError, CredentialProvider, WarehouseCredential};
use crate::{ConnectorError, RowStream, WarehouseConnector};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dataproduct_gateway_core::{QuerySpec, Row};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct InMemoryConnector {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    failure: Mutex<Option<ConnectorError>>,
    stream_failure_after: Mutex<Option<usize>>,
    ping_failing: AtomicBool,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, identifier: impl Into<String>, rows: Vec<Row>) -> Self {
        self.tables.lock().insert(identifier.into(), rows);
        self
    }

    /// Delay every call by `latency` (uses tokio time, so paused clocks apply).
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    /// Fail every call with `error` until cleared.
    pub fn fail_with(&self, error: ConnectorError) {
        *self.failure.lock() = Some(error);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Streams yield `rows` rows and then a transport error.
    pub fn fail_stream_after(&self, rows: usize) {
        *self.stream_failure_after.lock() = Some(rows);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_failing.store(!ok, Ordering::SeqCst);
    }

    /// Number of `fetch` and `open_stream` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> Result<(), ConnectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let failure = self.failure.lock().clone();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn select(&self, spec: &QuerySpec) -> Result<Vec<Row>, ConnectorError> {
        let tables = self.tables.lock();
        let rows = tables
            .get(&spec.dataset)
            .ok_or_else(|| ConnectorError::NotFound(spec.dataset.clone()))?;

        let matching = rows.iter().filter(|row| {
            spec.filters.iter().all(|(column, expected)| {
                row.get(column).is_some_and(|value| match value {
                    Value::String(s) => s == expected,
                    other => other.to_string() == expected,
                })
            })
        });

        let selected = match spec.pagination {
            Some(page) => matching
                .skip(usize::try_from(page.offset).unwrap_or(usize::MAX))
                .take(page.limit as usize)
                .cloned()
                .collect(),
            None => matching.cloned().collect(),
        };
        Ok(selected)
    }
}

#[async_trait]
impl WarehouseConnector for InMemoryConnector {
    async fn fetch(
        &self,
        _credential: &WarehouseCredential,
        spec: &QuerySpec,
    ) -> Result<Vec<Row>, ConnectorError> {
        self.begin().await?;
        self.select(spec)
    }

    async fn open_stream(
        &self,
        _credential: &WarehouseCredential,
        spec: &QuerySpec,
    ) -> Result<RowStream, ConnectorError> {
        self.begin().await?;
        let rows = self.select(spec)?;
        let fail_after = *self.stream_failure_after.lock();

        let items: Vec<Result<Row, ConnectorError>> = match fail_after {
            Some(n) => rows
                .into_iter()
                .take(n)
                .map(Ok)
                .chain(std::iter::once(Err(ConnectorError::Transport(
                    "connection reset mid-stream".to_string(),
                ))))
                .collect(),
            None => rows.into_iter().map(Ok).collect(),
        };
        Ok(stream::iter(items).boxed())
    }

    async fn ping(&self, _credential: &WarehouseCredential) -> Result<(), ConnectorError> {
        if self.ping_failing.load(Ordering::SeqCst) {
            Err(ConnectorError::Transport("warehouse unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Hands out a fixed token and counts invalidations.
#[derive(Default)]
pub struct StaticCredentialProvider {
    invalidations: AtomicUsize,
    failing: AtomicBool,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn current(&self) -> Result<WarehouseCredential, CredentialError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CredentialError::KeyUnreadable("rsa_key.p8: not found".to_string()));
        }
        let now = Utc::now();
        Ok(WarehouseCredential {
            token: "static-test-token".to_string(),
            issued_at: now,
            expires_at: now + ChronoDuration::minutes(59),
        })
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Build a row from `(column, value)` pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}
