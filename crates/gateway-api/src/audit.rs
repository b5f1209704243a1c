//! Request audit records
//!
//! One [`AuditRecord`] is emitted per request, whatever the route or outcome.
//! Emission never blocks: records go through a bounded channel to a
//! background writer, and when the channel is full or closed the record is
//! written straight to the `audit_fallback` tracing target instead.
//! Sink failures are logged and otherwise ignored.
//!
//! ## Configuration
//!
//! - `DATAPRODUCT_AUDIT_BUFFER_SIZE`: channel capacity (default: 1000)
//! - `DATAPRODUCT_AUDIT_FLUSH_INTERVAL_MS`: writer flush interval (default: 5000)

use crate::pipeline::RequestContext;
use chrono::{DateTime, Utc};
use dataproduct_gateway_core::env::env_parse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default channel capacity
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Default flush interval in milliseconds
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;

/// Records per sink write
const BATCH_SIZE: usize = 100;

/// Status recorded when the client goes away before the response completes.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// One request, as seen by the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: String,
    /// Masked key id, or `anonymous` when no key was presented
    pub masked_key_id: String,
    pub path: String,
    pub duration_ms: u64,
    pub status_code: u16,
    pub client_ip: String,
    pub timestamp: DateTime<Utc>,
}

/// Configuration for the audit logger
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Maximum number of records in the buffer
    pub buffer_size: usize,
    /// Flush interval in milliseconds
    pub flush_interval_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

impl AuditConfig {
    pub fn from_env() -> Self {
        Self {
            buffer_size: env_parse("DATAPRODUCT_AUDIT_BUFFER_SIZE", DEFAULT_BUFFER_SIZE),
            flush_interval_ms: env_parse(
                "DATAPRODUCT_AUDIT_FLUSH_INTERVAL_MS",
                DEFAULT_FLUSH_INTERVAL_MS,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("audit buffer_size must be > 0".to_string());
        }
        if self.flush_interval_ms == 0 {
            return Err("audit flush_interval_ms must be > 0".to_string());
        }
        Ok(())
    }
}

/// Destination for audit batches.
pub trait AuditSink: Send + Sync {
    fn write_batch(&self, records: &[AuditRecord]) -> Result<(), String>;
}

/// Writes every record as a structured event on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn write_batch(&self, records: &[AuditRecord]) -> Result<(), String> {
        for record in records {
            info!(
                target: "audit",
                request_id = %record.request_id,
                key_id = %record.masked_key_id,
                path = %record.path,
                status_code = record.status_code,
                duration_ms = record.duration_ms,
                client_ip = %record.client_ip,
                timestamp = %record.timestamp.to_rfc3339(),
                "request"
            );
        }
        Ok(())
    }
}

/// Handle for emitting audit records; cheap to clone.
#[derive(Clone)]
pub struct AuditLogger {
    sender: mpsc::Sender<AuditRecord>,
}

impl AuditLogger {
    /// Returns the logger handle and the receiver for [`audit_writer_task`].
    pub fn new(config: &AuditConfig) -> (Self, mpsc::Receiver<AuditRecord>) {
        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        (Self { sender }, receiver)
    }

    /// Queue a record without blocking.
    pub fn emit(&self, record: AuditRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(request_id = %record.request_id, "Audit buffer full, writing fallback");
                fallback(&record, "buffer overflow");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                error!(request_id = %record.request_id, "Audit channel closed, writing fallback");
                fallback(&record, "channel closed");
            }
        }
    }
}

/// An audit record in progress, emitted when dropped.
///
/// Starts as [`CLIENT_CLOSED_REQUEST`]; whoever produces the response sets the
/// final status. A draft dropped with the request future or an unfinished
/// response body therefore records a client disconnect.
pub(crate) struct AuditDraft {
    logger: AuditLogger,
    pub(crate) context: RequestContext,
    pub(crate) masked_key_id: String,
    started: Instant,
    pub(crate) status: u16,
}

impl AuditDraft {
    pub(crate) fn new(logger: AuditLogger, context: RequestContext, masked_key_id: &str) -> Self {
        Self {
            logger,
            context,
            masked_key_id: masked_key_id.to_string(),
            started: Instant::now(),
            status: CLIENT_CLOSED_REQUEST,
        }
    }
}

impl Drop for AuditDraft {
    fn drop(&mut self) {
        let context = std::mem::take(&mut self.context);
        self.logger.emit(AuditRecord {
            request_id: context.request_id,
            masked_key_id: std::mem::take(&mut self.masked_key_id),
            path: context.path,
            duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            status_code: self.status,
            client_ip: context.client_ip,
            timestamp: Utc::now(),
        });
    }
}

fn fallback(record: &AuditRecord, reason: &str) {
    info!(
        target: "audit_fallback",
        request_id = %record.request_id,
        key_id = %record.masked_key_id,
        path = %record.path,
        status_code = record.status_code,
        duration_ms = record.duration_ms,
        client_ip = %record.client_ip,
        reason,
        "Audit record"
    );
}

/// Background task draining the audit channel into `sink`.
///
/// Flushes every `BATCH_SIZE` records, on each interval tick, and once more
/// when every [`AuditLogger`] has been dropped.
pub async fn audit_writer_task(
    mut receiver: mpsc::Receiver<AuditRecord>,
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
) {
    let flush_interval = std::time::Duration::from_millis(config.flush_interval_ms.max(1));
    let mut batch: Vec<AuditRecord> = Vec::with_capacity(BATCH_SIZE);
    let mut interval = tokio::time::interval(flush_interval);

    info!(
        buffer_size = config.buffer_size,
        flush_interval_ms = config.flush_interval_ms,
        "Audit writer task started"
    );

    loop {
        tokio::select! {
            record = receiver.recv() => {
                match record {
                    Some(r) => {
                        batch.push(r);
                        if batch.len() >= BATCH_SIZE {
                            flush_batch(&mut batch, sink.as_ref());
                        }
                    }
                    None => {
                        flush_batch(&mut batch, sink.as_ref());
                        info!("Audit writer task shutting down");
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_batch(&mut batch, sink.as_ref());
            }
        }
    }
}

fn flush_batch(batch: &mut Vec<AuditRecord>, sink: &dyn AuditSink) {
    if batch.is_empty() {
        return;
    }
    let records = std::mem::take(batch);
    debug!(count = records.len(), "Flushing audit batch");

    if let Err(e) = sink.write_batch(&records) {
        warn!(error = %e, count = records.len(), "Audit sink failed, writing fallback");
        for record in &records {
            fallback(record, "sink failure");
        }
    }
}
