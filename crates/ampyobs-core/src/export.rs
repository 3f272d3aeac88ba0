//! Export batches and the exporter trait
//!
//! An exporter ships one [`ExportBatch`] at a time. The worker loop owns
//! retries and backoff, so implementations just report what went wrong.

use crate::records::{LogRecord, MetricPoint, Signal, SpanRecord};
use crate::resource::Resource;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Bounded failure reasons used as the `reason` label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Transport,
    Endpoint,
    Timeout,
    Encoding,
    Io,
    Shutdown,
}

impl FailureReason {
    pub const COUNT: usize = 6;

    pub const ALL: [FailureReason; Self::COUNT] = [
        FailureReason::Transport,
        FailureReason::Endpoint,
        FailureReason::Timeout,
        FailureReason::Encoding,
        FailureReason::Io,
        FailureReason::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Transport => "transport",
            FailureReason::Endpoint => "endpoint",
            FailureReason::Timeout => "timeout",
            FailureReason::Encoding => "encoding",
            FailureReason::Io => "io",
            FailureReason::Shutdown => "shutdown",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors an exporter can report for one send attempt
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Collector returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("Export timed out")]
    Timeout,

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Exporter is shut down")]
    Shutdown,
}

impl ExportError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExportError::Transport(_)
                | ExportError::Endpoint { .. }
                | ExportError::Timeout
                | ExportError::Io(_)
        )
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            ExportError::Transport(_) => FailureReason::Transport,
            ExportError::Endpoint { .. } => FailureReason::Endpoint,
            ExportError::Timeout => FailureReason::Timeout,
            ExportError::Encoding(_) => FailureReason::Encoding,
            ExportError::Io(_) => FailureReason::Io,
            ExportError::Shutdown => FailureReason::Shutdown,
        }
    }
}

pub type ExportResult<T> = Result<T, ExportError>;

/// Records of a single signal kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchPayload {
    Logs(Vec<LogRecord>),
    Metrics(Vec<MetricPoint>),
    Traces(Vec<SpanRecord>),
}

impl BatchPayload {
    pub fn signal(&self) -> Signal {
        match self {
            BatchPayload::Logs(_) => Signal::Logs,
            BatchPayload::Metrics(_) => Signal::Metrics,
            BatchPayload::Traces(_) => Signal::Traces,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BatchPayload::Logs(r) => r.len(),
            BatchPayload::Metrics(r) => r.len(),
            BatchPayload::Traces(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Same-kind records plus the process resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportBatch {
    pub resource: Resource,
    pub signal: Signal,
    pub records: BatchPayload,
}

impl ExportBatch {
    pub fn new(resource: Resource, records: BatchPayload) -> Self {
        Self {
            resource,
            signal: records.signal(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A record type with its own pipeline
pub trait BatchRecord: Send + Sync + 'static {
    const SIGNAL: Signal;

    fn into_payload(records: Vec<Self>) -> BatchPayload
    where
        Self: Sized;
}

impl BatchRecord for LogRecord {
    const SIGNAL: Signal = Signal::Logs;

    fn into_payload(records: Vec<Self>) -> BatchPayload {
        BatchPayload::Logs(records)
    }
}

impl BatchRecord for MetricPoint {
    const SIGNAL: Signal = Signal::Metrics;

    fn into_payload(records: Vec<Self>) -> BatchPayload {
        BatchPayload::Metrics(records)
    }
}

impl BatchRecord for SpanRecord {
    const SIGNAL: Signal = Signal::Traces;

    fn into_payload(records: Vec<Self>) -> BatchPayload {
        BatchPayload::Traces(records)
    }
}

/// Destination for export batches
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Exporter name for diagnostics
    fn name(&self) -> &str;

    /// Send one batch. Called by a single worker at a time per signal.
    async fn export(&self, batch: &ExportBatch) -> ExportResult<()>;

    /// Flush anything buffered inside the exporter
    async fn flush(&self) -> ExportResult<()> {
        Ok(())
    }

    /// Called once when the owning worker stops
    async fn shutdown(&self) -> ExportResult<()> {
        self.flush().await
    }
}

/// Keeps every exported batch in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    batches: Arc<Mutex<Vec<ExportBatch>>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<ExportBatch> {
        self.batches.lock().clone()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.batches
            .lock()
            .iter()
            .filter_map(|b| match &b.records {
                BatchPayload::Traces(spans) => Some(spans.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.batches
            .lock()
            .iter()
            .filter_map(|b| match &b.records {
                BatchPayload::Logs(logs) => Some(logs.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn metrics(&self) -> Vec<MetricPoint> {
        self.batches
            .lock()
            .iter()
            .filter_map(|b| match &b.records {
                BatchPayload::Metrics(points) => Some(points.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}

#[async_trait]
impl Exporter for InMemoryExporter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn export(&self, batch: &ExportBatch) -> ExportResult<()> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}
