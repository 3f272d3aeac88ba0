//! Telemetry records handed to the export buffers

use crate::cardinality::LabelKey;
use crate::context::{DomainContext, SpanId, TraceFlags, TraceId};
use crate::sampler::OverrideClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Well-known span attribute and log field keys
pub mod keys {
    pub const MESSAGING_SYSTEM: &str = "messaging.system";
    pub const MESSAGING_DESTINATION: &str = "messaging.destination";
    pub const MESSAGING_MESSAGE_ID: &str = "messaging.message_id";
    pub const SCHEMA_FQDN: &str = "schema.fqdn";
    pub const PARTITION_KEY: &str = "partition_key";
    pub const RUN_ID: &str = "run_id";
    pub const CLIENT_ORDER_ID: &str = "client_order_id";
    pub const SYMBOL: &str = "symbol";
    pub const MIC: &str = "mic";
    pub const BROKER: &str = "broker";
    pub const OVERRIDE: &str = "sampling.override";
}

/// Signal kind, one pipeline each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Logs,
    Metrics,
    Traces,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Logs, Signal::Metrics, Signal::Traces];

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Logs => "logs",
            Signal::Metrics => "metrics",
            Signal::Traces => "traces",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Signal::Logs => 0,
            Signal::Metrics => 1,
            Signal::Traces => 2,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered key/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            key: key.into(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    #[default]
    Internal,
    Producer,
    Consumer,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl SpanStatus {
    pub fn error(description: impl Into<String>) -> Self {
        SpanStatus::Error {
            description: Some(description.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error { .. })
    }
}

/// Reference to a span in another (possibly foreign) trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

/// A finished span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub name: String,
    pub kind: SpanKind,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub flags: TraceFlags,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attributes: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    pub status: SpanStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Bounded set of log event tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogEvent {
    #[serde(rename = "startup")]
    Startup,
    #[serde(rename = "shutdown")]
    Shutdown,
    #[serde(rename = "bus.publish")]
    BusPublish,
    #[serde(rename = "bus.consume")]
    BusConsume,
    #[serde(rename = "signals.emit")]
    SignalEmit,
    #[serde(rename = "order.submit")]
    OrderSubmit,
    #[serde(rename = "order.ack")]
    OrderAck,
    #[serde(rename = "order.reject")]
    OrderReject,
    #[serde(rename = "dlq")]
    DeadLetter,
    #[serde(rename = "other")]
    Other,
}

impl LogEvent {
    /// Override class implied by this event, if any
    pub fn override_class(&self) -> Option<OverrideClass> {
        match self {
            LogEvent::OrderReject => Some(OverrideClass::OrderRejection),
            LogEvent::DeadLetter => Some(OverrideClass::DeadLetter),
            _ => None,
        }
    }
}

/// A structured log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<LogEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<SpanId>,
    #[serde(flatten)]
    pub domain: DomainContext,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Value of one recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricValue {
    Counter {
        increment: u64,
    },
    Gauge {
        value: f64,
    },
    Histogram {
        value: f64,
        /// Index into `bounds`; equal to `bounds.len()` for the overflow bucket
        bucket: usize,
        bounds: Vec<f64>,
    },
}

/// Trace reference attached to an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exemplar {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

/// One metric recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub kind: MetricKind,
    pub value: MetricValue,
    pub labels: BTreeMap<LabelKey, String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exemplar: Option<Exemplar>,
}

/// Index of the bucket `value` falls into, upper bounds inclusive
pub fn bucket_index(bounds: &[f64], value: f64) -> usize {
    bounds.partition_point(|bound| *bound < value)
}
