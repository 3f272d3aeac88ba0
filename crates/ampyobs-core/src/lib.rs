//! AmpyObs Core - correlation, sampling and the export pipeline
//!
//! This crate provides everything an AmpyFin service needs to emit
//! correlated telemetry without blocking its hot path:
//!
//! - **Context**: trace/span identity plus run, message and order ids
//! - **Propagation**: `traceparent`/`tracestate` bus headers
//! - **Sampling**: parent-based ratio sampling with forced overrides
//! - **Redaction**: rule-based scrubbing before anything leaves the process
//! - **Cardinality**: metric registry and bounded label enforcement
//! - **Pipeline**: bounded buffers and one exporter loop per signal

pub mod buffer;
pub mod cardinality;
pub mod config;
pub mod context;
pub mod export;
pub mod instruments;
pub mod logger;
pub mod meter;
pub mod metrics;
pub mod propagation;
pub mod records;
pub mod redaction;
pub mod resource;
pub mod retry;
pub mod sampler;
pub mod telemetry;
pub mod tracer;
pub mod worker;

// Re-export commonly used types
pub use cardinality::{
    CardinalityGuard, LabelKey, LabelSchema, MetricDescriptor, MetricRegistry, RegistryError,
};
pub use config::{ConfigError, ConfigLoader, TelemetryConfig};
pub use context::{CorrelationContext, SpanId, SpanIdentity, TraceFlags, TraceId};
pub use export::{ExportBatch, ExportError, ExportResult, Exporter, InMemoryExporter};
pub use instruments::DomainInstruments;
pub use logger::Logger;
pub use meter::{Counter, Gauge, Histogram, Meter};
pub use metrics::{CoreMetrics, SharedMetrics};
pub use propagation::{HeaderCarrier, Propagator};
pub use records::{KeyValue, LogEvent, LogLevel, LogRecord, MetricPoint, Signal, SpanKind, SpanRecord, SpanStatus};
pub use redaction::{RedactionRule, Redactor, SharedRedactor};
pub use resource::Resource;
pub use sampler::{OverrideClass, Sampler};
pub use telemetry::{Exporters, InitError, ShutdownReport, Telemetry};
pub use tracer::{ActiveSpan, BusAttrs, Tracer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
