//! Structured logs correlated with the active context
//!
//! Logs are not sampled: every record at or above the threshold is buffered,
//! carrying the trace/span id whenever the passed context has one.

use crate::buffer::ExportBuffer;
use crate::context::CorrelationContext;
use crate::metrics::SharedMetrics;
use crate::records::{KeyValue, LogEvent, LogLevel, LogRecord, Signal};
use crate::redaction::SharedRedactor;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Logger {
    min_level: LogLevel,
    static_fields: Arc<[KeyValue]>,
    redactor: SharedRedactor,
    buffer: ExportBuffer<LogRecord>,
    metrics: SharedMetrics,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("min_level", &self.min_level)
            .field("static_fields", &self.static_fields.len())
            .finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(
        min_level: LogLevel,
        redactor: SharedRedactor,
        buffer: ExportBuffer<LogRecord>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            min_level,
            static_fields: Arc::from(Vec::new()),
            redactor,
            buffer,
            metrics,
        }
    }

    /// A logger that adds `fields` to every record
    pub fn with(&self, fields: impl IntoIterator<Item = KeyValue>) -> Logger {
        let mut all = self.static_fields.to_vec();
        all.extend(fields);
        Logger {
            static_fields: Arc::from(all),
            ..self.clone()
        }
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    pub fn log(
        &self,
        cx: &CorrelationContext,
        level: LogLevel,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = KeyValue>,
    ) {
        self.emit(cx, level, None, message.into(), fields);
    }

    /// Log with a bounded event tag
    pub fn event(
        &self,
        cx: &CorrelationContext,
        level: LogLevel,
        event: LogEvent,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = KeyValue>,
    ) {
        self.emit(cx, level, Some(event), message.into(), fields);
    }

    pub fn debug(
        &self,
        cx: &CorrelationContext,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = KeyValue>,
    ) {
        self.log(cx, LogLevel::Debug, message, fields);
    }

    pub fn info(
        &self,
        cx: &CorrelationContext,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = KeyValue>,
    ) {
        self.log(cx, LogLevel::Info, message, fields);
    }

    pub fn warn(
        &self,
        cx: &CorrelationContext,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = KeyValue>,
    ) {
        self.log(cx, LogLevel::Warn, message, fields);
    }

    pub fn error(
        &self,
        cx: &CorrelationContext,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = KeyValue>,
    ) {
        self.log(cx, LogLevel::Error, message, fields);
    }

    pub fn fatal(
        &self,
        cx: &CorrelationContext,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = KeyValue>,
    ) {
        self.log(cx, LogLevel::Fatal, message, fields);
    }

    fn emit(
        &self,
        cx: &CorrelationContext,
        level: LogLevel,
        event: Option<LogEvent>,
        message: String,
        fields: impl IntoIterator<Item = KeyValue>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let mut fields: Vec<KeyValue> = self
            .static_fields
            .iter()
            .cloned()
            .chain(fields)
            .collect();
        let redacted = self
            .redactor
            .current()
            .scrub_pairs(Signal::Logs, &mut fields);
        if redacted > 0 {
            self.metrics.record_redactions(Signal::Logs, redacted as u64);
        }

        self.buffer.try_push(LogRecord {
            timestamp: Utc::now(),
            level,
            message,
            event,
            trace_id: cx.trace_id(),
            span_id: cx.span_id(),
            domain: cx.domain.clone(),
            fields,
        });
    }
}
