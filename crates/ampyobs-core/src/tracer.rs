//! Spans, including the bus publish/consume pair
//!
//! A span's identity and sampling decision are fixed when it starts; the
//! record is built and pushed to the trace buffer when it ends (explicitly or
//! on drop). Spans whose flags say "don't export" still hand out a valid
//! context so the decision propagates, but nothing is buffered for them.

use crate::buffer::ExportBuffer;
use crate::context::{CorrelationContext, SpanId, SpanIdentity, TraceFlags, TraceId};
use crate::metrics::SharedMetrics;
use crate::propagation::{HeaderCarrier, Propagator};
use crate::records::{keys, KeyValue, Link, Signal, SpanKind, SpanRecord, SpanStatus};
use crate::redaction::SharedRedactor;
use crate::sampler::OverrideClass;
use chrono::{DateTime, Utc};
use std::fmt;

pub const PUBLISH_SPAN_NAME: &str = "bus.publish";
pub const CONSUME_SPAN_NAME: &str = "bus.consume";
const MESSAGING_SYSTEM: &str = "ampy-bus";

/// Message attributes for bus spans
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusAttrs {
    pub topic: String,
    pub schema_fqdn: String,
    pub message_id: String,
    pub partition_key: Option<String>,
    pub run_id: Option<String>,
}

impl BusAttrs {
    pub fn new(topic: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message_id: message_id.into(),
            ..Default::default()
        }
    }

    pub fn with_schema(mut self, schema_fqdn: impl Into<String>) -> Self {
        self.schema_fqdn = schema_fqdn.into();
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    fn attributes(&self) -> Vec<KeyValue> {
        let mut attrs = vec![
            KeyValue::new(keys::MESSAGING_SYSTEM, MESSAGING_SYSTEM),
            KeyValue::new(keys::MESSAGING_DESTINATION, &self.topic),
            KeyValue::new(keys::MESSAGING_MESSAGE_ID, &self.message_id),
        ];
        if !self.schema_fqdn.is_empty() {
            attrs.push(KeyValue::new(keys::SCHEMA_FQDN, &self.schema_fqdn));
        }
        if let Some(key) = &self.partition_key {
            attrs.push(KeyValue::new(keys::PARTITION_KEY, key));
        }
        if let Some(run_id) = &self.run_id {
            attrs.push(KeyValue::new(keys::RUN_ID, run_id));
        }
        attrs
    }

    /// Carry the message identity into the span's context
    fn apply_to(&self, cx: &mut CorrelationContext) {
        if !self.message_id.is_empty() {
            cx.domain.message_id = Some(self.message_id.clone());
        }
        if let Some(run_id) = &self.run_id {
            cx.domain.run_id = Some(run_id.clone());
        }
    }
}

/// Creates spans and moves contexts across bus hops
#[derive(Clone)]
pub struct Tracer {
    propagator: Propagator,
    redactor: SharedRedactor,
    buffer: ExportBuffer<SpanRecord>,
    metrics: SharedMetrics,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("propagator", &self.propagator)
            .finish_non_exhaustive()
    }
}

impl Tracer {
    pub fn new(
        propagator: Propagator,
        redactor: SharedRedactor,
        buffer: ExportBuffer<SpanRecord>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            propagator,
            redactor,
            buffer,
            metrics,
        }
    }

    pub fn propagator(&self) -> &Propagator {
        &self.propagator
    }

    /// Start a child of `parent`, or a new root when `parent` has no identity
    pub fn start_span(
        &self,
        parent: &CorrelationContext,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> ActiveSpan {
        let ids = self.propagator.id_generator();
        let sampler = self.propagator.sampler();
        let span_id = ids.new_span_id();

        let (trace_id, parent_span_id, flags) = match parent.identity() {
            Some(p) => (
                p.trace_id,
                Some(p.span_id),
                sampler.decide(Some(p.flags), p.trace_id, None),
            ),
            None => {
                let trace_id = ids.new_trace_id();
                (trace_id, None, sampler.decide(None, trace_id, None))
            }
        };

        ActiveSpan {
            context: parent.with_span(SpanIdentity {
                trace_id,
                span_id,
                flags,
            }),
            parent_span_id,
            name: name.into(),
            kind,
            start: Utc::now(),
            attributes: Vec::new(),
            links: Vec::new(),
            status: SpanStatus::Unset,
            tracer: self.clone(),
            ended: false,
        }
    }

    /// Producer span for a message about to be published.
    ///
    /// Inject the returned span's context into the outgoing headers.
    pub fn start_publish_span(&self, parent: &CorrelationContext, attrs: &BusAttrs) -> ActiveSpan {
        let mut parent = parent.clone();
        attrs.apply_to(&mut parent);
        let mut span = self.start_span(&parent, PUBLISH_SPAN_NAME, SpanKind::Producer);
        span.attributes.extend(attrs.attributes());
        span
    }

    /// Consumer span continuing the trace found in `headers`, linked to it
    pub fn start_consume_span<C: HeaderCarrier + ?Sized>(
        &self,
        headers: &C,
        attrs: &BusAttrs,
    ) -> ActiveSpan {
        let mut upstream = self.propagator.extract(headers);
        attrs.apply_to(&mut upstream);
        let mut span = self.start_span(&upstream, CONSUME_SPAN_NAME, SpanKind::Consumer);
        if let Some(identity) = upstream.identity() {
            span.links.push(Link {
                trace_id: identity.trace_id,
                span_id: identity.span_id,
            });
        }
        span.attributes.extend(attrs.attributes());
        span
    }

    pub fn inject<C: HeaderCarrier + ?Sized>(
        &self,
        cx: &CorrelationContext,
        headers: &mut C,
    ) -> CorrelationContext {
        self.propagator.inject(cx, headers)
    }

    pub fn extract<C: HeaderCarrier + ?Sized>(&self, headers: &C) -> CorrelationContext {
        self.propagator.extract(headers)
    }

    fn finish(&self, mut record: SpanRecord) {
        if !record.flags.should_export() {
            return;
        }
        let redacted = self
            .redactor
            .current()
            .scrub_pairs(Signal::Traces, &mut record.attributes);
        self.metrics.record_redactions(Signal::Traces, redacted as u64);
        self.buffer.try_push(record);
    }
}

/// A span in progress. Ends on [`ActiveSpan::end`] or when dropped.
pub struct ActiveSpan {
    context: CorrelationContext,
    parent_span_id: Option<SpanId>,
    name: String,
    kind: SpanKind,
    start: DateTime<Utc>,
    attributes: Vec<KeyValue>,
    links: Vec<Link>,
    status: SpanStatus,
    tracer: Tracer,
    ended: bool,
}

impl fmt::Debug for ActiveSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSpan")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ActiveSpan {
    /// Context to pass to children and to inject into headers
    pub fn context(&self) -> &CorrelationContext {
        &self.context
    }

    pub fn identity(&self) -> SpanIdentity {
        // every active span has an identity
        self.context
            .identity()
            .copied()
            .unwrap_or(SpanIdentity {
                trace_id: TraceId::INVALID,
                span_id: SpanId::INVALID,
                flags: TraceFlags::NONE,
            })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this span will be exported when it ends
    pub fn is_recording(&self) -> bool {
        self.identity().flags.should_export() || self.status.is_error()
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        self.attributes.push(KeyValue::new(key, value));
    }

    pub fn add_link(&mut self, cx: &CorrelationContext) {
        if let Some(identity) = cx.identity() {
            self.links.push(Link {
                trace_id: identity.trace_id,
                span_id: identity.span_id,
            });
        }
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        self.status = status;
    }

    /// Mark as failed; failed spans are always exported
    pub fn record_error(&mut self, description: impl Into<String>) {
        self.status = SpanStatus::error(description);
    }

    /// Force export of this span and of children started after this call
    pub fn force(&mut self, class: OverrideClass) {
        if let Some(identity) = self.context.identity().copied() {
            self.context = self.context.with_span(SpanIdentity {
                flags: identity.flags.with_forced(true),
                ..identity
            });
        }
        self.attributes
            .push(KeyValue::new(keys::OVERRIDE, class.as_str()));
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        let identity = self.identity();
        let flags = if self.status.is_error() {
            identity.flags.with_forced(true)
        } else {
            identity.flags
        };

        let record = SpanRecord {
            name: std::mem::take(&mut self.name),
            kind: self.kind,
            trace_id: identity.trace_id,
            span_id: identity.span_id,
            parent_span_id: self.parent_span_id,
            flags,
            start: self.start,
            end: Utc::now(),
            attributes: std::mem::take(&mut self.attributes),
            links: std::mem::take(&mut self.links),
            status: std::mem::take(&mut self.status),
        };
        self.tracer.finish(record);
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.finish();
    }
}
