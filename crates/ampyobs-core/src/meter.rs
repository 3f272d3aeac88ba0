//! Metric instruments
//!
//! Every instrument is registered up front; recording goes through the
//! cardinality guard and the redactor, then into the metrics buffer. A
//! recording never fails from the caller's point of view.

use crate::buffer::ExportBuffer;
use crate::cardinality::{CardinalityGuard, MetricDescriptor, MetricRegistry, RegistryError};
use crate::context::CorrelationContext;
use crate::metrics::SharedMetrics;
use crate::records::{bucket_index, Exemplar, MetricKind, MetricPoint, MetricValue, Signal};
use crate::redaction::SharedRedactor;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;

struct MeterInner {
    registry: MetricRegistry,
    guard: CardinalityGuard,
    redactor: SharedRedactor,
    buffer: ExportBuffer<MetricPoint>,
    metrics: SharedMetrics,
}

/// Registers instruments and records their points
#[derive(Clone)]
pub struct Meter {
    inner: Arc<MeterInner>,
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter")
            .field("registered", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl Meter {
    pub fn new(
        guard: CardinalityGuard,
        redactor: SharedRedactor,
        buffer: ExportBuffer<MetricPoint>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(MeterInner {
                registry: MetricRegistry::new(),
                guard,
                redactor,
                buffer,
                metrics,
            }),
        }
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.inner.registry
    }

    pub fn guard(&self) -> &CardinalityGuard {
        &self.inner.guard
    }

    pub fn counter(&self, descriptor: MetricDescriptor) -> Result<Counter, RegistryError> {
        Ok(Counter {
            descriptor: self.register_kind(descriptor, MetricKind::Counter)?,
            meter: self.clone(),
        })
    }

    pub fn gauge(&self, descriptor: MetricDescriptor) -> Result<Gauge, RegistryError> {
        Ok(Gauge {
            descriptor: self.register_kind(descriptor, MetricKind::Gauge)?,
            meter: self.clone(),
        })
    }

    pub fn histogram(&self, descriptor: MetricDescriptor) -> Result<Histogram, RegistryError> {
        Ok(Histogram {
            descriptor: self.register_kind(descriptor, MetricKind::Histogram)?,
            meter: self.clone(),
        })
    }

    fn register_kind(
        &self,
        descriptor: MetricDescriptor,
        kind: MetricKind,
    ) -> Result<Arc<MetricDescriptor>, RegistryError> {
        if descriptor.kind != kind {
            return Err(RegistryError::KindMismatch {
                name: descriptor.name,
                expected: kind.as_str(),
            });
        }
        self.inner.registry.register(descriptor)
    }

    fn record(
        &self,
        descriptor: &MetricDescriptor,
        cx: &CorrelationContext,
        value: MetricValue,
        labels: &[(&str, &str)],
    ) {
        let inner = &self.inner;
        let mut labels = inner.guard.sanitize(descriptor, labels);

        let redactor = inner.redactor.current();
        let mut redacted = 0u64;
        for (key, value) in labels.iter_mut() {
            let (scrubbed, hit) = redactor.scrub(Signal::Metrics, key.as_str(), value.as_str());
            if hit {
                let replacement = scrubbed.into_owned();
                *value = replacement;
                redacted += 1;
            }
        }
        if redacted > 0 {
            inner.metrics.record_redactions(Signal::Metrics, redacted);
        }

        let exemplar = match (descriptor.kind, cx.identity()) {
            (MetricKind::Histogram, Some(identity)) if identity.flags.should_export() => {
                Some(Exemplar {
                    trace_id: identity.trace_id,
                    span_id: identity.span_id,
                })
            }
            _ => None,
        };

        inner.buffer.try_push(MetricPoint {
            name: descriptor.name.clone(),
            kind: descriptor.kind,
            value,
            labels,
            timestamp: Utc::now(),
            exemplar,
        });
    }
}

/// Monotonic counter
#[derive(Clone)]
pub struct Counter {
    descriptor: Arc<MetricDescriptor>,
    meter: Meter,
}

impl Counter {
    pub fn add(&self, cx: &CorrelationContext, increment: u64, labels: &[(&str, &str)]) {
        self.meter
            .record(&self.descriptor, cx, MetricValue::Counter { increment }, labels);
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.descriptor.name).finish()
    }
}

/// Last-value gauge
#[derive(Clone)]
pub struct Gauge {
    descriptor: Arc<MetricDescriptor>,
    meter: Meter,
}

impl Gauge {
    pub fn set(&self, cx: &CorrelationContext, value: f64, labels: &[(&str, &str)]) {
        self.meter
            .record(&self.descriptor, cx, MetricValue::Gauge { value }, labels);
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gauge").field(&self.descriptor.name).finish()
    }
}

/// Histogram with fixed bucket bounds; one point per observation
#[derive(Clone)]
pub struct Histogram {
    descriptor: Arc<MetricDescriptor>,
    meter: Meter,
}

impl Histogram {
    pub fn record(&self, cx: &CorrelationContext, value: f64, labels: &[(&str, &str)]) {
        let bounds = &self.descriptor.buckets;
        let observation = MetricValue::Histogram {
            value,
            bucket: bucket_index(bounds, value),
            bounds: bounds.clone(),
        };
        self.meter.record(&self.descriptor, cx, observation, labels);
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Histogram").field(&self.descriptor.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{export_buffer, BufferReceiver};
    use crate::cardinality::{LabelKey, LabelSchema, OTHER_VALUE};
    use crate::context::{SpanId, TraceFlags, TraceId};
    use crate::metrics::create_metrics;
    use crate::redaction::{RedactionRule, Redactor};

    fn meter() -> (Meter, BufferReceiver<MetricPoint>, SharedMetrics) {
        let metrics = create_metrics();
        let (buffer, rx) = export_buffer(Signal::Metrics, 64, metrics.clone());
        let meter = Meter::new(
            CardinalityGuard::new(LabelSchema::default(), metrics.clone()),
            SharedRedactor::new(Redactor::with_defaults()),
            buffer,
            metrics.clone(),
        );
        (meter, rx, metrics)
    }

    fn sampled_cx() -> CorrelationContext {
        CorrelationContext::with_identity(
            TraceId::from_u128(7),
            SpanId::from_u64(9),
            TraceFlags::SAMPLED,
        )
    }

    #[test]
    fn test_extra_label_is_dropped_and_counted() {
        let (meter, mut rx, metrics) = meter();
        let counter = meter
            .counter(
                MetricDescriptor::counter("ampy.oms.order_submit_total", "Orders submitted")
                    .with_labels([LabelKey::Domain, LabelKey::Outcome]),
            )
            .unwrap();

        counter.add(
            &CorrelationContext::new(),
            1,
            &[
                ("domain", "oms"),
                ("outcome", "ok"),
                ("client_order_id", "co_123"),
            ],
        );

        let points = rx.drain_now(10);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].labels.len(), 2);
        assert_eq!(points[0].labels[&LabelKey::Outcome], "ok");
        assert_eq!(points[0].value, MetricValue::Counter { increment: 1 });
        assert_eq!(metrics.label_violations("ampy.oms.order_submit_total"), 1);
    }

    #[test]
    fn test_unlisted_value_becomes_other() {
        let (meter, mut rx, metrics) = meter();
        let gauge = meter
            .gauge(MetricDescriptor::gauge("ampy.risk.exposure", "").with_labels([LabelKey::Env]))
            .unwrap();
        gauge.set(&CorrelationContext::new(), 1.5, &[("env", "staging-42")]);

        let points = rx.drain_now(10);
        assert_eq!(points[0].labels[&LabelKey::Env], OTHER_VALUE);
        assert_eq!(metrics.label_violations("ampy.risk.exposure"), 1);
    }

    #[test]
    fn test_histogram_bucket_and_exemplar() {
        let (meter, mut rx, _) = meter();
        let histogram = meter
            .histogram(MetricDescriptor::histogram(
                "ampy.bus.delivery_latency_ms",
                "",
                vec![1.0, 5.0, 10.0],
            ))
            .unwrap();

        histogram.record(&sampled_cx(), 4.0, &[]);
        histogram.record(&CorrelationContext::new(), 40.0, &[]);
        let unsampled = CorrelationContext::with_identity(
            TraceId::from_u128(8),
            SpanId::from_u64(9),
            TraceFlags::NONE,
        );
        histogram.record(&unsampled, 0.5, &[]);

        let points = rx.drain_now(10);
        match &points[0].value {
            MetricValue::Histogram { bucket, bounds, .. } => {
                assert_eq!(*bucket, 1);
                assert_eq!(bounds, &vec![1.0, 5.0, 10.0]);
            }
            other => panic!("unexpected value {:?}", other),
        }
        assert_eq!(
            points[0].exemplar,
            Some(Exemplar {
                trace_id: TraceId::from_u128(7),
                span_id: SpanId::from_u64(9),
            })
        );
        assert!(matches!(points[1].value, MetricValue::Histogram { bucket: 3, .. }));
        assert_eq!(points[1].exemplar, None);
        assert_eq!(points[2].exemplar, None);
    }

    #[test]
    fn test_counters_never_carry_exemplars() {
        let (meter, mut rx, _) = meter();
        let counter = meter
            .counter(MetricDescriptor::counter("ampy.bus.produced_total", ""))
            .unwrap();
        counter.add(&sampled_cx(), 3, &[]);
        assert_eq!(rx.drain_now(10)[0].exemplar, None);
    }

    #[test]
    fn test_kind_mismatch() {
        let (meter, _rx, _) = meter();
        let err = meter
            .counter(MetricDescriptor::gauge("ampy.oms.open_orders", ""))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::KindMismatch {
                name: "ampy.oms.open_orders".to_string(),
                expected: "counter",
            }
        );
        assert!(meter.registry().is_empty());
    }

    #[test]
    fn test_label_values_are_redacted() {
        let metrics = create_metrics();
        let (buffer, mut rx) = export_buffer(Signal::Metrics, 8, metrics.clone());
        let mut schema = LabelSchema::default();
        schema.allow(LabelKey::Topic, ["sk-abcdefghijklmnopqrstuvwx"]);
        let redactor = Redactor::with_custom_rules(
            &[RedactionRule::value("^sk-").scoped(crate::redaction::RuleScope::Metrics)],
            "[REDACTED]",
        )
        .unwrap();
        let meter = Meter::new(
            CardinalityGuard::new(schema, metrics.clone()),
            SharedRedactor::new(redactor),
            buffer,
            metrics.clone(),
        );
        let counter = meter
            .counter(
                MetricDescriptor::counter("ampy.bus.produced_total", "")
                    .with_labels([LabelKey::Topic]),
            )
            .unwrap();
        counter.add(
            &CorrelationContext::new(),
            1,
            &[("topic", "sk-abcdefghijklmnopqrstuvwx")],
        );

        let points = rx.drain_now(10);
        assert_eq!(points[0].labels[&LabelKey::Topic], "[REDACTED]");
        assert_eq!(metrics.redactions(Signal::Metrics), 1);
    }
}
