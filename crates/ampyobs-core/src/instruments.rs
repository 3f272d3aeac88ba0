//! Pre-registered bus and OMS instruments
//!
//! Each recording appends the `service` and `env` labels of the process
//! resource. Topic and broker values must be listed in the label schema
//! (see the `labels` config section); anything else is exported as `other`.

use crate::cardinality::{LabelKey, MetricDescriptor, RegistryError};
use crate::context::CorrelationContext;
use crate::meter::{Counter, Histogram, Meter};
use crate::resource::Resource;
use std::time::Duration;

/// Latency buckets in milliseconds
pub const LATENCY_BUCKETS_MS: [f64; 11] = [
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0,
];

pub const BUS_PRODUCED: &str = "ampy.bus.produced_total";
pub const BUS_CONSUMED: &str = "ampy.bus.consumed_total";
pub const BUS_DELIVERY_LATENCY: &str = "ampy.bus.delivery_latency_ms";
pub const OMS_ORDER_SUBMIT: &str = "ampy.oms.order_submit_total";
pub const OMS_ORDER_LATENCY: &str = "ampy.oms.order_latency_ms";
pub const OMS_REJECTIONS: &str = "ampy.oms.rejections_total";

const COMMON_LABELS: [LabelKey; 2] = [LabelKey::Service, LabelKey::Env];

#[derive(Debug, Clone)]
pub struct DomainInstruments {
    bus_produced: Counter,
    bus_consumed: Counter,
    bus_delivery_latency: Histogram,
    order_submit: Counter,
    order_latency: Histogram,
    rejections: Counter,
    service: String,
    env: String,
}

impl DomainInstruments {
    pub fn register(meter: &Meter, resource: &Resource) -> Result<Self, RegistryError> {
        let with_common = |descriptor: MetricDescriptor, keys: &[LabelKey]| {
            descriptor
                .with_labels(keys.iter().copied())
                .with_labels(COMMON_LABELS)
        };

        Ok(Self {
            bus_produced: meter.counter(with_common(
                MetricDescriptor::counter(BUS_PRODUCED, "Messages published to the bus"),
                &[LabelKey::Topic],
            ))?,
            bus_consumed: meter.counter(with_common(
                MetricDescriptor::counter(BUS_CONSUMED, "Messages consumed from the bus"),
                &[LabelKey::Topic],
            ))?,
            bus_delivery_latency: meter.histogram(with_common(
                MetricDescriptor::histogram(
                    BUS_DELIVERY_LATENCY,
                    "Publish to consume latency",
                    LATENCY_BUCKETS_MS,
                )
                .with_unit("ms"),
                &[LabelKey::Topic],
            ))?,
            order_submit: meter.counter(with_common(
                MetricDescriptor::counter(OMS_ORDER_SUBMIT, "Orders submitted to a broker"),
                &[LabelKey::Broker, LabelKey::Outcome],
            ))?,
            order_latency: meter.histogram(with_common(
                MetricDescriptor::histogram(
                    OMS_ORDER_LATENCY,
                    "Submit to broker ack latency",
                    LATENCY_BUCKETS_MS,
                )
                .with_unit("ms"),
                &[LabelKey::Broker],
            ))?,
            rejections: meter.counter(with_common(
                MetricDescriptor::counter(OMS_REJECTIONS, "Orders rejected"),
                &[LabelKey::Broker, LabelKey::Reason],
            ))?,
            service: resource.service_name.clone(),
            env: resource.environment.clone(),
        })
    }

    pub fn bus_produced(&self, cx: &CorrelationContext, topic: &str) {
        self.bus_produced.add(cx, 1, &self.labels(&[("topic", topic)]));
    }

    pub fn bus_consumed(&self, cx: &CorrelationContext, topic: &str) {
        self.bus_consumed.add(cx, 1, &self.labels(&[("topic", topic)]));
    }

    pub fn bus_delivery_latency(&self, cx: &CorrelationContext, topic: &str, latency: Duration) {
        self.bus_delivery_latency
            .record(cx, millis(latency), &self.labels(&[("topic", topic)]));
    }

    pub fn order_submitted(&self, cx: &CorrelationContext, broker: &str, outcome: &str) {
        self.order_submit.add(
            cx,
            1,
            &self.labels(&[("broker", broker), ("outcome", outcome)]),
        );
    }

    pub fn order_latency(&self, cx: &CorrelationContext, broker: &str, latency: Duration) {
        self.order_latency
            .record(cx, millis(latency), &self.labels(&[("broker", broker)]));
    }

    pub fn order_rejected(&self, cx: &CorrelationContext, broker: &str, reason: &str) {
        self.rejections.add(
            cx,
            1,
            &self.labels(&[("broker", broker), ("reason", reason)]),
        );
    }

    fn labels<'a>(&'a self, specific: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut labels = Vec::with_capacity(specific.len() + 2);
        labels.extend_from_slice(specific);
        labels.push(("service", self.service.as_str()));
        labels.push(("env", self.env.as_str()));
        labels
    }
}

fn millis(latency: Duration) -> f64 {
    latency.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::export_buffer;
    use crate::cardinality::{CardinalityGuard, LabelSchema, OTHER_VALUE};
    use crate::metrics::create_metrics;
    use crate::records::{MetricValue, Signal};
    use crate::redaction::SharedRedactor;

    #[test]
    fn test_register_and_record() {
        let metrics = create_metrics();
        let (buffer, mut rx) = export_buffer(Signal::Metrics, 64, metrics.clone());
        let mut schema = LabelSchema::default();
        schema.allow(LabelKey::Service, ["ampy-oms"]);
        schema.allow(LabelKey::Topic, ["ampy/prod/orders/v1"]);
        schema.allow(LabelKey::Broker, ["alpaca"]);
        let meter = Meter::new(
            CardinalityGuard::new(schema, metrics.clone()),
            SharedRedactor::default(),
            buffer,
            metrics.clone(),
        );
        let instruments =
            DomainInstruments::register(&meter, &Resource::new("ampy-oms", "prod")).unwrap();
        assert_eq!(meter.registry().len(), 6);

        let cx = CorrelationContext::new();
        instruments.bus_produced(&cx, "ampy/prod/orders/v1");
        instruments.order_submitted(&cx, "alpaca", "ok");
        instruments.order_rejected(&cx, "ibkr", "risk_limit");
        instruments.order_latency(&cx, "alpaca", Duration::from_millis(7));

        let points = rx.drain_now(10);
        assert_eq!(points.len(), 4);
        assert_eq!(points[0].name, BUS_PRODUCED);
        assert_eq!(points[0].labels[&LabelKey::Service], "ampy-oms");
        assert_eq!(points[0].labels[&LabelKey::Env], "prod");
        assert_eq!(points[1].labels[&LabelKey::Outcome], "ok");
        assert_eq!(points[2].labels[&LabelKey::Broker], OTHER_VALUE);
        assert_eq!(points[2].labels[&LabelKey::Reason], "risk_limit");
        assert!(matches!(
            points[3].value,
            MetricValue::Histogram { bucket: 3, .. }
        ));
        assert_eq!(metrics.label_violations(OMS_REJECTIONS), 1);
        assert_eq!(metrics.label_violations(BUS_PRODUCED), 0);
    }

    #[test]
    fn test_register_twice_fails() {
        let metrics = create_metrics();
        let (buffer, _rx) = export_buffer(Signal::Metrics, 4, metrics.clone());
        let meter = Meter::new(
            CardinalityGuard::new(LabelSchema::default(), metrics.clone()),
            SharedRedactor::default(),
            buffer,
            metrics,
        );
        let resource = Resource::new("svc", "dev");
        DomainInstruments::register(&meter, &resource).unwrap();
        assert_eq!(
            DomainInstruments::register(&meter, &resource).unwrap_err(),
            RegistryError::Duplicate(BUS_PRODUCED.to_string())
        );
    }
}
