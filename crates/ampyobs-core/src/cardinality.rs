//! Metric registry and label cardinality guard
//!
//! Every metric is registered once, up front, with the label keys it may
//! carry. Each label key has a bounded set of values. Recording never fails:
//! labels outside the contract are dropped or collapsed to [`OTHER_VALUE`]
//! and the violation is counted.

use crate::metrics::SharedMetrics;
use crate::records::MetricKind;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::debug;

/// Replacement for label values outside the allow-list
pub const OTHER_VALUE: &str = "other";

/// Outcome label values
pub mod outcome {
    pub const OK: &str = "ok";
    pub const RETRY: &str = "retry";
    pub const DLQ: &str = "dlq";
    pub const REJECT: &str = "reject";
}

static METRIC_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z0-9_]+)+$").expect("metric name pattern"));

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Metric already registered: {0}")]
    Duplicate(String),

    #[error("Invalid metric name {0:?}: expected dotted lowercase segments")]
    InvalidName(String),

    #[error("Invalid buckets for {name}: {reason}")]
    InvalidBuckets { name: String, reason: String },

    #[error("Unknown label key: {0}")]
    UnknownLabelKey(String),

    #[error("Metric {name} is not a {expected}")]
    KindMismatch { name: String, expected: &'static str },
}

/// The bounded set of metric label keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKey {
    Domain,
    Outcome,
    Reason,
    Topic,
    Broker,
    Service,
    Env,
    Signal,
}

impl LabelKey {
    pub const ALL: [LabelKey; 8] = [
        LabelKey::Domain,
        LabelKey::Outcome,
        LabelKey::Reason,
        LabelKey::Topic,
        LabelKey::Broker,
        LabelKey::Service,
        LabelKey::Env,
        LabelKey::Signal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LabelKey::Domain => "domain",
            LabelKey::Outcome => "outcome",
            LabelKey::Reason => "reason",
            LabelKey::Topic => "topic",
            LabelKey::Broker => "broker",
            LabelKey::Service => "service",
            LabelKey::Env => "env",
            LabelKey::Signal => "signal",
        }
    }
}

impl fmt::Display for LabelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LabelKey {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LabelKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownLabelKey(s.to_string()))
    }
}

/// Allowed values per label key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSchema {
    values: HashMap<LabelKey, BTreeSet<String>>,
}

impl Default for LabelSchema {
    fn default() -> Self {
        let mut schema = Self {
            values: HashMap::new(),
        };
        schema.allow(
            LabelKey::Domain,
            ["bus", "oms", "signals", "ingest", "risk", "ampyobs"],
        );
        schema.allow(
            LabelKey::Outcome,
            [outcome::OK, outcome::RETRY, outcome::DLQ, outcome::REJECT],
        );
        schema.allow(
            LabelKey::Reason,
            [
                "transport",
                "endpoint",
                "timeout",
                "encoding",
                "io",
                "shutdown",
                "rejected",
                "risk_limit",
                "insufficient_funds",
                "invalid_order",
                "broker_error",
                "unknown",
            ],
        );
        schema.allow(LabelKey::Signal, ["logs", "metrics", "traces"]);
        schema.allow(LabelKey::Env, ["dev", "paper", "prod"]);
        schema
    }
}

impl LabelSchema {
    /// Schema with no allowed values at all
    pub fn empty() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Defaults extended with configured values, keyed by label name
    pub fn from_config(extra: &BTreeMap<String, Vec<String>>) -> Result<Self, RegistryError> {
        let mut schema = Self::default();
        for (key, values) in extra {
            let key: LabelKey = key.parse()?;
            schema.allow(key, values.iter().map(String::as_str));
        }
        Ok(schema)
    }

    pub fn allow<'a, I>(&mut self, key: LabelKey, values: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.values
            .entry(key)
            .or_default()
            .extend(values.into_iter().map(str::to_string));
    }

    pub fn is_allowed(&self, key: LabelKey, value: &str) -> bool {
        value == OTHER_VALUE || self.values.get(&key).is_some_and(|set| set.contains(value))
    }

    pub fn values(&self, key: LabelKey) -> impl Iterator<Item = &str> {
        self.values
            .get(&key)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }
}

/// Registration record for one metric name
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub name: String,
    pub kind: MetricKind,
    pub description: String,
    pub unit: Option<String>,
    pub label_keys: Vec<LabelKey>,
    /// Histogram upper bounds, strictly increasing
    pub buckets: Vec<f64>,
}

impl MetricDescriptor {
    fn new(name: impl Into<String>, kind: MetricKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            unit: None,
            label_keys: Vec::new(),
            buckets: Vec::new(),
        }
    }

    pub fn counter(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Counter, description)
    }

    pub fn gauge(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Gauge, description)
    }

    pub fn histogram(
        name: impl Into<String>,
        description: impl Into<String>,
        buckets: impl Into<Vec<f64>>,
    ) -> Self {
        let mut descriptor = Self::new(name, MetricKind::Histogram, description);
        descriptor.buckets = buckets.into();
        descriptor
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_labels(mut self, keys: impl IntoIterator<Item = LabelKey>) -> Self {
        for key in keys {
            if !self.label_keys.contains(&key) {
                self.label_keys.push(key);
            }
        }
        self
    }

    pub fn allows(&self, key: LabelKey) -> bool {
        self.label_keys.contains(&key)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if !METRIC_NAME.is_match(&self.name) {
            return Err(RegistryError::InvalidName(self.name.clone()));
        }

        let invalid = |reason: &str| RegistryError::InvalidBuckets {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        match self.kind {
            MetricKind::Histogram => {
                if self.buckets.is_empty() {
                    return Err(invalid("histogram requires at least one bucket"));
                }
                if self.buckets.iter().any(|b| !b.is_finite()) {
                    return Err(invalid("bucket bounds must be finite"));
                }
                if self.buckets.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(invalid("bucket bounds must be strictly increasing"));
                }
            }
            _ if !self.buckets.is_empty() => {
                return Err(invalid("only histograms take buckets"));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Registered metrics by name
#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: RwLock<HashMap<String, Arc<MetricDescriptor>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a descriptor
    pub fn register(
        &self,
        descriptor: MetricDescriptor,
    ) -> Result<Arc<MetricDescriptor>, RegistryError> {
        descriptor.validate()?;

        let mut metrics = self.metrics.write();
        if metrics.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        debug!(
            name = %descriptor.name,
            kind = descriptor.kind.as_str(),
            labels = descriptor.label_keys.len(),
            "Registered metric"
        );
        let descriptor = Arc::new(descriptor);
        metrics.insert(descriptor.name.clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    pub fn get(&self, name: &str) -> Option<Arc<MetricDescriptor>> {
        self.metrics.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    /// All descriptors ordered by name
    pub fn descriptors(&self) -> Vec<Arc<MetricDescriptor>> {
        let mut all: Vec<_> = self.metrics.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

/// Enforces a [`LabelSchema`] at record time
#[derive(Debug, Clone)]
pub struct CardinalityGuard {
    schema: Arc<LabelSchema>,
    metrics: SharedMetrics,
}

impl CardinalityGuard {
    pub fn new(schema: LabelSchema, metrics: SharedMetrics) -> Self {
        Self {
            schema: Arc::new(schema),
            metrics,
        }
    }

    pub fn schema(&self) -> &LabelSchema {
        &self.schema
    }

    /// Reduce raw labels to the bounded set allowed for `descriptor`.
    ///
    /// Unknown keys, keys the metric does not declare and repeated keys are
    /// dropped. Values outside the key's enumeration become [`OTHER_VALUE`].
    pub fn sanitize(
        &self,
        descriptor: &MetricDescriptor,
        labels: &[(&str, &str)],
    ) -> BTreeMap<LabelKey, String> {
        let mut out = BTreeMap::new();
        let mut violations = 0u64;

        for (raw_key, value) in labels {
            let key = match raw_key.parse::<LabelKey>() {
                Ok(key) if descriptor.allows(key) => key,
                _ => {
                    violations += 1;
                    continue;
                }
            };
            if out.contains_key(&key) {
                violations += 1;
                continue;
            }
            let value = if self.schema.is_allowed(key, value) {
                (*value).to_string()
            } else {
                violations += 1;
                OTHER_VALUE.to_string()
            };
            out.insert(key, value);
        }

        if violations > 0 {
            self.metrics
                .record_label_violations(&descriptor.name, violations);
        }
        out
    }
}
