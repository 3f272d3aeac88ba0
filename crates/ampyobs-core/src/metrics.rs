//! Self-metrics of the telemetry pipelines
//!
//! Counters the pipelines keep about themselves: drops, exports, failures,
//! redactions, label violations and buffer occupancy.

use crate::export::FailureReason;
use crate::records::Signal;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Self-metrics shared by every pipeline
#[derive(Debug)]
pub struct CoreMetrics {
    /// When the pipelines were started
    start_time: Instant,
    signals: [SignalMetrics; 3],
    /// Metric name -> label violations
    label_violations: parking_lot::RwLock<HashMap<String, AtomicU64>>,
}

/// Shared handle to the self-metrics
pub type SharedMetrics = Arc<CoreMetrics>;

/// Create a new shared collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(CoreMetrics::new())
}

/// Per-signal pipeline counters
#[derive(Debug, Default)]
pub struct SignalMetrics {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub exported: AtomicU64,
    pub batches_sent: AtomicU64,
    pub redactions: AtomicU64,
    pub capacity: AtomicU64,
    occupancy: OccupancySource,
    export_failures: [AtomicU64; FailureReason::COUNT],
}

type OccupancyFn = Box<dyn Fn() -> usize + Send + Sync>;

/// Reads the queue length from the buffer itself on every call
#[derive(Default)]
struct OccupancySource(parking_lot::RwLock<Option<OccupancyFn>>);

impl fmt::Debug for OccupancySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OccupancySource")
            .field(&self.0.read().is_some())
            .finish()
    }
}

impl SignalMetrics {
    /// Records currently queued; 0 until a buffer is attached
    pub fn occupancy(&self) -> u64 {
        self.occupancy.0.read().as_ref().map_or(0, |read| read() as u64)
    }

    pub fn export_failures(&self, reason: FailureReason) -> u64 {
        self.export_failures[reason.index()].load(Ordering::Relaxed)
    }

    pub fn total_export_failures(&self) -> u64 {
        self.export_failures
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

/// Point-in-time copy of one signal's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub exported: u64,
    pub batches_sent: u64,
    pub redactions: u64,
    pub occupancy: u64,
    pub capacity: u64,
    pub export_failures: BTreeMap<FailureReason, u64>,
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            signals: Default::default(),
            label_violations: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn signal(&self, signal: Signal) -> &SignalMetrics {
        &self.signals[signal.index()]
    }

    pub fn record_enqueued(&self, signal: Signal) {
        self.signal(signal).enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `n` dropped records, returning the total before this call
    pub fn record_dropped(&self, signal: Signal, n: u64) -> u64 {
        self.signal(signal).dropped.fetch_add(n, Ordering::Relaxed)
    }

    pub fn record_exported(&self, signal: Signal, records: u64) {
        let metrics = self.signal(signal);
        metrics.exported.fetch_add(records, Ordering::Relaxed);
        metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_export_failure(&self, signal: Signal, reason: FailureReason) {
        self.signal(signal).export_failures[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redactions(&self, signal: Signal, n: u64) {
        if n > 0 {
            self.signal(signal).redactions.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Attach the function that reports how many records `signal` has queued
    pub fn set_occupancy_source(
        &self,
        signal: Signal,
        source: impl Fn() -> usize + Send + Sync + 'static,
    ) {
        *self.signal(signal).occupancy.0.write() = Some(Box::new(source));
    }

    pub fn set_capacity(&self, signal: Signal, capacity: usize) {
        self.signal(signal)
            .capacity
            .store(capacity as u64, Ordering::Relaxed);
    }

    pub fn dropped(&self, signal: Signal) -> u64 {
        self.signal(signal).dropped.load(Ordering::Relaxed)
    }

    pub fn exported(&self, signal: Signal) -> u64 {
        self.signal(signal).exported.load(Ordering::Relaxed)
    }

    pub fn occupancy(&self, signal: Signal) -> u64 {
        self.signal(signal).occupancy()
    }

    pub fn redactions(&self, signal: Signal) -> u64 {
        self.signal(signal).redactions.load(Ordering::Relaxed)
    }

    pub fn export_failures(&self, signal: Signal, reason: FailureReason) -> u64 {
        self.signal(signal).export_failures(reason)
    }

    pub fn record_label_violations(&self, metric: &str, n: u64) {
        {
            let violations = self.label_violations.read();
            if let Some(counter) = violations.get(metric) {
                counter.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }
        self.label_violations
            .write()
            .entry(metric.to_string())
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn label_violations(&self, metric: &str) -> u64 {
        self.label_violations
            .read()
            .get(metric)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Label violations for every metric that had any, ordered by name
    pub fn all_label_violations(&self) -> BTreeMap<String, u64> {
        self.label_violations
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn snapshot(&self, signal: Signal) -> SignalSnapshot {
        let m = self.signal(signal);
        SignalSnapshot {
            enqueued: m.enqueued.load(Ordering::Relaxed),
            dropped: m.dropped.load(Ordering::Relaxed),
            exported: m.exported.load(Ordering::Relaxed),
            batches_sent: m.batches_sent.load(Ordering::Relaxed),
            redactions: m.redactions.load(Ordering::Relaxed),
            occupancy: m.occupancy(),
            capacity: m.capacity.load(Ordering::Relaxed),
            export_failures: FailureReason::ALL
                .into_iter()
                .map(|reason| (reason, m.export_failures(reason)))
                .filter(|(_, n)| *n > 0)
                .collect(),
        }
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP ampyobs_uptime_seconds Time since telemetry was initialized\n");
        output.push_str("# TYPE ampyobs_uptime_seconds gauge\n");
        output.push_str(&format!(
            "ampyobs_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        let per_signal: [(&str, &str, &str, fn(&SignalSnapshot) -> u64); 6] = [
            (
                "ampyobs_enqueued_total",
                "counter",
                "Records accepted into an export buffer",
                |s| s.enqueued,
            ),
            (
                "ampyobs_dropped_total",
                "counter",
                "Records dropped on a full buffer or at shutdown",
                |s| s.dropped,
            ),
            (
                "ampyobs_exported_total",
                "counter",
                "Records acknowledged by the collector",
                |s| s.exported,
            ),
            (
                "ampyobs_redactions_total",
                "counter",
                "Values replaced by the redactor",
                |s| s.redactions,
            ),
            (
                "ampyobs_buffer_occupancy",
                "gauge",
                "Records currently queued",
                |s| s.occupancy,
            ),
            (
                "ampyobs_buffer_capacity",
                "gauge",
                "Export buffer capacity",
                |s| s.capacity,
            ),
        ];

        let snapshots: Vec<(Signal, SignalSnapshot)> = Signal::ALL
            .into_iter()
            .map(|signal| (signal, self.snapshot(signal)))
            .collect();

        for (name, kind, help, value) in per_signal {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} {}\n", name, kind));
            for (signal, snapshot) in &snapshots {
                output.push_str(&format!(
                    "{}{{signal=\"{}\"}} {}\n",
                    name,
                    signal,
                    value(snapshot)
                ));
            }
            output.push('\n');
        }

        output.push_str("# HELP ampyobs_export_fail_total Batches dropped after failed export\n");
        output.push_str("# TYPE ampyobs_export_fail_total counter\n");
        for (signal, snapshot) in &snapshots {
            for (reason, count) in &snapshot.export_failures {
                output.push_str(&format!(
                    "ampyobs_export_fail_total{{signal=\"{}\",reason=\"{}\"}} {}\n",
                    signal,
                    reason.as_str(),
                    count
                ));
            }
        }
        output.push('\n');

        let violations = self.all_label_violations();
        if !violations.is_empty() {
            output.push_str(
                "# HELP ampyobs_label_violations_total Labels dropped or replaced by the cardinality guard\n",
            );
            output.push_str("# TYPE ampyobs_label_violations_total counter\n");
            for (metric, count) in violations {
                output.push_str(&format!(
                    "ampyobs_label_violations_total{{metric=\"{}\"}} {}\n",
                    metric, count
                ));
            }
            output.push('\n');
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let signals: serde_json::Map<String, serde_json::Value> = Signal::ALL
            .into_iter()
            .map(|signal| {
                let s = self.snapshot(signal);
                let failures: serde_json::Map<String, serde_json::Value> = s
                    .export_failures
                    .iter()
                    .map(|(reason, n)| (reason.as_str().to_string(), (*n).into()))
                    .collect();
                (
                    signal.as_str().to_string(),
                    serde_json::json!({
                        "enqueued": s.enqueued,
                        "dropped": s.dropped,
                        "exported": s.exported,
                        "batches_sent": s.batches_sent,
                        "redactions": s.redactions,
                        "buffer_occupancy": s.occupancy,
                        "buffer_capacity": s.capacity,
                        "export_failures": failures,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "signals": signals,
            "label_violations": self.all_label_violations(),
        })
    }
}
