//! Process-wide telemetry handle
//!
//! [`Telemetry::init`] wires the three pipelines (buffer + exporter loop per
//! signal) behind a tracer, a logger and a meter. [`Telemetry::shutdown`]
//! runs the forced flush, waits for every loop to stop (aborting any that
//! overrun the deadline) and then shuts each distinct exporter down once.
//!
//! Dropping the handle without calling `shutdown` also stops the loops, with
//! the default flush deadline, but nothing waits for them.

use crate::buffer::export_buffer;
use crate::cardinality::{
    CardinalityGuard, LabelKey, LabelSchema, MetricDescriptor, RegistryError,
};
use crate::config::{ConfigError, TelemetryConfig};
use crate::context::CorrelationContext;
use crate::export::{Exporter, FailureReason};
use crate::instruments::DomainInstruments;
use crate::logger::Logger;
use crate::meter::{Counter, Gauge, Meter};
use crate::metrics::{create_metrics, SharedMetrics};
use crate::propagation::{HeaderCarrier, Propagator};
use crate::records::{LogLevel, Signal, SpanKind};
use crate::redaction::{RedactionError, SharedRedactor};
use crate::resource::Resource;
use crate::tracer::{ActiveSpan, BusAttrs, Tracer};
use crate::worker::{ExporterLoop, ExporterState, FlushReport, WorkerHandle};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Errors from [`Telemetry::init`]; nothing after init returns an error
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid redaction rules: {0}")]
    Redaction(#[from] RedactionError),

    #[error("Metric registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("Telemetry must be initialized inside a tokio runtime")]
    NoRuntime,
}

/// One exporter per signal
#[derive(Clone)]
pub struct Exporters {
    pub logs: Arc<dyn Exporter>,
    pub metrics: Arc<dyn Exporter>,
    pub traces: Arc<dyn Exporter>,
}

impl Exporters {
    /// Send every signal to the same exporter
    pub fn all(exporter: Arc<dyn Exporter>) -> Self {
        Self {
            logs: exporter.clone(),
            metrics: exporter.clone(),
            traces: exporter,
        }
    }

    /// Each exporter once, however many signals share it
    pub fn distinct(&self) -> Vec<Arc<dyn Exporter>> {
        let mut distinct: Vec<Arc<dyn Exporter>> = Vec::with_capacity(3);
        for exporter in [&self.logs, &self.metrics, &self.traces] {
            if !distinct.iter().any(|seen| Arc::ptr_eq(seen, exporter)) {
                distinct.push(exporter.clone());
            }
        }
        distinct
    }
}

/// Slack on top of the flush deadline before a loop is aborted
const JOIN_GRACE: Duration = Duration::from_millis(500);

/// Result of [`Telemetry::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub flushes: Vec<FlushReport>,
}

impl ShutdownReport {
    /// Records given up on across all signals
    pub fn dropped(&self) -> usize {
        self.flushes.iter().map(|f| f.dropped).sum()
    }

    pub fn flushed(&self) -> usize {
        self.flushes.iter().map(|f| f.flushed).sum()
    }

    pub fn timed_out(&self) -> bool {
        self.flushes.iter().any(|f| f.timed_out)
    }
}

pub struct Telemetry {
    resource: Arc<Resource>,
    redactor: SharedRedactor,
    metrics: SharedMetrics,
    tracer: Tracer,
    logger: Logger,
    meter: Meter,
    instruments: DomainInstruments,
    workers: Vec<WorkerHandle>,
    exporters: Vec<Arc<dyn Exporter>>,
    shutdown_tx: broadcast::Sender<Duration>,
    flush_deadline: Duration,
    self_metrics: Option<JoinHandle<()>>,
}

impl Telemetry {
    /// Validate `config` and start the pipelines. Must run inside a tokio
    /// runtime.
    pub fn init(config: &TelemetryConfig, exporters: Exporters) -> Result<Self, InitError> {
        tokio::runtime::Handle::try_current().map_err(|_| InitError::NoRuntime)?;
        config.validate()?;

        let resource = Arc::new(config.service.resource());
        let metrics = create_metrics();
        let redactor = SharedRedactor::new(config.redaction.redactor()?);
        let propagator = Propagator::new(config.sampling.sampler());

        let mut schema = LabelSchema::from_config(&config.labels)?;
        schema.allow(LabelKey::Service, [resource.service_name.as_str()]);
        schema.allow(LabelKey::Env, [resource.environment.as_str()]);
        let guard = CardinalityGuard::new(schema, metrics.clone());

        let buffers = &config.buffer;
        let (log_buffer, log_rx) =
            export_buffer(Signal::Logs, buffers.logs_capacity, metrics.clone());
        let (metric_buffer, metric_rx) =
            export_buffer(Signal::Metrics, buffers.metrics_capacity, metrics.clone());
        let (span_buffer, span_rx) =
            export_buffer(Signal::Traces, buffers.traces_capacity, metrics.clone());

        let tracer = Tracer::new(
            propagator,
            redactor.clone(),
            span_buffer,
            metrics.clone(),
        );
        let logger = Logger::new(
            config.log_level.parse().unwrap_or(LogLevel::Info),
            redactor.clone(),
            log_buffer,
            metrics.clone(),
        );
        let meter = Meter::new(guard, redactor.clone(), metric_buffer, metrics.clone());
        let instruments = DomainInstruments::register(&meter, &resource)?;
        let emitter = SelfMetricsEmitter::register(&meter, metrics.clone())?;

        let distinct_exporters = exporters.distinct();
        let (shutdown_tx, _) = broadcast::channel(1);
        let retry = config.retry.policy();
        let batch_size = buffers.max_batch_size;
        let batch_timeout = buffers.batch_timeout();

        let workers = vec![
            ExporterLoop::new(log_rx, exporters.logs, resource.clone(), metrics.clone())
                .with_batching(batch_size, batch_timeout)
                .with_retry(retry)
                .spawn(shutdown_tx.subscribe()),
            ExporterLoop::new(metric_rx, exporters.metrics, resource.clone(), metrics.clone())
                .with_batching(batch_size, batch_timeout)
                .with_retry(retry)
                .spawn(shutdown_tx.subscribe()),
            ExporterLoop::new(span_rx, exporters.traces, resource.clone(), metrics.clone())
                .with_batching(batch_size, batch_timeout)
                .with_retry(retry)
                .spawn(shutdown_tx.subscribe()),
        ];

        let self_metrics = match buffers.self_metrics_interval_ms {
            0 => None,
            ms => Some(emitter.spawn(Duration::from_millis(ms))),
        };

        info!(
            service = %resource.service_name,
            environment = %resource.environment,
            instance = %resource.instance_id,
            sample_ratio = tracer.propagator().sampler().ratio(),
            "Telemetry initialized"
        );

        Ok(Self {
            resource,
            redactor,
            metrics,
            tracer,
            logger,
            meter,
            instruments,
            workers,
            exporters: distinct_exporters,
            shutdown_tx,
            flush_deadline: config.shutdown.flush_deadline(),
            self_metrics,
        })
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn instruments(&self) -> &DomainInstruments {
        &self.instruments
    }

    pub fn propagator(&self) -> &Propagator {
        self.tracer.propagator()
    }

    /// Handle for swapping redaction rules at runtime
    pub fn redactor(&self) -> &SharedRedactor {
        &self.redactor
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn start_span(
        &self,
        parent: &CorrelationContext,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> ActiveSpan {
        self.tracer.start_span(parent, name, kind)
    }

    pub fn start_publish_span(&self, parent: &CorrelationContext, attrs: &BusAttrs) -> ActiveSpan {
        self.tracer.start_publish_span(parent, attrs)
    }

    pub fn start_consume_span<C: HeaderCarrier + ?Sized>(
        &self,
        headers: &C,
        attrs: &BusAttrs,
    ) -> ActiveSpan {
        self.tracer.start_consume_span(headers, attrs)
    }

    /// Records currently queued for `signal`
    pub fn occupancy(&self, signal: Signal) -> u64 {
        self.metrics.occupancy(signal)
    }

    pub fn worker_state(&self, signal: Signal) -> Option<ExporterState> {
        self.workers
            .iter()
            .find(|w| w.signal() == signal)
            .map(WorkerHandle::state)
    }

    /// Flush every pipeline within the configured deadline and stop
    pub async fn shutdown(mut self) -> ShutdownReport {
        if let Some(task) = self.self_metrics.take() {
            task.abort();
            let _ = task.await;
        }

        info!(
            deadline_ms = self.flush_deadline.as_millis() as u64,
            "Shutting down telemetry"
        );
        let until = Instant::now() + self.flush_deadline + JOIN_GRACE;
        if self.shutdown_tx.send(self.flush_deadline).is_err() {
            debug!("Exporter loops already stopped");
        }

        let mut report = ShutdownReport::default();
        for worker in std::mem::take(&mut self.workers) {
            report.flushes.push(worker.join_until(until).await);
        }

        for exporter in std::mem::take(&mut self.exporters) {
            match tokio::time::timeout_at(until, exporter.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(exporter = exporter.name(), error = %e, "Exporter shutdown failed"),
                Err(_) => warn!(exporter = exporter.name(), "Exporter shutdown timed out"),
            }
        }

        if report.dropped() > 0 {
            warn!(
                dropped = report.dropped(),
                timed_out = report.timed_out(),
                "Records dropped at shutdown"
            );
        } else {
            info!(flushed = report.flushed(), "Telemetry shut down");
        }
        report
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(task) = self.self_metrics.take() {
            task.abort();
        }
    }
}

/// Periodically copies the pipelines' own counters into the metrics pipeline
struct SelfMetricsEmitter {
    occupancy: Gauge,
    dropped: Counter,
    export_fail: Counter,
    metrics: SharedMetrics,
    last_dropped: [u64; 3],
    last_failures: [[u64; FailureReason::COUNT]; 3],
}

impl SelfMetricsEmitter {
    fn register(meter: &Meter, metrics: SharedMetrics) -> Result<Self, RegistryError> {
        Ok(Self {
            occupancy: meter.gauge(
                MetricDescriptor::gauge("ampyobs.buffer.occupancy", "Records queued for export")
                    .with_labels([LabelKey::Signal]),
            )?,
            dropped: meter.counter(
                MetricDescriptor::counter("ampyobs.dropped_total", "Records dropped before export")
                    .with_labels([LabelKey::Signal]),
            )?,
            export_fail: meter.counter(
                MetricDescriptor::counter("ampyobs.export_fail_total", "Batches given up on")
                    .with_labels([LabelKey::Signal, LabelKey::Reason]),
            )?,
            metrics,
            last_dropped: [0; 3],
            last_failures: [[0; FailureReason::COUNT]; 3],
        })
    }

    fn spawn(mut self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.emit();
            }
        })
    }

    fn emit(&mut self) {
        let cx = CorrelationContext::new();
        for signal in Signal::ALL {
            let idx = signal.index();
            let labels = [("signal", signal.as_str())];

            self.occupancy
                .set(&cx, self.metrics.occupancy(signal) as f64, &labels);

            let dropped = self.metrics.dropped(signal);
            let delta = dropped.saturating_sub(self.last_dropped[idx]);
            if delta > 0 {
                self.dropped.add(&cx, delta, &labels);
                self.last_dropped[idx] = dropped;
            }

            for reason in FailureReason::ALL {
                let failures = self.metrics.export_failures(signal, reason);
                let last = &mut self.last_failures[idx][reason.index()];
                let delta = failures.saturating_sub(*last);
                if delta > 0 {
                    self.export_fail.add(
                        &cx,
                        delta,
                        &[("signal", signal.as_str()), ("reason", reason.as_str())],
                    );
                    *last = failures;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportBatch, ExportError, ExportResult, InMemoryExporter};
    use crate::records::{KeyValue, MetricValue};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> TelemetryConfig {
        let mut config = TelemetryConfig::default();
        config.service.name = "ampy-oms".to_string();
        config.service.instance_id = Some("oms-1".to_string());
        config.buffer.logs_capacity = 64;
        config.buffer.metrics_capacity = 64;
        config.buffer.traces_capacity = 64;
        config.buffer.max_batch_size = 16;
        config.buffer.self_metrics_interval_ms = 0;
        config.sampling.sampler = "always_on".to_string();
        config
    }

    #[test]
    fn test_init_outside_runtime() {
        let result = Telemetry::init(
            &test_config(),
            Exporters::all(Arc::new(InMemoryExporter::new())),
        );
        assert!(matches!(result, Err(InitError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_init_rejects_bad_config() {
        let mut config = test_config();
        config.buffer.traces_capacity = 0;
        let result = Telemetry::init(&config, Exporters::all(Arc::new(InMemoryExporter::new())));
        assert!(matches!(result, Err(InitError::Config(_))));
    }

    #[tokio::test]
    async fn test_all_signals_flushed_on_shutdown() {
        let exporter = InMemoryExporter::new();
        let telemetry =
            Telemetry::init(&test_config(), Exporters::all(Arc::new(exporter.clone()))).unwrap();

        let cx = CorrelationContext::new().with_run_id("run_42");
        let mut span = telemetry.start_span(&cx, "oms.submit", SpanKind::Internal);
        span.set_attribute("secret_ref", "vault://prod/alpaca");
        let span_cx = span.context().clone();
        telemetry.logger().info(
            &span_cx,
            "submitting order",
            [KeyValue::new("password", "hunter2")],
        );
        telemetry
            .instruments()
            .order_submitted(&span_cx, "alpaca", "ok");
        span.end();

        let report = telemetry.shutdown().await;
        assert_eq!(report.flushes.len(), 3);
        assert_eq!(report.dropped(), 0);

        let spans = exporter.spans();
        let logs = exporter.logs();
        let points = exporter.metrics();
        assert_eq!(spans.len(), 1);
        assert_eq!(logs.len(), 1);
        assert_eq!(points.len(), 1);
        assert_eq!(logs[0].trace_id, Some(spans[0].trace_id));
        assert_eq!(logs[0].domain.run_id.as_deref(), Some("run_42"));
        assert_eq!(points[0].labels[&LabelKey::Service], "ampy-oms");

        let exported = serde_json::to_string(&exporter.batches()).unwrap();
        assert!(!exported.contains("vault://prod/alpaca"));
        assert!(!exported.contains("hunter2"));
        assert!(exported.contains("oms-1"));
    }

    #[tokio::test]
    async fn test_bus_hop_through_telemetry() {
        let exporter = InMemoryExporter::new();
        let telemetry =
            Telemetry::init(&test_config(), Exporters::all(Arc::new(exporter.clone()))).unwrap();
        let attrs = BusAttrs::new("ampy/dev/orders/v1", "msg_7");

        let publish = telemetry.start_publish_span(&CorrelationContext::new(), &attrs);
        let mut headers = std::collections::HashMap::<String, String>::new();
        telemetry.tracer().inject(publish.context(), &mut headers);
        let consume = telemetry.start_consume_span(&headers, &attrs);
        let trace_id = publish.identity().trace_id;
        publish.end();
        consume.end();

        telemetry.shutdown().await;
        let spans = exporter.spans();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.trace_id == trace_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_metrics_emitted() {
        let exporter = InMemoryExporter::new();
        let mut config = test_config();
        config.buffer.self_metrics_interval_ms = 1_000;
        config.buffer.logs_capacity = 16;
        let telemetry =
            Telemetry::init(&config, Exporters::all(Arc::new(exporter.clone()))).unwrap();

        // overfill the log buffer before the worker gets a chance to drain it
        let cx = CorrelationContext::new();
        for _ in 0..20 {
            telemetry.logger().info(&cx, "burst", []);
        }
        assert_eq!(telemetry.metrics().dropped(Signal::Logs), 4);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        telemetry.shutdown().await;

        let points = exporter.metrics();
        let occupancy: Vec<_> = points
            .iter()
            .filter(|p| p.name == "ampyobs.buffer.occupancy")
            .collect();
        assert_eq!(occupancy.len(), 3);

        let dropped = points
            .iter()
            .find(|p| p.name == "ampyobs.dropped_total")
            .unwrap();
        assert_eq!(dropped.labels[&LabelKey::Signal], "logs");
        assert_eq!(dropped.value, MetricValue::Counter { increment: 4 });
    }

    /// Refuses exports after its first shutdown call, like a closed file sink
    #[derive(Default)]
    struct ClosingExporter {
        inner: InMemoryExporter,
        shutdowns: AtomicU32,
    }

    #[async_trait]
    impl Exporter for ClosingExporter {
        fn name(&self) -> &str {
            "closing"
        }

        async fn export(&self, batch: &ExportBatch) -> ExportResult<()> {
            if self.shutdowns.load(Ordering::SeqCst) > 0 {
                return Err(ExportError::Shutdown);
            }
            self.inner.export(batch).await
        }

        async fn shutdown(&self) -> ExportResult<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shared_exporter_shut_down_once_after_all_flushes() {
        let exporter = Arc::new(ClosingExporter::default());
        let telemetry = Telemetry::init(&test_config(), Exporters::all(exporter.clone())).unwrap();
        let metrics = telemetry.metrics().clone();

        let cx = CorrelationContext::new();
        for i in 0..40 {
            let mut span = telemetry.start_span(&cx, "bus.publish", SpanKind::Producer);
            span.set_attribute("seq", i.to_string());
        }
        telemetry.logger().info(&cx, "published", []);

        let report = telemetry.shutdown().await;

        assert_eq!(report.dropped(), 0);
        assert_eq!(exporter.inner.spans().len(), 40);
        assert_eq!(exporter.inner.logs().len(), 1);
        assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
        for signal in Signal::ALL {
            assert_eq!(metrics.signal(signal).total_export_failures(), 0);
        }
    }

    #[test]
    fn test_distinct_exporters() {
        let shared: Arc<dyn Exporter> = Arc::new(InMemoryExporter::new());
        assert_eq!(Exporters::all(shared.clone()).distinct().len(), 1);

        let exporters = Exporters {
            logs: shared.clone(),
            metrics: Arc::new(InMemoryExporter::new()),
            traces: shared,
        };
        assert_eq!(exporters.distinct().len(), 2);
    }

    /// Never answers
    struct HungExporter;

    #[async_trait]
    impl Exporter for HungExporter {
        fn name(&self) -> &str {
            "hung"
        }

        async fn export(&self, _batch: &ExportBatch) -> ExportResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_bounded_by_flush_deadline() {
        let mut config = test_config();
        config.buffer.max_batch_size = 1;
        config.buffer.batch_timeout_ms = 10;
        config.retry.attempt_timeout_ms = 600_000;
        config.shutdown.flush_deadline_ms = 2_000;
        let telemetry = Telemetry::init(&config, Exporters::all(Arc::new(HungExporter))).unwrap();

        telemetry
            .start_span(&CorrelationContext::new(), "oms.submit", SpanKind::Client)
            .end();
        while telemetry.worker_state(Signal::Traces) != Some(ExporterState::Sending) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let started = Instant::now();
        let report = telemetry.shutdown().await;

        assert!(started.elapsed() <= Duration::from_secs(3));
        assert!(report.timed_out());
        assert_eq!(report.dropped(), 1);
    }

    #[tokio::test]
    async fn test_worker_state_and_occupancy() {
        let telemetry = Telemetry::init(
            &test_config(),
            Exporters::all(Arc::new(InMemoryExporter::new())),
        )
        .unwrap();
        assert_eq!(
            telemetry.worker_state(Signal::Traces),
            Some(ExporterState::Idle)
        );
        assert_eq!(telemetry.occupancy(Signal::Logs), 0);
        telemetry.shutdown().await;
    }
}
