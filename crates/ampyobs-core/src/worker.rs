//! Exporter loop - one background task per signal
//!
//! The loop pulls batches from the buffer, sends them with bounded retry and
//! backoff, and on shutdown drains what it can within a deadline. Whatever is
//! left after the deadline is counted as dropped and the task ends anyway.
//! A batch that is mid-retry when shutdown arrives only gets the deadline.
//!
//! Loops only flush their exporter. Exporters can be shared between signals,
//! so closing them is left to whoever owns all the loops.

use crate::buffer::BufferReceiver;
use crate::export::{BatchRecord, ExportBatch, ExportError, Exporter};
use crate::metrics::SharedMetrics;
use crate::records::Signal;
use crate::resource::Resource;
use crate::retry::RetryPolicy;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Flush deadline used when the shutdown channel closes without a value
pub const DEFAULT_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExporterState {
    Idle = 0,
    Sending = 1,
    Backoff = 2,
    Stopped = 3,
}

impl ExporterState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExporterState::Idle,
            1 => ExporterState::Sending,
            2 => ExporterState::Backoff,
            _ => ExporterState::Stopped,
        }
    }
}

/// Observable state of a running loop
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ExporterState::Idle as u8)))
    }

    pub fn get(&self) -> ExporterState {
        ExporterState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ExporterState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Outcome of a worker's final flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub signal: Signal,
    /// Records exported during the forced flush
    pub flushed: usize,
    /// Records given up on at shutdown
    pub dropped: usize,
    pub timed_out: bool,
}

impl FlushReport {
    fn empty(signal: Signal) -> Self {
        Self {
            signal,
            flushed: 0,
            dropped: 0,
            timed_out: false,
        }
    }
}

/// Background worker for one signal
pub struct ExporterLoop<T: BatchRecord> {
    receiver: BufferReceiver<T>,
    exporter: Arc<dyn Exporter>,
    resource: Arc<Resource>,
    max_batch_size: usize,
    batch_timeout: Duration,
    retry: RetryPolicy,
    metrics: SharedMetrics,
    state: StateHandle,
}

impl<T: BatchRecord> ExporterLoop<T> {
    pub fn new(
        receiver: BufferReceiver<T>,
        exporter: Arc<dyn Exporter>,
        resource: Arc<Resource>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            receiver,
            exporter,
            resource,
            max_batch_size: 512,
            batch_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            metrics,
            state: StateHandle::new(),
        }
    }

    pub fn with_batching(mut self, max_batch_size: usize, batch_timeout: Duration) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self.batch_timeout = batch_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Start the loop. A value on `shutdown` triggers the forced flush with
    /// that deadline.
    pub fn spawn(self, shutdown: broadcast::Receiver<Duration>) -> WorkerHandle {
        let state = self.state.clone();
        let join = tokio::spawn(self.run(shutdown));
        WorkerHandle {
            signal: T::SIGNAL,
            state,
            join,
        }
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<Duration>) -> FlushReport {
        info!(
            signal = %T::SIGNAL,
            exporter = self.exporter.name(),
            "Exporter loop started"
        );

        let mut report = FlushReport::empty(T::SIGNAL);
        let until = loop {
            tokio::select! {
                biased;
                signal = shutdown.recv() => {
                    break Instant::now() + signal.unwrap_or(DEFAULT_FLUSH_DEADLINE);
                }
                batch = self.receiver.next_batch(self.max_batch_size, self.batch_timeout) => {
                    match batch {
                        Some(records) if records.is_empty() => continue,
                        Some(records) => {
                            let interrupted = self
                                .send_until_shutdown(records, &mut shutdown, &mut report)
                                .await;
                            if let Some(until) = interrupted {
                                break until;
                            }
                        }
                        None => {
                            debug!(signal = %T::SIGNAL, "Export buffer closed");
                            break Instant::now() + DEFAULT_FLUSH_DEADLINE;
                        }
                    }
                }
            }
        };

        self.forced_flush(until, report).await
    }

    /// Send a batch while watching for shutdown.
    ///
    /// Returns the flush deadline if shutdown arrived mid-send. The batch then
    /// only gets until that deadline and is counted as dropped past it.
    async fn send_until_shutdown(
        &self,
        records: Vec<T>,
        shutdown: &mut broadcast::Receiver<Duration>,
        report: &mut FlushReport,
    ) -> Option<Instant> {
        let in_flight = records.len();
        let send = self.send(records);
        tokio::pin!(send);

        let deadline = tokio::select! {
            biased;
            _ = &mut send => return None,
            signal = shutdown.recv() => signal.unwrap_or(DEFAULT_FLUSH_DEADLINE),
        };
        let until = Instant::now() + deadline;
        debug!(signal = %T::SIGNAL, records = in_flight, "Shutdown during send");

        match tokio::time::timeout_at(until, send).await {
            Ok(true) => report.flushed += in_flight,
            Ok(false) => {}
            Err(_) => {
                report.dropped += in_flight;
                report.timed_out = true;
            }
        }
        Some(until)
    }

    /// Send one batch with retries. Returns true on ack.
    async fn send(&self, records: Vec<T>) -> bool {
        let count = records.len();
        let batch = ExportBatch::new((*self.resource).clone(), T::into_payload(records));
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.state.set(ExporterState::Sending);

            let result =
                match tokio::time::timeout(self.retry.attempt_timeout, self.exporter.export(&batch))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExportError::Timeout),
                };

            match result {
                Ok(()) => {
                    self.metrics.record_exported(T::SIGNAL, count as u64);
                    self.state.set(ExporterState::Idle);
                    debug!(signal = %T::SIGNAL, records = count, attempt, "Exported batch");
                    return true;
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        signal = %T::SIGNAL,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Export failed, retrying"
                    );
                    self.state.set(ExporterState::Backoff);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        signal = %T::SIGNAL,
                        records = count,
                        attempt,
                        error = %e,
                        "Export failed, dropping batch"
                    );
                    self.metrics.record_export_failure(T::SIGNAL, e.reason());
                    self.state.set(ExporterState::Idle);
                    return false;
                }
            }
        }
    }

    async fn forced_flush(mut self, until: Instant, mut report: FlushReport) -> FlushReport {
        self.receiver.close();

        while !report.timed_out {
            let records = self.receiver.drain_now(self.max_batch_size);
            if records.is_empty() {
                break;
            }
            let in_flight = records.len();
            match tokio::time::timeout_at(until, self.send(records)).await {
                Ok(true) => report.flushed += in_flight,
                Ok(false) => {}
                Err(_) => {
                    report.dropped += in_flight;
                    report.timed_out = true;
                }
            }
        }

        report.dropped += self.receiver.discard_remaining();
        if report.dropped > 0 {
            self.metrics.record_dropped(T::SIGNAL, report.dropped as u64);
            warn!(
                signal = %T::SIGNAL,
                dropped = report.dropped,
                "Flush deadline reached, dropping remaining records"
            );
        }

        match tokio::time::timeout_at(until, self.exporter.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(signal = %T::SIGNAL, error = %e, "Exporter flush failed"),
            Err(_) => warn!(signal = %T::SIGNAL, "Exporter flush timed out"),
        }

        self.state.set(ExporterState::Stopped);
        info!(
            signal = %T::SIGNAL,
            flushed = report.flushed,
            dropped = report.dropped,
            "Exporter loop stopped"
        );
        report
    }
}

/// Handle to a spawned exporter loop
#[derive(Debug)]
pub struct WorkerHandle {
    signal: Signal,
    state: StateHandle,
    join: JoinHandle<FlushReport>,
}

impl WorkerHandle {
    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn state(&self) -> ExporterState {
        self.state.get()
    }

    /// Wait for the loop to finish after shutdown was signalled
    pub async fn join(self) -> FlushReport {
        let result = self.join.await;
        Self::report(self.signal, result)
    }

    /// Like [`join`](Self::join), but abort the task if it is still running
    /// at `until`
    pub async fn join_until(mut self, until: Instant) -> FlushReport {
        match tokio::time::timeout_at(until, &mut self.join).await {
            Ok(result) => Self::report(self.signal, result),
            Err(_) => {
                self.join.abort();
                warn!(signal = %self.signal, "Exporter loop overran the flush deadline, aborted");
                FlushReport {
                    timed_out: true,
                    ..FlushReport::empty(self.signal)
                }
            }
        }
    }

    fn report(signal: Signal, result: Result<FlushReport, JoinError>) -> FlushReport {
        match result {
            Ok(report) => report,
            Err(e) => {
                error!(signal = %signal, error = %e, "Exporter loop panicked");
                FlushReport::empty(signal)
            }
        }
    }
}
