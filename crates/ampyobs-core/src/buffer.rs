//! Bounded per-signal export buffer
//!
//! Producers push with [`ExportBuffer::try_push`], which never waits: when the
//! queue is full (or the worker is gone) the record is dropped and counted.
//! The worker side pulls batches bounded by size and time.

use crate::metrics::SharedMetrics;
use crate::records::Signal;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::warn;

/// Log every n-th drop after the first
const DROP_LOG_EVERY: u64 = 1000;

/// Create a buffer with a fixed capacity (at least 1)
///
/// Occupancy is read straight from the channel whenever the metrics ask for
/// it. It reports 0 once every producer is gone.
pub fn export_buffer<T: Send + 'static>(
    signal: Signal,
    capacity: usize,
    metrics: SharedMetrics,
) -> (ExportBuffer<T>, BufferReceiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    metrics.set_capacity(signal, capacity);
    let weak = tx.downgrade();
    metrics.set_occupancy_source(signal, move || {
        weak.upgrade()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    });
    (
        ExportBuffer {
            tx,
            signal,
            metrics,
        },
        BufferReceiver {
            rx,
            pending: Vec::new(),
            signal,
        },
    )
}

/// Producer side. Cheap to clone.
#[derive(Debug)]
pub struct ExportBuffer<T> {
    tx: mpsc::Sender<T>,
    signal: Signal,
    metrics: SharedMetrics,
}

impl<T> Clone for ExportBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            signal: self.signal,
            metrics: self.metrics.clone(),
        }
    }
}

impl<T> ExportBuffer<T> {
    /// Enqueue without waiting. Returns false if the record was dropped.
    pub fn try_push(&self, record: T) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.metrics.record_enqueued(self.signal);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.count_drop("buffer full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.count_drop("exporter stopped");
                false
            }
        }
    }

    fn count_drop(&self, cause: &'static str) {
        let before = self.metrics.record_dropped(self.signal, 1);
        if before % DROP_LOG_EVERY == 0 {
            warn!(
                signal = %self.signal,
                cause,
                dropped_total = before + 1,
                "Dropping telemetry record"
            );
        }
    }

    /// Records currently queued
    pub fn occupancy(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the exporter loop
#[derive(Debug)]
pub struct BufferReceiver<T> {
    rx: mpsc::Receiver<T>,
    /// Records pulled but not yet handed out; kept across cancellation
    pending: Vec<T>,
    signal: Signal,
}

impl<T> BufferReceiver<T> {
    /// Wait for up to `max` records or until `timeout` elapses.
    ///
    /// Returns `None` once every producer is gone and nothing is left.
    /// Cancel-safe: records collected before cancellation are returned by
    /// the next call.
    pub async fn next_batch(&mut self, max: usize, timeout: Duration) -> Option<Vec<T>> {
        let max = max.max(1);
        let deadline = Instant::now() + timeout;
        let mut closed = false;

        while self.pending.len() < max {
            tokio::select! {
                record = self.rx.recv() => match record {
                    Some(record) => self.pending.push(record),
                    None => {
                        closed = true;
                        break;
                    }
                },
                _ = sleep_until(deadline) => break,
            }
        }

        if closed && self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// Take up to `max` already-queued records without waiting
    pub fn drain_now(&mut self, max: usize) -> Vec<T> {
        while self.pending.len() < max {
            match self.rx.try_recv() {
                Ok(record) => self.pending.push(record),
                Err(_) => break,
            }
        }
        let take = self.pending.len().min(max);
        self.pending.drain(..take).collect()
    }

    /// Refuse further pushes; queued records stay readable
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Discard everything still queued, returning the count
    pub fn discard_remaining(&mut self) -> usize {
        let mut discarded = self.pending.len();
        self.pending.clear();
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::create_metrics;

    #[tokio::test]
    async fn test_overfill_drops_exact_excess() {
        let metrics = create_metrics();
        let (buffer, _rx) = export_buffer::<u32>(Signal::Logs, 8, metrics.clone());

        let accepted = (0..20).filter(|i| buffer.try_push(*i)).count();

        assert_eq!(accepted, 8);
        assert_eq!(metrics.dropped(Signal::Logs), 12);
        assert_eq!(buffer.occupancy(), 8);
        assert_eq!(metrics.occupancy(Signal::Logs), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_never_wait() {
        const PRODUCERS: usize = 8;
        const PUSHES: usize = 500;
        const CAPACITY: usize = 64;

        let metrics = create_metrics();
        let (buffer, _rx) = export_buffer::<usize>(Signal::Traces, CAPACITY, metrics.clone());

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    let mut accepted = 0usize;
                    let mut slowest = std::time::Duration::ZERO;
                    for i in 0..PUSHES {
                        let started = std::time::Instant::now();
                        if buffer.try_push(p * PUSHES + i) {
                            accepted += 1;
                        }
                        slowest = slowest.max(started.elapsed());
                    }
                    (accepted, slowest)
                })
            })
            .collect();

        let mut accepted = 0;
        for producer in producers {
            let (n, slowest) = producer.await.unwrap();
            accepted += n;
            assert!(
                slowest < std::time::Duration::from_millis(50),
                "try_push took {:?}",
                slowest
            );
        }

        let total = (PRODUCERS * PUSHES) as u64;
        assert_eq!(accepted, CAPACITY);
        assert_eq!(metrics.dropped(Signal::Traces), total - CAPACITY as u64);
        assert_eq!(metrics.occupancy(Signal::Traces), CAPACITY as u64);
    }

    #[tokio::test]
    async fn test_occupancy_follows_consumer() {
        let metrics = create_metrics();
        let (buffer, mut rx) = export_buffer::<u32>(Signal::Logs, 16, metrics.clone());
        for i in 0..10 {
            buffer.try_push(i);
        }
        assert_eq!(metrics.occupancy(Signal::Logs), 10);

        rx.drain_now(4);
        assert_eq!(metrics.occupancy(Signal::Logs), 6);

        buffer.try_push(10);
        assert_eq!(metrics.occupancy(Signal::Logs), 7);

        rx.close();
        assert_eq!(rx.discard_remaining(), 7);
        assert_eq!(metrics.occupancy(Signal::Logs), 0);
    }

    #[tokio::test]
    async fn test_batch_by_size() {
        let metrics = create_metrics();
        let (buffer, mut rx) = export_buffer::<u32>(Signal::Traces, 16, metrics);
        for i in 0..10 {
            assert!(buffer.try_push(i));
        }

        let batch = rx.next_batch(4, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch, vec![0, 1, 2, 3]);
        assert_eq!(buffer.occupancy(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_by_time() {
        let metrics = create_metrics();
        let (buffer, mut rx) = export_buffer::<u32>(Signal::Traces, 16, metrics);
        buffer.try_push(1);
        buffer.try_push(2);

        let started = Instant::now();
        let batch = rx.next_batch(100, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch, vec![1, 2]);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_survives_cancellation() {
        let metrics = create_metrics();
        let (buffer, mut rx) = export_buffer::<u32>(Signal::Metrics, 16, metrics);
        buffer.try_push(7);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), rx.next_batch(10, Duration::from_secs(60)))
                .await;
        assert!(cancelled.is_err());

        buffer.try_push(8);
        let batch = rx.next_batch(2, Duration::from_secs(60)).await.unwrap();
        assert_eq!(batch, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_closed_and_drained_returns_none() {
        let metrics = create_metrics();
        let (buffer, mut rx) = export_buffer::<u32>(Signal::Logs, 4, metrics);
        buffer.try_push(1);
        drop(buffer);

        assert_eq!(
            rx.next_batch(10, Duration::from_secs(1)).await,
            Some(vec![1])
        );
        assert_eq!(rx.next_batch(10, Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn test_push_after_close_is_dropped() {
        let metrics = create_metrics();
        let (buffer, mut rx) = export_buffer::<u32>(Signal::Logs, 4, metrics.clone());
        buffer.try_push(1);
        rx.close();

        assert!(!buffer.try_push(2));
        assert_eq!(metrics.dropped(Signal::Logs), 1);
        assert_eq!(rx.drain_now(10), vec![1]);
        assert_eq!(rx.discard_remaining(), 0);
    }
}
