//! Replication metrics.
//!
//! Counters are atomic and can be read while a job is running. Readers take
//! a snapshot and never block the pipeline.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use relodb_oplog::Position;

/// Metrics of the oplog applier.
#[derive(Debug, Default)]
pub struct ApplierMetrics {
    // Batch counters
    /// Flushed batches that were executed.
    batches: AtomicU64,
    /// Oplog entries executed.
    applied_ops: AtomicU64,
    /// Size of the last executed batch.
    last_batch_size: AtomicU64,
    /// Largest batch executed.
    max_batch_size: AtomicU64,

    // Timing
    /// Total microseconds spent from first fetch to checkpoint.
    total_micros: AtomicU64,
    /// Microseconds per entry in the last batch.
    last_cost_micros: AtomicU64,

    // Progress
    last_term: AtomicI64,
    last_timestamp: AtomicI64,
}

/// Point-in-time view of [`ApplierMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplierSnapshot {
    /// Flushed batches that were executed.
    pub batches: u64,
    /// Oplog entries executed.
    pub applied_ops: u64,
    /// Size of the last executed batch.
    pub last_batch_size: u64,
    /// Largest batch executed.
    pub max_batch_size: u64,
    /// Time spent executing batches.
    pub total_time: Duration,
    /// Time per entry in the last batch.
    pub last_cost_per_op: Duration,
    /// Last applied position.
    pub last_applied: Position,
}

impl ApplierMetrics {
    /// Creates empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an executed batch.
    pub(crate) fn record_batch(&self, size: usize, elapsed: Duration, last: Option<Position>) {
        let size = size as u64;
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.applied_ops.fetch_add(size, Ordering::Relaxed);
        self.last_batch_size.store(size, Ordering::Relaxed);
        self.max_batch_size.fetch_max(size, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        if size > 0 {
            self.last_cost_micros.store(micros / size, Ordering::Relaxed);
        }
        if let Some(position) = last {
            self.record_last_applied(position);
        }
    }

    /// Records the last applied position.
    pub(crate) fn record_last_applied(&self, position: Position) {
        self.last_term.store(position.term, Ordering::Relaxed);
        self.last_timestamp
            .store(position.timestamp, Ordering::Relaxed);
    }

    /// Takes a snapshot.
    pub fn snapshot(&self) -> ApplierSnapshot {
        ApplierSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            applied_ops: self.applied_ops.load(Ordering::Relaxed),
            last_batch_size: self.last_batch_size.load(Ordering::Relaxed),
            max_batch_size: self.max_batch_size.load(Ordering::Relaxed),
            total_time: Duration::from_micros(self.total_micros.load(Ordering::Relaxed)),
            last_cost_per_op: Duration::from_micros(self.last_cost_micros.load(Ordering::Relaxed)),
            last_applied: Position::new(
                self.last_term.load(Ordering::Relaxed),
                self.last_timestamp.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Metrics of the batch executors.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    jobs: AtomicU64,
    sub_batches: AtomicU64,
    ops: AtomicU64,
    rollbacks: AtomicU64,
    commands: AtomicU64,
    in_flight: AtomicU64,
    /// Exponentially weighted average of sub-batch latency, in microseconds.
    latency_ewma_micros: AtomicU64,
    /// Same for the time a sub-batch waits for a free worker.
    queue_wait_ewma_micros: AtomicU64,
}

/// Point-in-time view of [`ExecutorMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorSnapshot {
    /// Namespace jobs executed.
    pub jobs: u64,
    /// Sub-batches executed.
    pub sub_batches: u64,
    /// Analyzed operations executed.
    pub ops: u64,
    /// Transactions redone after a rollback.
    pub rollbacks: u64,
    /// Commands applied.
    pub commands: u64,
    /// Sub-batches submitted but not finished.
    pub in_flight: u64,
    /// Average sub-batch latency, once observed.
    pub average_latency: Option<Duration>,
    /// Average time a sub-batch waited for a free worker, once observed.
    pub average_queue_wait: Option<Duration>,
}

impl ExecutorMetrics {
    /// Creates empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_job(&self, ops: usize) {
        self.jobs.fetch_add(1, Ordering::Relaxed);
        self.ops.fetch_add(ops as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sub_batch_queued(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sub_batch_done(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn record_sub_batch(&self, elapsed: Duration) {
        self.sub_batches.fetch_add(1, Ordering::Relaxed);
        ewma(&self.latency_ewma_micros, elapsed);
    }

    pub(crate) fn record_queue_wait(&self, wait: Duration) {
        ewma(&self.queue_wait_ewma_micros, wait);
    }

    /// Takes a snapshot.
    pub fn snapshot(&self) -> ExecutorSnapshot {
        let average = |micros: &AtomicU64| {
            let micros = micros.load(Ordering::Relaxed);
            (micros > 0).then(|| Duration::from_micros(micros))
        };
        ExecutorSnapshot {
            jobs: self.jobs.load(Ordering::Relaxed),
            sub_batches: self.sub_batches.load(Ordering::Relaxed),
            ops: self.ops.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            average_latency: average(&self.latency_ewma_micros),
            average_queue_wait: average(&self.queue_wait_ewma_micros),
        }
    }
}

/// Folds a sample into an average kept in microseconds: new = 0.8 * old +
/// 0.2 * sample. Zero means no sample yet, so samples count as at least 1µs.
fn ewma(average: &AtomicU64, sample: Duration) {
    let sample = sample.as_micros().clamp(1, u128::from(u64::MAX)) as u64;
    let _ = average.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
        Some(if old == 0 {
            sample
        } else {
            (old * 4 + sample) / 5
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applier_batches() {
        let metrics = ApplierMetrics::new();
        metrics.record_batch(10, Duration::from_millis(10), Some(Position::new(1, 5)));
        metrics.record_batch(4, Duration::from_millis(2), None);
        let snap = metrics.snapshot();
        assert_eq!(snap.batches, 2);
        assert_eq!(snap.applied_ops, 14);
        assert_eq!(snap.last_batch_size, 4);
        assert_eq!(snap.max_batch_size, 10);
        assert_eq!(snap.last_cost_per_op, Duration::from_micros(500));
        assert_eq!(snap.last_applied, Position::new(1, 5));
    }

    #[test]
    fn executor_latency_average() {
        let metrics = ExecutorMetrics::new();
        assert_eq!(metrics.snapshot().average_latency, None);
        metrics.sub_batch_queued();
        metrics.record_sub_batch(Duration::from_millis(10));
        metrics.sub_batch_done();
        assert_eq!(
            metrics.snapshot().average_latency,
            Some(Duration::from_millis(10))
        );
        metrics.sub_batch_queued();
        assert_eq!(metrics.snapshot().in_flight, 1);
        metrics.record_sub_batch(Duration::from_millis(60));
        metrics.sub_batch_done();
        metrics.sub_batch_done();
        let snap = metrics.snapshot();
        assert_eq!(snap.average_latency, Some(Duration::from_millis(20)));
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.sub_batches, 2);
        assert_eq!(snap.average_queue_wait, None);

        metrics.record_queue_wait(Duration::ZERO);
        assert_eq!(
            metrics.snapshot().average_queue_wait,
            Some(Duration::from_micros(1))
        );
    }
}
