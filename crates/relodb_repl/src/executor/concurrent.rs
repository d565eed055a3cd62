//! Concurrent execution of CRUD batches.

use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tracing::{debug, trace};

use super::command::CommandApplier;
use super::namespace::NamespaceJobExecutor;
use super::pool::WorkerPool;
use super::BatchExecutor;
use crate::analyzer::{CudBatch, NamespaceJob};
use crate::config::{ExecutorConfig, SubBatchConfig};
use crate::context::ApplierContext;
use crate::error::{ReplError, ReplResult};
use crate::metrics::{ExecutorMetrics, ExecutorSnapshot};

/// Chooses how many operations go into each concurrent sub-batch.
pub trait SubBatchHeuristic: Send + Sync {
    /// Sub-batch size for the next CRUD batch. Zero is treated as one.
    fn sub_batch_size(&self, metrics: &ExecutorSnapshot) -> usize;
}

/// Always the same size.
#[derive(Debug, Clone, Copy)]
pub struct FixedSubBatchSize(pub usize);

impl SubBatchHeuristic for FixedSubBatchSize {
    fn sub_batch_size(&self, _metrics: &ExecutorSnapshot) -> usize {
        self.0
    }
}

/// Sizes sub-batches so that each takes about the target latency.
///
/// The size starts at the configured target and is scaled by
/// `target_latency / observed_latency`, so slow sub-batches shrink and fast
/// ones grow. When earlier sub-batches waited longer than the target
/// latency for a free worker the size is halved, so each transaction holds
/// its worker for less time. Sizes are rounded to the nearest integer and
/// always stay within `[min, max]`.
#[derive(Debug, Clone)]
pub struct AdaptiveSubBatchHeuristic {
    config: SubBatchConfig,
}

impl AdaptiveSubBatchHeuristic {
    /// Creates the heuristic.
    pub fn new(config: SubBatchConfig) -> Self {
        Self { config }
    }
}

impl SubBatchHeuristic for AdaptiveSubBatchHeuristic {
    fn sub_batch_size(&self, metrics: &ExecutorSnapshot) -> usize {
        let min = self.config.min_size.max(1);
        let max = self.config.max_size.max(min);
        let mut size = self.config.target_size as f64;
        if let Some(observed) = metrics.average_latency {
            let ratio = self.config.target_latency.as_secs_f64() / observed.as_secs_f64().max(1e-6);
            size *= ratio.clamp(0.25, 4.0);
        }
        if metrics
            .average_queue_wait
            .is_some_and(|wait| wait > self.config.target_latency)
        {
            size /= 2.0;
        }
        (size.round() as usize).clamp(min, max)
    }
}

/// Splits every namespace job into sub-batches and runs them on a worker
/// pool. Sub-batches of one CRUD batch never touch the same document, so
/// they may complete in any order.
pub struct ConcurrentBatchExecutor {
    jobs: Arc<NamespaceJobExecutor>,
    commands: CommandApplier,
    pool: WorkerPool,
    heuristic: Arc<dyn SubBatchHeuristic>,
    metrics: Arc<ExecutorMetrics>,
}

impl ConcurrentBatchExecutor {
    /// Creates the executor and starts its pool on the current tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Fails if called outside a tokio runtime.
    pub fn new(
        config: &ExecutorConfig,
        jobs: NamespaceJobExecutor,
        commands: CommandApplier,
        metrics: Arc<ExecutorMetrics>,
    ) -> ReplResult<Self> {
        let heuristic = Arc::new(AdaptiveSubBatchHeuristic::new(config.sub_batch.clone()));
        Self::with_heuristic(config, jobs, commands, metrics, heuristic)
    }

    /// Creates the executor with a custom sizing heuristic.
    ///
    /// # Errors
    ///
    /// Fails if called outside a tokio runtime.
    pub fn with_heuristic(
        config: &ExecutorConfig,
        jobs: NamespaceJobExecutor,
        commands: CommandApplier,
        metrics: Arc<ExecutorMetrics>,
        heuristic: Arc<dyn SubBatchHeuristic>,
    ) -> ReplResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            ReplError::WorkerPool(format!("concurrent executor needs a tokio runtime: {e}"))
        })?;
        let pool = WorkerPool::new("relodb-apply", config.worker_threads);
        pool.start(runtime);
        Ok(Self {
            jobs: Arc::new(jobs),
            commands,
            pool,
            heuristic,
            metrics,
        })
    }

    /// Stops the worker pool. Later batches fail.
    pub fn shutdown(&self) {
        self.pool.stop();
    }
}

impl BatchExecutor for ConcurrentBatchExecutor {
    fn execute(&self, batch: CudBatch, context: &ApplierContext) -> ReplResult<()> {
        let size = self
            .heuristic
            .sub_batch_size(&self.metrics.snapshot())
            .max(1);
        let sub_jobs: Vec<NamespaceJob> = batch
            .into_jobs()
            .into_iter()
            .flat_map(|job| job.split(size))
            .collect();
        trace!(size, sub_batches = sub_jobs.len(), "executing CRUD batch concurrently");

        let strictness = context.match_strictness();
        let tasks: Vec<_> = sub_jobs
            .into_iter()
            .map(|job| {
                let jobs = Arc::clone(&self.jobs);
                let cancel = context.cancellation().clone();
                let in_flight = InFlight::new(Arc::clone(&self.metrics));
                move || {
                    if cancel.is_cancelled() {
                        return Err(ReplError::Cancelled);
                    }
                    let started = Instant::now();
                    let result = jobs.apply(&job, strictness);
                    in_flight.metrics.record_sub_batch(started.elapsed());
                    result
                }
            })
            .collect();

        let done = self.pool.run_all(tasks, context.cancellation())?;
        if !done.results.is_empty() {
            self.metrics
                .record_queue_wait(done.waited / done.results.len() as u32);
        }

        let mut first_error: Option<ReplError> = None;
        for result in done.results {
            let Err(e) = result.and_then(|r| r) else {
                continue;
            };
            // The first real failure wins over cancellations it caused.
            match &first_error {
                None => first_error = Some(e),
                Some(prev) if prev.is_cancellation() && !e.is_cancellation() => {
                    first_error = Some(e)
                }
                Some(_) => debug!(error = %e, "additional sub-batch failure"),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None if done.interrupted => Err(ReplError::Cancelled),
            None => Ok(()),
        }
    }

    fn commands(&self) -> &CommandApplier {
        &self.commands
    }
}

/// Counts a sub-batch as in flight until dropped, whether it ran, was
/// skipped or panicked.
struct InFlight {
    metrics: Arc<ExecutorMetrics>,
}

impl InFlight {
    fn new(metrics: Arc<ExecutorMetrics>) -> Self {
        metrics.sub_batch_queued();
        Self { metrics }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.metrics.sub_batch_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AnalyzedOp, AnalyzedOpKind};
    use crate::filter::ReplicationFilters;
    use crate::store::{DocumentStore, MemoryDocumentStore, ReadTransaction, WriteTransaction};
    use relodb_oplog::Namespace;
    use serde_json::json;
    use std::time::Duration;
    use tokio::runtime::Runtime;
    use tokio_util::sync::CancellationToken;

    fn executor_on(
        store: Arc<dyn DocumentStore>,
        workers: usize,
        sub_batch: usize,
    ) -> (Runtime, ConcurrentBatchExecutor) {
        let rt = Runtime::new().unwrap();
        let _guard = rt.enter();
        let metrics = Arc::new(ExecutorMetrics::new());
        let exec = ConcurrentBatchExecutor::with_heuristic(
            &ExecutorConfig::default().with_worker_threads(workers),
            NamespaceJobExecutor::new(Arc::clone(&store), Arc::clone(&metrics)),
            CommandApplier::new(store, Arc::new(ReplicationFilters::new()), Arc::clone(&metrics)),
            metrics,
            Arc::new(FixedSubBatchSize(sub_batch)),
        )
        .unwrap();
        (rt, exec)
    }

    fn executor(store: &MemoryDocumentStore, sub_batch: usize) -> (Runtime, ConcurrentBatchExecutor) {
        executor_on(Arc::new(store.clone()), 4, sub_batch)
    }

    fn inserts(ns: &Namespace, ids: std::ops::Range<i64>) -> NamespaceJob {
        NamespaceJob::new(
            ns.clone(),
            ids.map(|i| AnalyzedOp::new(json!(i), AnalyzedOpKind::Insert(json!({"_id": i})), false))
                .collect(),
        )
    }

    /// Cancels a token whenever a write transaction is opened.
    struct CancellingStore {
        inner: MemoryDocumentStore,
        cancel: CancellationToken,
    }

    impl DocumentStore for CancellingStore {
        fn open_read_transaction(&self) -> ReplResult<Box<dyn ReadTransaction + '_>> {
            self.inner.open_read_transaction()
        }

        fn open_write_transaction(&self) -> ReplResult<Box<dyn WriteTransaction + '_>> {
            self.cancel.cancel();
            self.inner.open_write_transaction()
        }
    }

    #[test]
    fn outside_a_runtime_is_an_error() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let metrics = Arc::new(ExecutorMetrics::new());
        let result = ConcurrentBatchExecutor::new(
            &ExecutorConfig::default(),
            NamespaceJobExecutor::new(Arc::clone(&store), Arc::clone(&metrics)),
            CommandApplier::new(store, Arc::new(ReplicationFilters::new()), Arc::clone(&metrics)),
            metrics,
        );
        assert!(matches!(result, Err(ReplError::WorkerPool(_))));
    }

    #[test]
    fn applies_all_sub_batches() {
        let store = MemoryDocumentStore::new();
        let (_rt, exec) = executor(&store, 7);
        let a = Namespace::new("db", "a");
        let b = Namespace::new("db", "b");
        exec.execute(
            CudBatch::new(vec![inserts(&a, 0..50), inserts(&b, 0..10)]),
            &ApplierContext::new(),
        )
        .unwrap();
        assert_eq!(store.contents(&a).len(), 50);
        assert_eq!(store.contents(&b).len(), 10);
        let snapshot = exec.metrics.snapshot();
        assert_eq!(snapshot.sub_batches, 8 + 2);
        assert_eq!(snapshot.in_flight, 0);
        assert!(snapshot.average_queue_wait.is_some());
    }

    #[test]
    fn reports_a_failing_sub_batch() {
        let store = MemoryDocumentStore::new();
        let a = Namespace::new("db", "a");
        store.seed(&a, vec![json!({"_id": 3})]).unwrap();
        let (_rt, exec) = executor(&store, 2);
        let err = exec
            .execute(CudBatch::new(vec![inserts(&a, 0..10)]), &ApplierContext::new())
            .unwrap_err();
        assert!(matches!(err, ReplError::DuplicateKey { .. }));
        assert_eq!(exec.metrics.snapshot().in_flight, 0);
    }

    #[test]
    fn cancelled_context_submits_nothing() {
        let store = MemoryDocumentStore::new();
        let (_rt, exec) = executor(&store, 1);
        let ctx = ApplierContext::new();
        ctx.cancellation().cancel();
        let a = Namespace::new("db", "a");
        let err = exec
            .execute(CudBatch::new(vec![inserts(&a, 0..5)]), &ctx)
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(store.contents(&a).is_empty());
        assert_eq!(exec.metrics.snapshot().in_flight, 0);
    }

    #[test]
    fn cancelling_mid_batch_leaves_nothing_in_flight() {
        let ctx = ApplierContext::new();
        let inner = MemoryDocumentStore::new();
        let store = CancellingStore {
            inner: inner.clone(),
            cancel: ctx.cancellation().clone(),
        };
        let (_rt, exec) = executor_on(Arc::new(store), 1, 1);
        let a = Namespace::new("db", "a");

        let err = exec
            .execute(CudBatch::new(vec![inserts(&a, 0..5)]), &ctx)
            .unwrap_err();
        assert!(matches!(err, ReplError::Cancelled));
        // The running sub-batch finishes; the rest are never started.
        assert_eq!(inner.contents(&a).len(), 1);
        let snapshot = exec.metrics.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.sub_batches, 1);
    }

    #[test]
    fn stopped_pool_fails_batches() {
        let store = MemoryDocumentStore::new();
        let (_rt, exec) = executor(&store, 1);
        exec.shutdown();
        let a = Namespace::new("db", "a");
        let err = exec
            .execute(CudBatch::new(vec![inserts(&a, 0..2)]), &ApplierContext::new())
            .unwrap_err();
        assert!(matches!(err, ReplError::WorkerPool(_)));
        assert_eq!(exec.metrics.snapshot().in_flight, 0);
    }

    #[test]
    fn adaptive_size_follows_latency() {
        let config = SubBatchConfig {
            min_size: 10,
            target_size: 100,
            max_size: 1000,
            target_latency: Duration::from_millis(50),
        };
        let heuristic = AdaptiveSubBatchHeuristic::new(config);
        let mut snapshot = ExecutorSnapshot::default();
        assert_eq!(heuristic.sub_batch_size(&snapshot), 100);

        snapshot.average_latency = Some(Duration::from_millis(100));
        assert_eq!(heuristic.sub_batch_size(&snapshot), 50);

        snapshot.average_latency = Some(Duration::from_millis(1));
        assert_eq!(heuristic.sub_batch_size(&snapshot), 400);

        // A short wait for a worker leaves the size alone.
        snapshot.average_queue_wait = Some(Duration::from_millis(5));
        assert_eq!(heuristic.sub_batch_size(&snapshot), 400);

        snapshot.average_queue_wait = Some(Duration::from_millis(80));
        assert_eq!(heuristic.sub_batch_size(&snapshot), 200);

        // 100 * 0.25 / 2 = 12.5, rounded to nearest.
        snapshot.average_latency = Some(Duration::from_secs(10));
        assert_eq!(heuristic.sub_batch_size(&snapshot), 13);
    }
}
