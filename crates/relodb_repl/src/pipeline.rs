//! The oplog ingestion pipeline.
//!
//! An [`OplogApplier`] run is a small task graph connected by bounded
//! channels:
//!
//! ```text
//! source (blocking) --fetched--> accumulate (async) --flushed--> execute (blocking)
//!   fetcher.fetch()             filter, validate,            analyze, execute,
//!                               merge until flush            advance checkpoint
//! ```
//!
//! ## Key Invariants
//!
//! - Flushed batches are executed one at a time, in fetch order
//! - The checkpoint moves to a batch's tail only after every analyzed batch
//!   derived from it was applied
//! - The fetcher is closed exactly once, whatever ends the run
//! - A full channel blocks its producer; nothing is dropped

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use relodb_oplog::OplogBatch;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::analyzer::BatchAnalyzer;
use crate::checkpoint::CheckpointStore;
use crate::config::ApplierConfig;
use crate::context::ApplierContext;
use crate::error::{ReplError, ReplResult};
use crate::executor::BatchExecutor;
use crate::fetcher::OplogFetcher;
use crate::filter::{check_batch, ReplicationFilters};
use crate::metrics::ApplierMetrics;

/// Applies oplog streams to the local store.
pub struct OplogApplier {
    config: ApplierConfig,
    checkpoint: Arc<CheckpointStore>,
    executor: Arc<dyn BatchExecutor>,
    filters: Arc<ReplicationFilters>,
    metrics: Arc<ApplierMetrics>,
}

impl OplogApplier {
    /// Creates an applier.
    pub fn new(
        config: ApplierConfig,
        checkpoint: Arc<CheckpointStore>,
        executor: Arc<dyn BatchExecutor>,
        filters: Arc<ReplicationFilters>,
        metrics: Arc<ApplierMetrics>,
    ) -> Self {
        Self {
            config,
            checkpoint,
            executor,
            filters,
            metrics,
        }
    }

    /// Applier metrics.
    pub fn metrics(&self) -> &Arc<ApplierMetrics> {
        &self.metrics
    }

    /// Checkpoint advanced by this applier.
    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    /// Starts applying everything `fetcher` returns.
    ///
    /// The returned job runs until the fetcher reports the end of its
    /// stream, a stage fails, or the job (or the token of `context`) is
    /// cancelled.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn apply<F>(&self, fetcher: F, context: ApplierContext) -> ApplyingJob
    where
        F: OplogFetcher + 'static,
    {
        let cancel = context.cancellation().child_token();
        let failures = Arc::new(StageFailures::new(cancel.child_token()));
        let shutdown = failures.shutdown.clone();
        let context = context.with_cancellation(shutdown.clone());

        let (fetched_tx, fetched_rx) = mpsc::channel(self.config.buffer_capacity.max(1));
        let (flushed_tx, flushed_rx) = mpsc::channel(self.config.stage_capacity.max(1));

        let source = {
            let shutdown = shutdown.clone();
            let failures = Arc::clone(&failures);
            let mut fetcher = CloseOnDrop(fetcher);
            tokio::task::spawn_blocking(move || {
                failures.report("source", run_source(&mut *fetcher, &fetched_tx, &shutdown));
            })
        };

        let accumulate = {
            let accumulator = Accumulator {
                config: self.config.clone(),
                filters: Arc::clone(&self.filters),
            };
            let failures = Arc::clone(&failures);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let result = accumulator.run(fetched_rx, flushed_tx, &shutdown).await;
                failures.report("accumulate", result);
            })
        };

        let execute = {
            let stage = ExecuteStage {
                analyzer: BatchAnalyzer::new(context.clone()),
                executor: Arc::clone(&self.executor),
                checkpoint: Arc::clone(&self.checkpoint),
                metrics: Arc::clone(&self.metrics),
                context,
            };
            let failures = Arc::clone(&failures);
            tokio::task::spawn_blocking(move || {
                failures.report("execute", stage.run(flushed_rx));
            })
        };

        info!(
            max_batch_size = self.config.max_batch_size,
            max_batch_period = ?self.config.max_batch_period,
            "oplog applier started"
        );
        let user = cancel.clone();
        let handle = tokio::spawn(async move {
            for (stage, handle) in [("source", source), ("accumulate", accumulate), ("execute", execute)] {
                if let Err(e) = handle.await {
                    failures.report(
                        stage,
                        Err(ReplError::Stage {
                            stage,
                            reason: e.to_string(),
                        }),
                    );
                }
            }
            let result = failures.outcome(user.is_cancelled());
            match &result {
                Ok(()) => info!("oplog applier finished"),
                Err(e) if e.is_cancellation() => info!("oplog applier cancelled"),
                Err(e) => error!(error = %e, "oplog applier failed"),
            }
            result
        });

        ApplyingJob { cancel, handle }
    }
}

/// A running [`OplogApplier::apply`] call.
pub struct ApplyingJob {
    cancel: CancellationToken,
    handle: JoinHandle<ReplResult<()>>,
}

impl ApplyingJob {
    /// Stops every stage at its next safe point. Calling it again does
    /// nothing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this job.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns true once the job has completed.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the job to complete.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure, or [`ReplError::Cancelled`] if the
    /// job was cancelled without any failure.
    pub async fn wait(self) -> ReplResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ReplError::Stage {
                stage: "supervisor",
                reason: e.to_string(),
            }),
        }
    }
}

/// Collects stage outcomes. The first failure stops the other stages.
struct StageFailures {
    first: Mutex<Option<ReplError>>,
    shutdown: CancellationToken,
}

impl StageFailures {
    fn new(shutdown: CancellationToken) -> Self {
        Self {
            first: Mutex::new(None),
            shutdown,
        }
    }

    fn report(&self, stage: &'static str, result: ReplResult<()>) {
        let Err(e) = result else {
            trace!(stage, "pipeline stage completed");
            return;
        };
        if e.is_cancellation() {
            debug!(stage, "pipeline stage stopped");
        } else {
            error!(stage, error = %e, "pipeline stage failed");
        }
        let mut first = self.first.lock();
        let replace = match first.as_ref() {
            None => true,
            Some(prev) => prev.is_cancellation() && !e.is_cancellation(),
        };
        if replace {
            *first = Some(e);
        }
        drop(first);
        self.shutdown.cancel();
    }

    fn outcome(&self, cancelled: bool) -> ReplResult<()> {
        match self.first.lock().take() {
            Some(e) if !e.is_cancellation() => Err(e),
            Some(_) => Err(ReplError::Cancelled),
            None if cancelled => Err(ReplError::Cancelled),
            None => Ok(()),
        }
    }
}

/// Closes the fetcher when the source stage lets go of it.
struct CloseOnDrop<F: OplogFetcher>(F);

impl<F: OplogFetcher> Deref for CloseOnDrop<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.0
    }
}

impl<F: OplogFetcher> DerefMut for CloseOnDrop<F> {
    fn deref_mut(&mut self) -> &mut F {
        &mut self.0
    }
}

impl<F: OplogFetcher> Drop for CloseOnDrop<F> {
    fn drop(&mut self) {
        self.0.close();
        trace!("oplog fetcher closed");
    }
}

fn run_source<F: OplogFetcher>(
    fetcher: &mut F,
    out: &mpsc::Sender<OplogBatch>,
    shutdown: &CancellationToken,
) -> ReplResult<()> {
    loop {
        if shutdown.is_cancelled() {
            return Err(ReplError::Cancelled);
        }
        let Some(batch) = fetcher.fetch()? else {
            debug!("oplog fetcher reached the end of its stream");
            return Ok(());
        };
        trace!(ops = batch.len(), ready_for_more = batch.ready_for_more(), "fetched oplog batch");
        if out.blocking_send(batch).is_err() {
            // Downstream is gone; its outcome is reported by its own stage.
            return Ok(());
        }
    }
}

/// A batch leaving the accumulator.
struct Flushed {
    batch: OplogBatch,
    started: Instant,
}

struct Accumulator {
    config: ApplierConfig,
    filters: Arc<ReplicationFilters>,
}

impl Accumulator {
    async fn run(
        &self,
        mut input: mpsc::Receiver<OplogBatch>,
        output: mpsc::Sender<Flushed>,
        shutdown: &CancellationToken,
    ) -> ReplResult<()> {
        let mut pending: Option<Flushed> = None;
        loop {
            let deadline = pending
                .as_ref()
                .map(|p| p.started + self.config.max_batch_period);
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ReplError::Cancelled),
                _ = sleep_until(deadline) => {
                    trace!("batch period elapsed");
                    if !flush(&mut pending, &output, shutdown).await? {
                        return Ok(());
                    }
                    continue;
                }
                received = input.recv() => received,
            };

            let Some(batch) = received else {
                flush(&mut pending, &output, shutdown).await?;
                return Ok(());
            };
            let batch = self.filters.filter_batch(batch);
            check_batch(&batch)?;
            let ready_for_more = batch.ready_for_more();
            pending = Some(match pending.take() {
                Some(p) => Flushed {
                    batch: p.batch.concat(batch),
                    started: p.started,
                },
                None => Flushed {
                    batch,
                    started: Instant::now(),
                },
            });

            let full = pending
                .as_ref()
                .is_some_and(|p| p.batch.len() >= self.config.max_batch_size);
            if (full || !ready_for_more) && !flush(&mut pending, &output, shutdown).await? {
                return Ok(());
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Hands the pending batch to the execute stage. Returns false once the
/// execute stage has gone away.
async fn flush(
    pending: &mut Option<Flushed>,
    output: &mpsc::Sender<Flushed>,
    shutdown: &CancellationToken,
) -> ReplResult<bool> {
    let Some(flushed) = pending.take() else {
        return Ok(true);
    };
    if flushed.batch.is_void() {
        return Ok(true);
    }
    debug!(ops = flushed.batch.len(), "flushing oplog batch");
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(ReplError::Cancelled),
        sent = output.send(flushed) => Ok(sent.is_ok()),
    }
}

struct ExecuteStage {
    analyzer: BatchAnalyzer,
    executor: Arc<dyn BatchExecutor>,
    checkpoint: Arc<CheckpointStore>,
    metrics: Arc<ApplierMetrics>,
    context: ApplierContext,
}

impl ExecuteStage {
    fn run(&self, mut input: mpsc::Receiver<Flushed>) -> ReplResult<()> {
        while let Some(Flushed { batch, started }) = input.blocking_recv() {
            if self.context.is_cancelled() {
                return Err(ReplError::Cancelled);
            }
            for analyzed in self.analyzer.analyze(batch.ops())? {
                if self.context.is_cancelled() {
                    return Err(ReplError::Cancelled);
                }
                self.executor.apply(analyzed, &self.context)?;
            }
            let tail = batch.tail();
            if let Some(tail) = tail {
                let mut handle = self.checkpoint.open_write();
                handle.advance(tail.hash, tail.position)?;
                handle.close();
            }
            self.metrics
                .record_batch(batch.len(), started.elapsed(), tail.map(|t| t.position));
            trace!(ops = batch.len(), "oplog batch applied");
        }
        Ok(())
    }
}
