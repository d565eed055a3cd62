//! Batch execution.
//!
//! An [`AnalyzedBatch`] is applied by a [`BatchExecutor`]:
//!
//! - CRUD batches go through [`NamespaceJobExecutor`], one transaction per
//!   namespace job (or per sub-batch when running concurrently)
//! - command batches go through [`CommandApplier`]
//! - noop batches do nothing

mod command;
mod concurrent;
mod namespace;
mod pool;

use std::sync::Arc;

use tracing::trace;

pub use command::CommandApplier;
pub use concurrent::{
    AdaptiveSubBatchHeuristic, ConcurrentBatchExecutor, FixedSubBatchSize, SubBatchHeuristic,
};
pub use namespace::{NamespaceJobExecutor, MAX_ATTEMPTS};
pub use pool::{Completed, WorkerPool};

use crate::analyzer::{AnalyzedBatch, CudBatch};
use crate::config::ExecutorConfig;
use crate::context::ApplierContext;
use crate::error::ReplResult;
use crate::filter::ReplicationFilters;
use crate::metrics::ExecutorMetrics;
use crate::store::DocumentStore;

/// Applies analyzed batches to the local store.
pub trait BatchExecutor: Send + Sync {
    /// Applies every namespace job of a CRUD batch.
    ///
    /// # Errors
    ///
    /// Fails with the first job error; jobs of other namespaces may have
    /// committed.
    fn execute(&self, batch: CudBatch, context: &ApplierContext) -> ReplResult<()>;

    /// The command applier used for command batches.
    fn commands(&self) -> &CommandApplier;

    /// Applies any analyzed batch.
    ///
    /// # Errors
    ///
    /// Propagates the error of the underlying executor.
    fn apply(&self, batch: AnalyzedBatch, context: &ApplierContext) -> ReplResult<()> {
        match batch {
            AnalyzedBatch::Cud(batch) => self.execute(batch, context),
            AnalyzedBatch::Command(op) => self.commands().apply(&op, context),
            AnalyzedBatch::Noop => Ok(()),
        }
    }
}

/// Runs namespace jobs one after another on the calling thread.
pub struct SequentialBatchExecutor {
    jobs: NamespaceJobExecutor,
    commands: CommandApplier,
}

impl SequentialBatchExecutor {
    /// Creates a sequential executor.
    pub fn new(jobs: NamespaceJobExecutor, commands: CommandApplier) -> Self {
        Self { jobs, commands }
    }
}

impl BatchExecutor for SequentialBatchExecutor {
    fn execute(&self, batch: CudBatch, context: &ApplierContext) -> ReplResult<()> {
        let strictness = context.match_strictness();
        for job in batch.jobs() {
            trace!(namespace = %job.namespace(), ops = job.len(), "executing namespace job");
            self.jobs.apply(job, strictness)?;
        }
        Ok(())
    }

    fn commands(&self) -> &CommandApplier {
        &self.commands
    }
}

/// Builds the executor selected by `config`.
///
/// # Errors
///
/// Fails if the worker pool of a concurrent executor cannot start.
pub fn build_executor(
    config: &ExecutorConfig,
    store: Arc<dyn DocumentStore>,
    filters: Arc<ReplicationFilters>,
    metrics: Arc<ExecutorMetrics>,
) -> ReplResult<Arc<dyn BatchExecutor>> {
    let jobs = NamespaceJobExecutor::new(Arc::clone(&store), Arc::clone(&metrics));
    let commands = CommandApplier::new(store, filters, Arc::clone(&metrics));
    if config.concurrent {
        Ok(Arc::new(ConcurrentBatchExecutor::new(
            config, jobs, commands, metrics,
        )?))
    } else {
        Ok(Arc::new(SequentialBatchExecutor::new(jobs, commands)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::BatchAnalyzer;
    use crate::store::MemoryDocumentStore;
    use relodb_oplog::{CommandOp, Namespace, OplogOperation, Position};
    use serde_json::json;

    fn executor(store: &MemoryDocumentStore, config: ExecutorConfig) -> Arc<dyn BatchExecutor> {
        build_executor(
            &config,
            Arc::new(store.clone()),
            Arc::new(ReplicationFilters::new()),
            Arc::new(ExecutorMetrics::new()),
        )
        .unwrap()
    }

    fn ops() -> Vec<OplogOperation> {
        let ns = Namespace::new("shop", "items");
        let mut ops = vec![OplogOperation::command(
            Position::new(1, 0),
            0,
            ns.clone(),
            CommandOp::Create,
        )];
        for i in 0..40 {
            ops.push(OplogOperation::insert(
                Position::new(1, i + 1),
                i,
                ns.clone(),
                json!({"_id": i, "n": 0}),
            ));
        }
        for i in (0..40).step_by(3) {
            ops.push(OplogOperation::update(
                Position::new(2, i),
                i,
                ns.clone(),
                json!(i),
                json!({"$set": {"n": 5}}),
                false,
            ));
        }
        ops
    }

    fn run(executor: &dyn BatchExecutor) {
        let ctx = ApplierContext::new();
        for batch in BatchAnalyzer::new(ctx.clone()).analyze(&ops()).unwrap() {
            executor.apply(batch, &ctx).unwrap();
        }
    }

    #[test]
    fn sequential_and_concurrent_agree() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let sequential = MemoryDocumentStore::new();
        run(executor(&sequential, ExecutorConfig::sequential()).as_ref());

        let concurrent = MemoryDocumentStore::new();
        let config = ExecutorConfig::default()
            .with_worker_threads(3)
            .with_sub_batch(crate::config::SubBatchConfig {
                min_size: 1,
                target_size: 4,
                max_size: 4,
                target_latency: std::time::Duration::from_millis(50),
            });
        run(executor(&concurrent, config).as_ref());

        assert_eq!(sequential.dump(), concurrent.dump());
        let items = sequential.contents(&Namespace::new("shop", "items"));
        assert_eq!(items.len(), 40);
        assert!(items.contains(&json!({"_id": 3, "n": 5})));
        assert!(items.contains(&json!({"_id": 4, "n": 0})));
    }

    #[test]
    fn noop_batches_do_nothing() {
        let store = MemoryDocumentStore::new();
        let exec = executor(&store, ExecutorConfig::sequential());
        exec.apply(AnalyzedBatch::Noop, &ApplierContext::new())
            .unwrap();
        assert_eq!(store.commit_count(), 0);
    }
}
