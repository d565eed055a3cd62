//! Batch analysis.
//!
//! The analyzer turns a flushed run of oplog entries into an ordered list of
//! executable batches:
//! - consecutive CRUD entries become a [`CudBatch`] with one
//!   [`NamespaceJob`] per collection and at most one operation per document
//! - every command becomes a batch of its own
//! - a run made only of noops becomes a single [`AnalyzedBatch::Noop`]
//!
//! Entries on the same document are folded into one [`AnalyzedOp`] when the
//! fold is exact. When it is not, the current CRUD batch is closed and a
//! new one starts, so executing the batches in order matches executing the
//! entries one by one.

mod op;

pub use op::{AnalyzedOp, AnalyzedOpKind};

use std::collections::HashMap;

use relodb_oplog::{DocKey, Namespace, OplogOperation};
use tracing::trace;

use crate::context::ApplierContext;
use crate::error::ReplResult;

/// The CRUD operations of one collection inside a [`CudBatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceJob {
    namespace: Namespace,
    ops: Vec<AnalyzedOp>,
}

impl NamespaceJob {
    /// Creates a job.
    pub fn new(namespace: Namespace, ops: Vec<AnalyzedOp>) -> Self {
        Self { namespace, ops }
    }

    /// Target collection.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Database of the target collection.
    pub fn database(&self) -> &str {
        self.namespace.database()
    }

    /// Name of the target collection.
    pub fn collection(&self) -> &str {
        self.namespace.collection()
    }

    /// Operations, one per document.
    pub fn ops(&self) -> &[AnalyzedOp] {
        &self.ops
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the job has no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Splits the job into jobs of at most `size` operations. Since every
    /// operation targets a different document, the pieces are independent.
    pub fn split(self, size: usize) -> Vec<NamespaceJob> {
        let size = size.max(1);
        if self.ops.len() <= size {
            return vec![self];
        }
        let namespace = self.namespace;
        self.ops
            .chunks(size)
            .map(|chunk| NamespaceJob::new(namespace.clone(), chunk.to_vec()))
            .collect()
    }
}

/// Independent namespace jobs that may run in any order or in parallel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CudBatch {
    jobs: Vec<NamespaceJob>,
}

impl CudBatch {
    /// Creates a batch.
    pub fn new(jobs: Vec<NamespaceJob>) -> Self {
        Self { jobs }
    }

    /// The jobs, in first-appearance order of their collections.
    pub fn jobs(&self) -> &[NamespaceJob] {
        &self.jobs
    }

    /// Consumes the batch.
    pub fn into_jobs(self) -> Vec<NamespaceJob> {
        self.jobs
    }

    /// Total number of operations.
    pub fn op_count(&self) -> usize {
        self.jobs.iter().map(NamespaceJob::len).sum()
    }

    /// Returns true if there is nothing to execute.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// A unit of execution produced by the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzedBatch {
    /// CRUD work.
    Cud(CudBatch),
    /// A single command.
    Command(OplogOperation),
    /// Only noops were received.
    Noop,
}

/// Accumulates CRUD entries of the batch being built.
#[derive(Default)]
struct CudBuilder {
    order: Vec<Namespace>,
    jobs: HashMap<Namespace, (Vec<DocKey>, HashMap<DocKey, AnalyzedOp>)>,
}

impl CudBuilder {
    /// Adds `op`. Hands it back if it cannot be folded into this batch.
    fn push(&mut self, ns: &Namespace, op: AnalyzedOp) -> Result<(), AnalyzedOp> {
        if !self.jobs.contains_key(ns) {
            self.order.push(ns.clone());
        }
        let (keys, ops) = self.jobs.entry(ns.clone()).or_default();
        match ops.remove(op.key()) {
            None => {
                keys.push(op.key().clone());
                ops.insert(op.key().clone(), op);
                Ok(())
            }
            Some(prev) => match prev.and_then(op) {
                Ok(folded) => {
                    ops.insert(folded.key().clone(), folded);
                    Ok(())
                }
                Err((prev, next)) => {
                    ops.insert(prev.key().clone(), prev);
                    Err(next)
                }
            },
        }
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn build(&mut self) -> Option<CudBatch> {
        let order = std::mem::take(&mut self.order);
        let mut jobs = std::mem::take(&mut self.jobs);
        let built: Vec<NamespaceJob> = order
            .into_iter()
            .filter_map(|ns| {
                let (keys, mut ops) = jobs.remove(&ns)?;
                let ops: Vec<AnalyzedOp> = keys
                    .iter()
                    .filter_map(|k| ops.remove(k))
                    .filter(|op| *op.kind() != AnalyzedOpKind::Noop)
                    .collect();
                (!ops.is_empty()).then(|| NamespaceJob::new(ns, ops))
            })
            .collect();
        (!built.is_empty()).then(|| CudBatch::new(built))
    }
}

/// Splits entries into executable batches.
#[derive(Debug, Clone, Default)]
pub struct BatchAnalyzer {
    context: ApplierContext,
}

impl BatchAnalyzer {
    /// Creates an analyzer interpreting entries under `context`.
    pub fn new(context: ApplierContext) -> Self {
        Self { context }
    }

    /// Analyzes entries in oplog order.
    ///
    /// # Errors
    ///
    /// Fails on entries without a usable `_id` or with a malformed update.
    pub fn analyze(&self, ops: &[OplogOperation]) -> ReplResult<Vec<AnalyzedBatch>> {
        let mut out = Vec::new();
        let mut builder = CudBuilder::default();
        let mut saw_noop = false;

        for entry in ops {
            if entry.is_command() {
                if let Some(batch) = builder.build() {
                    out.push(AnalyzedBatch::Cud(batch));
                }
                out.push(AnalyzedBatch::Command(entry.clone()));
                continue;
            }
            let Some(analyzed) = AnalyzedOp::from_operation(entry, &self.context)? else {
                saw_noop = true;
                continue;
            };
            if let Err(rejected) = builder.push(&entry.namespace, analyzed) {
                trace!(
                    position = %entry.position,
                    key = %rejected.key(),
                    "operation cannot be folded, starting a new batch"
                );
                if let Some(batch) = builder.build() {
                    out.push(AnalyzedBatch::Cud(batch));
                }
                let accepted = builder.push(&entry.namespace, rejected);
                debug_assert!(accepted.is_ok(), "an empty batch accepts any operation");
            }
        }
        if !builder.is_empty() {
            if let Some(batch) = builder.build() {
                out.push(AnalyzedBatch::Cud(batch));
            }
        }
        if out.is_empty() && saw_noop {
            out.push(AnalyzedBatch::Noop);
        }
        Ok(out)
    }
}
