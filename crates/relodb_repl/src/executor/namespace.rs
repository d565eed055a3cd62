//! Execution of a single namespace job.

use std::collections::HashSet;
use std::sync::Arc;

use relodb_oplog::{DocKey, Document};
use tracing::debug;

use crate::analyzer::NamespaceJob;
use crate::context::MatchStrictness;
use crate::error::{Mismatch, ReplError, ReplResult};
use crate::metrics::ExecutorMetrics;
use crate::store::{Did, DocumentStore, WriteTransaction};

/// Attempts per job, the first one included, when the backend rolls back.
pub const MAX_ATTEMPTS: u32 = 2;

/// Applies namespace jobs in one write transaction each.
///
/// A job runs in five steps:
/// 1. resolve the dids of every operation that needs its target
/// 2. collect mismatches; in strict mode any mismatch aborts the job
///    before a single write
/// 3. load the documents updates are applied to
/// 4. delete every matched target that is rewritten or removed
/// 5. insert the computed documents
pub struct NamespaceJobExecutor {
    store: Arc<dyn DocumentStore>,
    metrics: Arc<ExecutorMetrics>,
}

impl NamespaceJobExecutor {
    /// Creates an executor.
    pub fn new(store: Arc<dyn DocumentStore>, metrics: Arc<ExecutorMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Applies `job`, redoing it once if the backend asks for a rollback.
    ///
    /// # Errors
    ///
    /// - [`ReplError::NamespaceJobExecution`] on mismatches in strict mode
    /// - [`ReplError::Rollback`] if the retry was rolled back too
    /// - any other backend error, unchanged
    pub fn apply(&self, job: &NamespaceJob, strictness: MatchStrictness) -> ReplResult<()> {
        let mut attempt = 1;
        loop {
            match self.try_apply(job, strictness) {
                Ok(()) => {
                    self.metrics.record_job(job.len());
                    return Ok(());
                }
                Err(e) if e.is_rollback() && attempt < MAX_ATTEMPTS => {
                    self.metrics.record_rollback();
                    debug!(
                        namespace = %job.namespace(),
                        attempt,
                        error = %e,
                        "rollback while applying namespace job, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_apply(&self, job: &NamespaceJob, strictness: MatchStrictness) -> ReplResult<()> {
        let mut txn = self.store.open_write_transaction()?;
        apply_in(job, txn.as_mut(), strictness)?;
        txn.commit()
    }
}

fn apply_in(
    job: &NamespaceJob,
    txn: &mut dyn WriteTransaction,
    strictness: MatchStrictness,
) -> ReplResult<()> {
    let ns = job.namespace();

    let keys: Vec<DocKey> = job
        .ops()
        .iter()
        .filter(|op| op.requires_to_fetch_id())
        .map(|op| op.key().clone())
        .collect();
    let dids = if keys.is_empty() {
        Default::default()
    } else {
        txn.find_dids(ns, &keys)?
    };

    let mismatches: Vec<Mismatch> = job
        .ops()
        .iter()
        .filter(|op| op.requires_match() && !dids.contains_key(op.key()))
        .map(|op| op.mismatch())
        .collect();
    if !mismatches.is_empty() {
        match strictness {
            MatchStrictness::Strict => {
                return Err(ReplError::NamespaceJobExecution {
                    database: job.database().to_string(),
                    collection: job.collection().to_string(),
                    mismatches,
                })
            }
            MatchStrictness::Lenient => debug!(
                namespace = %ns,
                count = mismatches.len(),
                "ignoring operations without a matching document"
            ),
        }
    }

    let to_fetch: Vec<Did> = job
        .ops()
        .iter()
        .filter(|op| op.requires_fetch())
        .filter_map(|op| dids.get(op.key()).copied())
        .collect();
    let fetched = if to_fetch.is_empty() {
        Default::default()
    } else {
        txn.fetch(ns, &to_fetch)?
    };

    let to_delete: Vec<Did> = job
        .ops()
        .iter()
        .filter(|op| op.deletes())
        .filter_map(|op| dids.get(op.key()).copied())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    txn.delete(ns, &to_delete)?;

    let mut inserts: Vec<Document> = Vec::new();
    for op in job.ops() {
        let did = dids.get(op.key());
        let prior = did.and_then(|d| fetched.get(d));
        if let Some(doc) = op.calculate_doc_to_insert(did.is_some(), prior)? {
            inserts.push(doc);
        }
    }
    txn.insert(ns, inserts)
}
