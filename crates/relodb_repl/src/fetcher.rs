//! Oplog fetchers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relodb_oplog::{OplogBatch, OplogOperation};

use crate::error::{ReplError, ReplResult};

/// Pull-based reader of a remote oplog.
///
/// `fetch` returns `Ok(None)` once the end known when the fetcher was
/// opened is reached. The pipeline calls `close` exactly once, whatever
/// the outcome of the run.
pub trait OplogFetcher: Send {
    /// Returns the next batch, or `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Implementations return [`ReplError::Fetch`] for source failures.
    fn fetch(&mut self) -> ReplResult<Option<OplogBatch>>;

    /// Releases the underlying cursor.
    fn close(&mut self) {}
}

impl<F: OplogFetcher + ?Sized> OplogFetcher for Box<F> {
    fn fetch(&mut self) -> ReplResult<Option<OplogBatch>> {
        (**self).fetch()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Serves a fixed list of entries in batches.
///
/// Every batch but the last is marked ready for more. An error can be
/// injected after a number of batches.
#[derive(Debug)]
pub struct VecOplogFetcher {
    remaining: VecDeque<OplogOperation>,
    batch_size: usize,
    served: usize,
    fail_after: Option<(usize, ReplError)>,
    closed: Arc<AtomicUsize>,
}

impl VecOplogFetcher {
    /// Creates a fetcher serving `ops` in batches of `batch_size`.
    pub fn new(ops: Vec<OplogOperation>, batch_size: usize) -> Self {
        Self {
            remaining: ops.into(),
            batch_size: batch_size.max(1),
            served: 0,
            fail_after: None,
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails with `error` once `batches` batches were served.
    pub fn fail_after(mut self, batches: usize, error: ReplError) -> Self {
        self.fail_after = Some((batches, error));
        self
    }

    /// Counter of `close` calls, readable after the fetcher moved away.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closed)
    }
}

impl OplogFetcher for VecOplogFetcher {
    fn fetch(&mut self) -> ReplResult<Option<OplogBatch>> {
        if matches!(&self.fail_after, Some((after, _)) if *after <= self.served) {
            if let Some((_, error)) = self.fail_after.take() {
                return Err(error);
            }
        }
        if self.remaining.is_empty() {
            return Ok(None);
        }
        let take = self.batch_size.min(self.remaining.len());
        let ops: Vec<OplogOperation> = self.remaining.drain(..take).collect();
        self.served += 1;
        Ok(Some(OplogBatch::new(ops, !self.remaining.is_empty())))
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relodb_oplog::{Namespace, Position};

    fn noops(n: i64) -> Vec<OplogOperation> {
        (1..=n)
            .map(|i| OplogOperation::noop(Position::new(1, i), i, Namespace::new("db", "c")))
            .collect()
    }

    #[test]
    fn serves_batches_then_end() {
        let mut fetcher = VecOplogFetcher::new(noops(5), 2);
        let sizes: Vec<(usize, bool)> = std::iter::from_fn(|| fetcher.fetch().unwrap())
            .map(|b| (b.len(), b.ready_for_more()))
            .collect();
        assert_eq!(sizes, vec![(2, true), (2, true), (1, false)]);
        assert!(fetcher.fetch().unwrap().is_none());
    }

    #[test]
    fn injected_error_and_close_counter() {
        let mut fetcher =
            VecOplogFetcher::new(noops(5), 2).fail_after(1, ReplError::fetch_retryable("reset"));
        let closed = fetcher.close_counter();
        assert!(fetcher.fetch().unwrap().is_some());
        assert!(fetcher.fetch().unwrap_err().is_retryable());
        let mut boxed: Box<dyn OplogFetcher> = Box::new(fetcher);
        boxed.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
