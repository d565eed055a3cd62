//! Fetching a bounded oplog window during recovery.

use relodb_oplog::{OplogBatch, Position};
use tracing::trace;

use crate::error::{ReplError, ReplResult};
use crate::fetcher::OplogFetcher;

/// Serves the entries after `from` of a window read with
/// [`RemoteClient::oplog_between`](super::RemoteClient::oplog_between).
///
/// The source returns the window with `from` included. The first entry
/// proves the source still has the oplog where the local state ends:
/// it must sit exactly at `from` and is not applied again.
pub struct WindowFetcher {
    inner: Box<dyn OplogFetcher>,
    from: Position,
    sync_source: String,
    started: bool,
}

impl WindowFetcher {
    /// Wraps the raw window reader.
    pub fn new(inner: Box<dyn OplogFetcher>, from: Position, sync_source: impl Into<String>) -> Self {
        Self {
            inner,
            from,
            sync_source: sync_source.into(),
            started: false,
        }
    }

    fn check_start(&self, batch: OplogBatch) -> ReplResult<OplogBatch> {
        let ready_for_more = batch.ready_for_more();
        let mut ops = batch.into_ops().into_iter();
        let Some(first) = ops.next() else {
            return Err(self.start_missing());
        };
        if first.position != self.from {
            return Err(ReplError::OplogWindowMismatch {
                expected: self.from,
                found: first.position,
            });
        }
        trace!(from = %self.from, "oplog window start verified");
        let rest: Vec<_> = ops.collect();
        if rest.is_empty() {
            return Ok(OplogBatch::empty(ready_for_more));
        }
        Ok(OplogBatch::new(rest, ready_for_more))
    }

    fn start_missing(&self) -> ReplError {
        ReplError::OplogStartMissing {
            sync_source: self.sync_source.clone(),
            from: self.from,
        }
    }
}

impl OplogFetcher for WindowFetcher {
    fn fetch(&mut self) -> ReplResult<Option<OplogBatch>> {
        if self.started {
            return self.inner.fetch();
        }
        loop {
            match self.inner.fetch()? {
                None => return Err(self.start_missing()),
                Some(batch) if batch.is_empty() => continue,
                Some(batch) => {
                    self.started = true;
                    return self.check_start(batch).map(Some);
                }
            }
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::VecOplogFetcher;
    use relodb_oplog::{Namespace, OplogOperation};

    fn noops(range: std::ops::RangeInclusive<i64>) -> Vec<OplogOperation> {
        range
            .map(|i| OplogOperation::noop(Position::new(1, i), i, Namespace::new("db", "c")))
            .collect()
    }

    fn window(ops: Vec<OplogOperation>, from: i64) -> WindowFetcher {
        WindowFetcher::new(Box::new(VecOplogFetcher::new(ops, 2)), Position::new(1, from), "primary:27017")
    }

    #[test]
    fn skips_the_start_entry() {
        let mut fetcher = window(noops(5..=9), 5);
        let mut seen = Vec::new();
        while let Some(batch) = fetcher.fetch().unwrap() {
            seen.extend(batch.ops().iter().map(|op| op.position.timestamp));
        }
        assert_eq!(seen, vec![6, 7, 8, 9]);
    }

    #[test]
    fn missing_or_shifted_start_is_retryable() {
        let err = window(Vec::new(), 5).fetch().unwrap_err();
        assert!(matches!(err, ReplError::OplogStartMissing { .. }));
        assert!(err.is_retryable());

        let err = window(noops(6..=9), 5).fetch().unwrap_err();
        assert!(matches!(
            err,
            ReplError::OplogWindowMismatch { found, .. } if found == Position::new(1, 6)
        ));
        assert!(err.is_retryable());
    }
}
