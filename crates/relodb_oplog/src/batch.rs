//! Raw oplog batches.

use crate::operation::OplogOperation;
use crate::position::Position;

/// Identity of the last entry a batch received from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpMark {
    /// Hash of the entry.
    pub hash: i64,
    /// Position of the entry.
    pub position: Position,
}

impl OpMark {
    /// Mark of an operation.
    pub fn of(op: &OplogOperation) -> Self {
        Self {
            hash: op.hash,
            position: op.position,
        }
    }
}

/// An ordered group of oplog entries as produced by a fetcher.
///
/// Besides its entries, a batch remembers the last entry it was built from
/// (its tail) even if filtering later removed that entry. The tail is what
/// the applier records as applied once the batch has been executed, so
/// filtered-out entries are never fetched again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OplogBatch {
    ops: Vec<OplogOperation>,
    ready_for_more: bool,
    tail: Option<OpMark>,
}

impl OplogBatch {
    /// Creates a batch. `ready_for_more` tells whether the source can
    /// immediately deliver more entries.
    pub fn new(ops: Vec<OplogOperation>, ready_for_more: bool) -> Self {
        let tail = ops.last().map(OpMark::of);
        Self {
            ops,
            ready_for_more,
            tail,
        }
    }

    /// Creates an empty batch.
    pub fn empty(ready_for_more: bool) -> Self {
        Self {
            ops: Vec::new(),
            ready_for_more,
            tail: None,
        }
    }

    /// The entries, in oplog order.
    pub fn ops(&self) -> &[OplogOperation] {
        &self.ops
    }

    /// Consumes the batch, returning its entries.
    pub fn into_ops(self) -> Vec<OplogOperation> {
        self.ops
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether the source can deliver more entries right away.
    pub fn ready_for_more(&self) -> bool {
        self.ready_for_more
    }

    /// Last entry received, filtered or not.
    pub fn tail(&self) -> Option<OpMark> {
        self.tail
    }

    /// Last entry still in the batch.
    pub fn last_operation(&self) -> Option<&OplogOperation> {
        self.ops.last()
    }

    /// Appends `next` to this batch. The result takes its readiness from
    /// `next`, and its tail from `next` when `next` has one.
    pub fn concat(mut self, next: OplogBatch) -> OplogBatch {
        self.ops.extend(next.ops);
        self.ready_for_more = next.ready_for_more;
        self.tail = next.tail.or(self.tail);
        self
    }

    /// Keeps the entries matching `keep`. The tail is unchanged.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&OplogOperation) -> bool,
    {
        self.ops.retain(keep);
    }

    /// Returns true if the batch carries nothing, not even a tail.
    pub fn is_void(&self) -> bool {
        self.ops.is_empty() && self.tail.is_none()
    }
}
