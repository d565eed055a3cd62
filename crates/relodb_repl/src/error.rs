//! Error types for the replication engine.

use std::fmt;

use relodb_oplog::{DocKey, OplogError, Position};
use thiserror::Error;

/// Result type for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// An operation whose required target document was not found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Key of the missing document.
    pub key: DocKey,
    /// Kind of the analyzed operation that needed it.
    pub kind: &'static str,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of _id {} matched no document", self.kind, self.key)
    }
}

/// Errors that can occur while replicating.
#[derive(Error, Debug)]
pub enum ReplError {
    /// The backend asks for the transaction to be redone.
    #[error("rollback required: {reason}")]
    Rollback {
        /// Why the backend rolled back.
        reason: String,
    },

    /// The backend refused a write because of the data itself.
    #[error("user error: {0}")]
    User(String),

    /// An insert collided with an existing document or unique index entry.
    #[error("duplicate key {key} in {namespace}")]
    DuplicateKey {
        /// Namespace of the collision.
        namespace: String,
        /// Offending key.
        key: String,
    },

    /// Operations that required an existing document found none.
    #[error(
        "namespace job on {database}.{collection} failed: {} operation(s) matched no document",
        mismatches.len()
    )]
    NamespaceJobExecution {
        /// Database of the job.
        database: String,
        /// Collection of the job.
        collection: String,
        /// The failed matches.
        mismatches: Vec<Mismatch>,
    },

    /// A checkpoint handle was used after it was closed.
    #[error("checkpoint handle is closed")]
    ClosedHandle,

    /// The replication checkpoint could not be written or read.
    #[error("failed to persist replication state: {reason}")]
    Persist {
        /// Underlying failure.
        reason: String,
    },

    /// An advance would move the checkpoint backwards.
    #[error("checkpoint cannot move back from {current} to {requested}")]
    NonMonotonicCheckpoint {
        /// Stored position.
        current: Position,
        /// Rejected position.
        requested: Position,
    },

    /// An operation the engine cannot apply.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Reading from the oplog source failed.
    #[error("fetch error: {message}")]
    Fetch {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote oplog has no entries for the requested window.
    #[error("oplog window starting at {from} is missing on {sync_source}")]
    OplogStartMissing {
        /// Address of the sync source.
        sync_source: String,
        /// Requested start.
        from: Position,
    },

    /// The remote oplog does not start where the local state ends.
    #[error("remote oplog starts at {found}, expected {expected}")]
    OplogWindowMismatch {
        /// Expected first position.
        expected: Position,
        /// First position the source returned.
        found: Position,
    },

    /// No member can serve as sync source.
    #[error("no sync source available")]
    NoSyncSource,

    /// The sync source could not be reached.
    #[error("sync source {address} is unreachable: {reason}")]
    Unreachable {
        /// Address of the sync source.
        address: String,
        /// Connection failure.
        reason: String,
    },

    /// Copying a database from the sync source failed.
    #[error("cloning database {database} failed: {reason}")]
    Cloning {
        /// Database being cloned.
        database: String,
        /// Failure.
        reason: String,
    },

    /// The job was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The worker pool rejected or lost work.
    #[error("worker pool error: {0}")]
    WorkerPool(String),

    /// A pipeline stage stopped abnormally.
    #[error("{stage} stage failed: {reason}")]
    Stage {
        /// Stage name.
        stage: &'static str,
        /// Failure description.
        reason: String,
    },

    /// Oplog model error.
    #[error(transparent)]
    Oplog(#[from] OplogError),

    /// JSON encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ReplError {
    /// Creates a rollback request.
    pub fn rollback(reason: impl Into<String>) -> Self {
        Self::Rollback {
            reason: reason.into(),
        }
    }

    /// Creates a user-level error.
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    /// Creates a retryable fetch error.
    pub fn fetch_retryable(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable fetch error.
    pub fn fetch_fatal(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a persistence error.
    pub fn persist(reason: impl fmt::Display) -> Self {
        Self::Persist {
            reason: reason.to_string(),
        }
    }

    /// Returns true if the backend asked for the transaction to be redone.
    pub fn is_rollback(&self) -> bool {
        matches!(self, ReplError::Rollback { .. })
    }

    /// Returns true if this error is the result of cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ReplError::Cancelled)
    }

    /// Returns true if a full recovery attempt may succeed after this error.
    ///
    /// This covers transient source problems, backend rollbacks and
    /// operations the engine cannot apply (a new recovery may start past
    /// them).
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplError::Rollback { .. }
            | ReplError::UnsupportedOperation(_)
            | ReplError::OplogStartMissing { .. }
            | ReplError::OplogWindowMismatch { .. }
            | ReplError::NoSyncSource
            | ReplError::Unreachable { .. }
            | ReplError::Cloning { .. } => true,
            ReplError::Fetch { retryable, .. } => *retryable,
            ReplError::Oplog(e) => e.is_unsupported(),
            _ => false,
        }
    }

    /// Returns true if no retry can help and replication must stop.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !self.is_cancellation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_errors() {
        assert!(ReplError::rollback("conflict").is_retryable());
        assert!(ReplError::fetch_retryable("connection reset").is_retryable());
        assert!(!ReplError::fetch_fatal("bad cursor").is_retryable());
        assert!(ReplError::NoSyncSource.is_retryable());
        assert!(ReplError::Oplog(OplogError::UnsupportedCommand("applyOps".into())).is_retryable());
        assert!(!ReplError::Oplog(OplogError::InvalidNamespace("x".into())).is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(ReplError::persist("disk full").is_fatal());
        assert!(ReplError::user("bad doc").is_fatal());
        assert!(ReplError::NonMonotonicCheckpoint {
            current: Position::new(1, 5),
            requested: Position::new(1, 4),
        }
        .is_fatal());
        assert!(!ReplError::Cancelled.is_fatal());
        assert!(ReplError::Cancelled.is_cancellation());
    }

    #[test]
    fn error_display() {
        let err = ReplError::NamespaceJobExecution {
            database: "shop".into(),
            collection: "orders".into(),
            mismatches: vec![Mismatch {
                key: DocKey::from_id(&json!(1)),
                kind: "delete",
            }],
        };
        assert_eq!(
            err.to_string(),
            "namespace job on shop.orders failed: 1 operation(s) matched no document"
        );
        if let ReplError::NamespaceJobExecution { mismatches, .. } = &err {
            assert_eq!(mismatches[0].to_string(), "delete of _id 1 matched no document");
        }
    }
}
