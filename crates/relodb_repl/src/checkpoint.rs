//! Replication checkpoint.
//!
//! The checkpoint is the `(hash, position)` of the last oplog entry whose
//! effects are durable locally. It lives in memory behind a reader/writer
//! lock and is mirrored to a single document in the reserved metadata
//! database.
//!
//! ## Key Invariants
//!
//! - Persistence happens before the in-memory value changes; a failed write
//!   leaves the previous value in place
//! - [`CheckpointWriteHandle::advance`] never moves the position backwards
//! - A write handle excludes every other handle until it is closed

use std::sync::Arc;
use std::thread;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use relodb_oplog::{DocKey, Namespace, Position, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::CheckpointConfig;
use crate::error::{ReplError, ReplResult};
use crate::store::{DocumentStore, CHECKPOINT_COLLECTION, RESERVED_DATABASE};

const CHECKPOINT_ID: &str = "lastAppliedOplogEntry";

/// The last applied oplog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Hash of the entry.
    pub hash: i64,
    /// Position of the entry.
    pub position: Position,
}

impl Checkpoint {
    /// State before anything was applied.
    pub const INITIAL: Checkpoint = Checkpoint {
        hash: 0,
        position: Position::EPOCH,
    };
}

#[derive(Serialize, Deserialize)]
struct CheckpointRow {
    #[serde(rename = "_id")]
    id: String,
    #[serde(flatten)]
    checkpoint: Checkpoint,
}

/// Holds the replication checkpoint.
pub struct CheckpointStore {
    store: Arc<dyn DocumentStore>,
    config: CheckpointConfig,
    state: RwLock<Checkpoint>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Opens the checkpoint, loading the persisted value or
    /// [`Checkpoint::INITIAL`] when none exists.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Persist`] if the stored value cannot be read.
    pub fn open(store: Arc<dyn DocumentStore>, config: CheckpointConfig) -> ReplResult<Self> {
        let loaded = load(store.as_ref()).map_err(ReplError::persist)?;
        info!(position = %loaded.position, hash = loaded.hash, "loaded replication checkpoint");
        Ok(Self {
            store,
            config,
            state: RwLock::new(loaded),
        })
    }

    /// Opens a read handle. Blocks while a write handle is open.
    pub fn open_read(&self) -> CheckpointReadHandle<'_> {
        CheckpointReadHandle {
            guard: Some(self.state.read()),
        }
    }

    /// Opens the write handle. Blocks while any other handle is open.
    pub fn open_write(&self) -> CheckpointWriteHandle<'_> {
        CheckpointWriteHandle {
            owner: self,
            guard: Some(self.state.write()),
        }
    }

    /// Current checkpoint, read through a short-lived handle.
    pub fn current(&self) -> Checkpoint {
        *self.state.read()
    }

    fn namespace() -> Namespace {
        Namespace::new(RESERVED_DATABASE, CHECKPOINT_COLLECTION)
    }

    fn persist(&self, checkpoint: Checkpoint) -> ReplResult<()> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match write_row(self.store.as_ref(), checkpoint) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_rollback() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    debug!(attempt, error = %e, "retrying checkpoint write after rollback");
                    thread::sleep(retry.delay_for_attempt(attempt));
                }
                Err(e) => {
                    warn!(error = %e, "could not persist replication checkpoint");
                    return Err(ReplError::persist(e));
                }
            }
        }
    }
}

fn load(store: &dyn DocumentStore) -> ReplResult<Checkpoint> {
    let ns = CheckpointStore::namespace();
    let key = DocKey::from_id(&Value::from(CHECKPOINT_ID));
    let txn = store.open_read_transaction()?;
    let dids = txn.find_dids(&ns, std::slice::from_ref(&key))?;
    let Some(did) = dids.get(&key) else {
        return Ok(Checkpoint::INITIAL);
    };
    let mut docs = txn.fetch(&ns, &[*did])?;
    match docs.remove(did) {
        Some(doc) => Ok(serde_json::from_value::<CheckpointRow>(doc)?.checkpoint),
        None => Ok(Checkpoint::INITIAL),
    }
}

fn write_row(store: &dyn DocumentStore, checkpoint: Checkpoint) -> ReplResult<()> {
    let ns = CheckpointStore::namespace();
    let key = DocKey::from_id(&json!(CHECKPOINT_ID));
    let row = serde_json::to_value(CheckpointRow {
        id: CHECKPOINT_ID.to_string(),
        checkpoint,
    })?;
    debug_assert_eq!(row.get(ID_FIELD), Some(&json!(CHECKPOINT_ID)));

    let mut txn = store.open_write_transaction()?;
    let dids: Vec<_> = txn
        .find_dids(&ns, std::slice::from_ref(&key))?
        .into_values()
        .collect();
    txn.delete(&ns, &dids)?;
    txn.insert(&ns, vec![row])?;
    txn.commit()
}

/// Shared access to the checkpoint.
pub struct CheckpointReadHandle<'a> {
    guard: Option<RwLockReadGuard<'a, Checkpoint>>,
}

impl CheckpointReadHandle<'_> {
    fn get(&self) -> ReplResult<&Checkpoint> {
        self.guard.as_deref().ok_or(ReplError::ClosedHandle)
    }

    /// Hash of the last applied entry.
    pub fn last_hash(&self) -> ReplResult<i64> {
        Ok(self.get()?.hash)
    }

    /// Position of the last applied entry.
    pub fn last_position(&self) -> ReplResult<Position> {
        Ok(self.get()?.position)
    }

    /// The whole checkpoint.
    pub fn checkpoint(&self) -> ReplResult<Checkpoint> {
        self.get().copied()
    }

    /// Releases the handle. Closing twice is harmless.
    pub fn close(&mut self) {
        self.guard = None;
    }
}

/// Exclusive access to the checkpoint.
pub struct CheckpointWriteHandle<'a> {
    owner: &'a CheckpointStore,
    guard: Option<RwLockWriteGuard<'a, Checkpoint>>,
}

impl CheckpointWriteHandle<'_> {
    fn get(&self) -> ReplResult<&Checkpoint> {
        self.guard.as_deref().ok_or(ReplError::ClosedHandle)
    }

    fn set(&mut self, checkpoint: Checkpoint) -> ReplResult<()> {
        let guard = self.guard.as_mut().ok_or(ReplError::ClosedHandle)?;
        self.owner.persist(checkpoint)?;
        **guard = checkpoint;
        Ok(())
    }

    /// Hash of the last applied entry.
    pub fn last_hash(&self) -> ReplResult<i64> {
        Ok(self.get()?.hash)
    }

    /// Position of the last applied entry.
    pub fn last_position(&self) -> ReplResult<Position> {
        Ok(self.get()?.position)
    }

    /// Records a newer applied entry.
    ///
    /// # Errors
    ///
    /// - [`ReplError::NonMonotonicCheckpoint`] if `position` is older than
    ///   the current one
    /// - [`ReplError::Persist`] if the value could not be stored; the
    ///   checkpoint is unchanged
    pub fn advance(&mut self, hash: i64, position: Position) -> ReplResult<()> {
        let current = self.get()?.position;
        if position < current {
            return Err(ReplError::NonMonotonicCheckpoint {
                current,
                requested: position,
            });
        }
        self.set(Checkpoint { hash, position })
    }

    /// Stores a value without the monotonicity check. Used by recovery,
    /// where the checkpoint is re-based on the sync source.
    pub fn force(&mut self, hash: i64, position: Position) -> ReplResult<()> {
        self.set(Checkpoint { hash, position })
    }

    /// Goes back to [`Checkpoint::INITIAL`].
    pub fn reset(&mut self) -> ReplResult<()> {
        self.set(Checkpoint::INITIAL)
    }

    /// Releases the handle. Closing twice is harmless.
    pub fn close(&mut self) {
        self.guard = None;
    }
}
