//! The replica consistency flag.

use std::sync::Arc;

use parking_lot::Mutex;
use relodb_oplog::{DocKey, Namespace};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ReplError, ReplResult};
use crate::store::{DocumentStore, CONSISTENCY_COLLECTION, RESERVED_DATABASE};

const CONSISTENCY_ID: &str = "consistent";

/// Tracks whether the local data is a consistent copy of the sync source.
pub trait ConsistencyHandler: Send + Sync {
    /// Current value of the flag.
    fn is_consistent(&self) -> bool;

    /// Stores a new value of the flag.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Persist`] if the value could not be stored.
    fn set_consistent(&self, consistent: bool) -> ReplResult<()>;
}

/// Keeps the flag in the reserved metadata database, cached in memory.
pub struct StoredConsistencyHandler {
    store: Arc<dyn DocumentStore>,
    cached: Mutex<bool>,
}

impl StoredConsistencyHandler {
    /// Loads the stored flag. A replica that never recorded it is
    /// inconsistent.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Persist`] if the flag cannot be read.
    pub fn open(store: Arc<dyn DocumentStore>) -> ReplResult<Self> {
        let consistent = read_flag(store.as_ref()).map_err(ReplError::persist)?;
        debug!(consistent, "loaded consistency flag");
        Ok(Self {
            store,
            cached: Mutex::new(consistent),
        })
    }
}

impl ConsistencyHandler for StoredConsistencyHandler {
    fn is_consistent(&self) -> bool {
        *self.cached.lock()
    }

    fn set_consistent(&self, consistent: bool) -> ReplResult<()> {
        let mut cached = self.cached.lock();
        write_flag(self.store.as_ref(), consistent).map_err(|e| {
            warn!(error = %e, consistent, "could not persist consistency flag");
            ReplError::persist(e)
        })?;
        *cached = consistent;
        Ok(())
    }
}

fn namespace() -> Namespace {
    Namespace::new(RESERVED_DATABASE, CONSISTENCY_COLLECTION)
}

fn read_flag(store: &dyn DocumentStore) -> ReplResult<bool> {
    let ns = namespace();
    let key = DocKey::from_id(&json!(CONSISTENCY_ID));
    let txn = store.open_read_transaction()?;
    let dids = txn.find_dids(&ns, std::slice::from_ref(&key))?;
    let Some(did) = dids.get(&key) else {
        return Ok(false);
    };
    let docs = txn.fetch(&ns, &[*did])?;
    Ok(docs
        .get(did)
        .and_then(|doc| doc.get("value"))
        .and_then(Value::as_bool)
        .unwrap_or(false))
}

fn write_flag(store: &dyn DocumentStore, consistent: bool) -> ReplResult<()> {
    let ns = namespace();
    let key = DocKey::from_id(&json!(CONSISTENCY_ID));
    let mut txn = store.open_write_transaction()?;
    let dids: Vec<_> = txn
        .find_dids(&ns, std::slice::from_ref(&key))?
        .into_values()
        .collect();
    txn.delete(&ns, &dids)?;
    txn.insert(&ns, vec![json!({"_id": CONSISTENCY_ID, "value": consistent})])?;
    txn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;

    #[test]
    fn flag_survives_reopen() {
        let store = MemoryDocumentStore::new();
        let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());
        let handler = StoredConsistencyHandler::open(Arc::clone(&shared)).unwrap();
        assert!(!handler.is_consistent());
        handler.set_consistent(true).unwrap();
        assert!(handler.is_consistent());

        let reopened = StoredConsistencyHandler::open(shared).unwrap();
        assert!(reopened.is_consistent());
        assert!(store.dump().is_empty());
    }

    #[test]
    fn failed_write_keeps_cached_value() {
        let store = MemoryDocumentStore::new();
        let handler = StoredConsistencyHandler::open(Arc::new(store.clone())).unwrap();
        store.fail_writes_to(namespace());
        let err = handler.set_consistent(true).unwrap_err();
        assert!(matches!(err, ReplError::Persist { .. }));
        assert!(!handler.is_consistent());
    }
}
