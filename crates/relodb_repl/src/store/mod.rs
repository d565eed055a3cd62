//! Transactional document store abstraction.
//!
//! The replication engine never talks to a concrete database. Everything it
//! writes goes through a [`DocumentStore`], which hands out read and write
//! transactions over collections of JSON documents. Each stored document is
//! addressed internally by a [`Did`], and the store maintains an `_id` index
//! so operations can translate document keys into dids.

mod memory;

pub use memory::MemoryDocumentStore;

use std::collections::HashMap;

use relodb_oplog::{DocKey, Document, IndexSpec, Namespace};

use crate::error::ReplResult;

/// Internal identifier of a stored document.
pub type Did = u64;

/// Database holding replication metadata. It is never replicated, dropped
/// or cloned.
pub const RESERVED_DATABASE: &str = "relodb";

/// Collection storing the last applied oplog entry.
pub const CHECKPOINT_COLLECTION: &str = "oplog.replication";

/// Collection storing the consistency flag.
pub const CONSISTENCY_COLLECTION: &str = "repl.state";

/// A transactional store of JSON documents.
///
/// # Invariants
///
/// - A write transaction's effects become visible atomically on commit
/// - Dropping an uncommitted write transaction discards its effects
/// - Implementations must be `Send + Sync`; many transactions may be open
///   at once from different threads
pub trait DocumentStore: Send + Sync {
    /// Opens a read transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start a transaction.
    fn open_read_transaction(&self) -> ReplResult<Box<dyn ReadTransaction + '_>>;

    /// Opens a write transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start a transaction.
    fn open_write_transaction(&self) -> ReplResult<Box<dyn WriteTransaction + '_>>;
}

/// Read access to the store.
pub trait ReadTransaction: Send {
    /// Resolves document keys to dids. Keys with no document are absent
    /// from the result.
    fn find_dids(&self, ns: &Namespace, keys: &[DocKey]) -> ReplResult<HashMap<DocKey, Did>>;

    /// Loads documents by did. Unknown dids are absent from the result.
    fn fetch(&self, ns: &Namespace, dids: &[Did]) -> ReplResult<HashMap<Did, Document>>;

    /// Every document of a collection, in did order.
    fn scan(&self, ns: &Namespace) -> ReplResult<Vec<Document>>;

    /// Names of all databases.
    fn list_databases(&self) -> ReplResult<Vec<String>>;

    /// Names of the collections of a database.
    fn list_collections(&self, database: &str) -> ReplResult<Vec<String>>;

    /// Secondary indexes of a collection.
    fn list_indexes(&self, ns: &Namespace) -> ReplResult<Vec<IndexSpec>>;

    /// Returns true if the collection exists.
    fn collection_exists(&self, ns: &Namespace) -> ReplResult<bool> {
        Ok(self
            .list_collections(ns.database())?
            .iter()
            .any(|c| c == ns.collection()))
    }
}

/// Write access to the store.
///
/// Reads through a write transaction observe committed state only; writes
/// are applied, in the order they were issued, when [`commit`] succeeds.
///
/// [`commit`]: WriteTransaction::commit
pub trait WriteTransaction: ReadTransaction {
    /// Deletes documents by did.
    fn delete(&mut self, ns: &Namespace, dids: &[Did]) -> ReplResult<()>;

    /// Inserts documents, creating the collection if needed.
    fn insert(&mut self, ns: &Namespace, docs: Vec<Document>) -> ReplResult<()>;

    /// Creates a collection. Creating an existing collection is a no-op.
    fn create_collection(&mut self, ns: &Namespace) -> ReplResult<()>;

    /// Drops a collection. Commit reports nothing if it is absent; the
    /// returned flag tells whether it existed when the call was made.
    fn drop_collection(&mut self, ns: &Namespace) -> ReplResult<bool>;

    /// Drops a database and all its collections.
    fn drop_database(&mut self, database: &str) -> ReplResult<bool>;

    /// Renames a collection within its database.
    fn rename_collection(
        &mut self,
        from: &Namespace,
        to: &Namespace,
        drop_target: bool,
    ) -> ReplResult<()>;

    /// Creates a secondary index. An index with the same name is replaced.
    fn create_index(&mut self, ns: &Namespace, index: &IndexSpec) -> ReplResult<()>;

    /// Drops a secondary index, returning whether it existed.
    fn drop_index(&mut self, ns: &Namespace, name: &str) -> ReplResult<bool>;

    /// Makes every write of this transaction visible.
    ///
    /// # Errors
    ///
    /// [`ReplError::Rollback`](crate::ReplError::Rollback) asks the caller
    /// to redo the whole transaction. Other errors are final.
    fn commit(self: Box<Self>) -> ReplResult<()>;
}
