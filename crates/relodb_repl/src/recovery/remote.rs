//! Collaborators recovery talks to: topology, sync source connections and
//! the database cloner.

use std::fmt;
use std::sync::Arc;

use relodb_oplog::{Document, IndexSpec, Namespace, OplogOperation, Position};
use tracing::info;

use crate::error::ReplResult;
use crate::fetcher::OplogFetcher;
use crate::filter::ReplicationFilters;
use crate::store::DocumentStore;

/// A member that can serve as origin of the oplog.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncSource {
    /// Network address of the member.
    pub address: String,
}

impl SyncSource {
    /// Creates a sync source.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Chooses sync sources.
pub trait SyncSourceProvider: Send + Sync {
    /// Picks a sync source.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::NoSyncSource`](crate::ReplError::NoSyncSource)
    /// when no member qualifies.
    fn new_sync_source(&self) -> ReplResult<SyncSource>;
}

/// Opens connections to sync sources.
pub trait RemoteClientFactory: Send + Sync {
    /// Connects to `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Unreachable`](crate::ReplError::Unreachable)
    /// when the source cannot be reached.
    fn connect(&self, source: &SyncSource) -> ReplResult<Box<dyn RemoteClient>>;
}

/// A connection to a sync source.
pub trait RemoteClient: Send {
    /// The source this client is connected to.
    fn sync_source(&self) -> &SyncSource;

    /// Databases of the source.
    fn list_databases(&self) -> ReplResult<Vec<String>>;

    /// Collections of a database of the source.
    fn list_collections(&self, database: &str) -> ReplResult<Vec<String>>;

    /// Every document of a collection of the source.
    fn scan(&self, ns: &Namespace) -> ReplResult<Vec<Document>>;

    /// Indexes of a collection of the source.
    fn list_indexes(&self, ns: &Namespace) -> ReplResult<Vec<IndexSpec>>;

    /// Newest entry of the source's oplog.
    fn last_op(&self) -> ReplResult<OplogOperation>;

    /// Reads the oplog entries with `from <= position <= to`.
    fn oplog_between(&self, from: Position, to: Position) -> ReplResult<Box<dyn OplogFetcher>>;

    /// Closes the connection.
    fn close(&mut self) {}
}

/// What a database clone copies.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    /// Collections and indexes that are replicated.
    pub filters: Arc<ReplicationFilters>,
    /// Whether indexes are created while cloning.
    pub clone_indexes: bool,
}

impl CloneOptions {
    /// Clones whatever `filters` replicate, indexes included.
    pub fn new(filters: Arc<ReplicationFilters>) -> Self {
        Self {
            filters,
            clone_indexes: true,
        }
    }
}

/// Copies databases from a sync source.
pub trait DbCloner: Send + Sync {
    /// Copies one database into `local`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Cloning`](crate::ReplError::Cloning) on failure.
    fn clone_database(
        &self,
        database: &str,
        remote: &dyn RemoteClient,
        local: &Arc<dyn DocumentStore>,
        options: &CloneOptions,
    ) -> ReplResult<()>;

    /// Rebuilds indexes deferred while cloning.
    ///
    /// # Errors
    ///
    /// Implementations fail like [`clone_database`](Self::clone_database).
    fn rebuild_indexes(&self, _local: &Arc<dyn DocumentStore>) -> ReplResult<()> {
        info!("no deferred indexes to rebuild");
        Ok(())
    }
}
