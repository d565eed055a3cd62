//! In-memory sync source and cloner.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use relodb_oplog::{Document, IndexSpec, Namespace, OplogOperation, Position};
use tracing::debug;

use super::remote::{
    CloneOptions, DbCloner, RemoteClient, RemoteClientFactory, SyncSource, SyncSourceProvider,
};
use crate::error::{ReplError, ReplResult};
use crate::fetcher::{OplogFetcher, VecOplogFetcher};
use crate::store::{DocumentStore, MemoryDocumentStore};

const WINDOW_BATCH_SIZE: usize = 128;

/// A simulated primary: a document store plus its oplog.
///
/// The data and the oplog are set independently, so tests decide how far
/// the data is ahead of the oplog position a clone starts from. Answers of
/// [`RemoteClient::last_op`] can be scripted to move the tail between
/// recovery steps.
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    source: SyncSource,
    data: MemoryDocumentStore,
    oplog: Mutex<Vec<OplogOperation>>,
    tails: Mutex<VecDeque<Position>>,
    missing_sources: AtomicU32,
    refused_connections: AtomicU32,
}

impl MemoryRemote {
    /// Creates an empty remote reachable at `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                source: SyncSource::new(address),
                data: MemoryDocumentStore::new(),
                oplog: Mutex::new(Vec::new()),
                tails: Mutex::new(VecDeque::new()),
                missing_sources: AtomicU32::new(0),
                refused_connections: AtomicU32::new(0),
            }),
        }
    }

    /// Documents served to the cloner.
    pub fn data(&self) -> &MemoryDocumentStore {
        &self.inner.data
    }

    /// Appends entries to the oplog. Entries must be in position order.
    pub fn append(&self, ops: impl IntoIterator<Item = OplogOperation>) {
        self.inner.oplog.lock().extend(ops);
    }

    /// Forgets the entries before `position`.
    pub fn truncate_before(&self, position: Position) {
        self.inner.oplog.lock().retain(|op| op.position >= position);
    }

    /// Scripts the next answers of `last_op`; once they are used up the
    /// newest entry is returned.
    pub fn script_tails(&self, tails: impl IntoIterator<Item = Position>) {
        self.inner.tails.lock().extend(tails);
    }

    /// Makes the next `count` sync source selections fail.
    pub fn fail_source_selection(&self, count: u32) {
        self.inner.missing_sources.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` connections fail.
    pub fn refuse_connections(&self, count: u32) {
        self.inner.refused_connections.store(count, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl SyncSourceProvider for MemoryRemote {
    fn new_sync_source(&self) -> ReplResult<SyncSource> {
        if take_one(&self.inner.missing_sources) {
            return Err(ReplError::NoSyncSource);
        }
        Ok(self.inner.source.clone())
    }
}

impl RemoteClientFactory for MemoryRemote {
    fn connect(&self, source: &SyncSource) -> ReplResult<Box<dyn RemoteClient>> {
        if *source != self.inner.source {
            return Err(ReplError::Unreachable {
                address: source.address.clone(),
                reason: "unknown member".into(),
            });
        }
        if take_one(&self.inner.refused_connections) {
            return Err(ReplError::Unreachable {
                address: source.address.clone(),
                reason: "connection refused".into(),
            });
        }
        debug!(source = %source, "connected to in-memory sync source");
        Ok(Box::new(MemoryRemoteClient {
            remote: self.clone(),
        }))
    }
}

struct MemoryRemoteClient {
    remote: MemoryRemote,
}

impl RemoteClient for MemoryRemoteClient {
    fn sync_source(&self) -> &SyncSource {
        &self.remote.inner.source
    }

    fn list_databases(&self) -> ReplResult<Vec<String>> {
        self.remote.data().open_read_transaction()?.list_databases()
    }

    fn list_collections(&self, database: &str) -> ReplResult<Vec<String>> {
        self.remote
            .data()
            .open_read_transaction()?
            .list_collections(database)
    }

    fn scan(&self, ns: &Namespace) -> ReplResult<Vec<Document>> {
        self.remote.data().open_read_transaction()?.scan(ns)
    }

    fn list_indexes(&self, ns: &Namespace) -> ReplResult<Vec<IndexSpec>> {
        self.remote.data().open_read_transaction()?.list_indexes(ns)
    }

    fn last_op(&self) -> ReplResult<OplogOperation> {
        let oplog = self.remote.inner.oplog.lock();
        let scripted = self.remote.inner.tails.lock().pop_front();
        let found = match scripted {
            Some(position) => oplog.iter().find(|op| op.position == position),
            None => oplog.last(),
        };
        found
            .cloned()
            .ok_or_else(|| ReplError::fetch_retryable("sync source has no oplog entry at its tail"))
    }

    fn oplog_between(&self, from: Position, to: Position) -> ReplResult<Box<dyn OplogFetcher>> {
        let window: Vec<OplogOperation> = self
            .remote
            .inner
            .oplog
            .lock()
            .iter()
            .filter(|op| op.position >= from && op.position <= to)
            .cloned()
            .collect();
        Ok(Box::new(VecOplogFetcher::new(window, WINDOW_BATCH_SIZE)))
    }
}

/// Copies collections document by document, creating indexes as it goes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryCloner;

impl MemoryCloner {
    fn copy(
        database: &str,
        remote: &dyn RemoteClient,
        local: &dyn DocumentStore,
        options: &CloneOptions,
    ) -> ReplResult<usize> {
        let mut copied = 0;
        let mut txn = local.open_write_transaction()?;
        for collection in remote.list_collections(database)? {
            let ns = Namespace::new(database, collection);
            if !options.filters.namespace_filter(&ns) {
                debug!(namespace = %ns, "collection excluded from clone");
                continue;
            }
            txn.create_collection(&ns)?;
            let docs = remote.scan(&ns)?;
            copied += docs.len();
            txn.insert(&ns, docs)?;
            if options.clone_indexes {
                for index in remote.list_indexes(&ns)? {
                    if index.name != IndexSpec::ID_INDEX && options.filters.index_filter(&ns, &index.name)
                    {
                        txn.create_index(&ns, &index)?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(copied)
    }
}

impl DbCloner for MemoryCloner {
    fn clone_database(
        &self,
        database: &str,
        remote: &dyn RemoteClient,
        local: &Arc<dyn DocumentStore>,
        options: &CloneOptions,
    ) -> ReplResult<()> {
        let copied = Self::copy(database, remote, local.as_ref(), options).map_err(|e| {
            ReplError::Cloning {
                database: database.to_string(),
                reason: e.to_string(),
            }
        })?;
        debug!(database, documents = copied, "database cloned");
        Ok(())
    }
}
