//! In-memory document store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use relodb_oplog::{DocKey, Document, IndexSpec, Namespace};
use serde_json::Value;
use tracing::trace;

use super::{Did, DocumentStore, ReadTransaction, WriteTransaction, RESERVED_DATABASE};
use crate::error::{ReplError, ReplResult};

#[derive(Debug, Clone, Default)]
struct Collection {
    docs: BTreeMap<Did, Document>,
    ids: HashMap<DocKey, Did>,
    indexes: BTreeMap<String, IndexSpec>,
}

type Database = BTreeMap<String, Collection>;

#[derive(Debug, Default)]
struct State {
    databases: BTreeMap<String, Database>,
}

impl State {
    fn collection(&self, ns: &Namespace) -> Option<&Collection> {
        self.databases.get(ns.database())?.get(ns.collection())
    }
}

#[derive(Debug)]
enum Pending {
    Delete { ns: Namespace, dids: Vec<Did> },
    Insert { ns: Namespace, docs: Vec<Document> },
    CreateCollection(Namespace),
    DropCollection(Namespace),
    DropDatabase(String),
    Rename {
        from: Namespace,
        to: Namespace,
        drop_target: bool,
    },
    CreateIndex { ns: Namespace, index: IndexSpec },
    DropIndex { ns: Namespace, name: String },
}

impl Pending {
    fn database(&self) -> &str {
        match self {
            Pending::Delete { ns, .. }
            | Pending::Insert { ns, .. }
            | Pending::CreateCollection(ns)
            | Pending::DropCollection(ns)
            | Pending::CreateIndex { ns, .. }
            | Pending::DropIndex { ns, .. } => ns.database(),
            Pending::Rename { from, .. } => from.database(),
            Pending::DropDatabase(db) => db,
        }
    }

    fn touches(&self, ns: &Namespace) -> bool {
        match self {
            Pending::Delete { ns: n, .. }
            | Pending::Insert { ns: n, .. }
            | Pending::CreateCollection(n)
            | Pending::DropCollection(n)
            | Pending::CreateIndex { ns: n, .. }
            | Pending::DropIndex { ns: n, .. } => n == ns,
            Pending::Rename { from, to, .. } => from == ns || to == ns,
            Pending::DropDatabase(db) => db == ns.database(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<State>,
    next_did: AtomicU64,
    injected_rollbacks: AtomicU32,
    failing: Mutex<HashSet<Namespace>>,
    commits: AtomicU64,
}

/// A thread-safe, in-memory [`DocumentStore`].
///
/// Commits are atomic: pending writes are applied to copies of the touched
/// databases under the store's write lock and swapped in only if every
/// write succeeds. Unique constraints (`_id` and unique indexes) are
/// checked at commit time.
///
/// The store can inject failures for testing:
/// - [`inject_rollbacks`](Self::inject_rollbacks) makes the next commits
///   fail with a rollback request
/// - [`fail_writes_to`](Self::fail_writes_to) makes every commit touching a
///   namespace fail with a user error
///
/// Cloning the store yields another handle to the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<Inner>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with a rollback request.
    pub fn inject_rollbacks(&self, count: u32) {
        self.inner.injected_rollbacks.store(count, Ordering::SeqCst);
    }

    /// Makes commits touching `ns` fail until cleared.
    pub fn fail_writes_to(&self, ns: Namespace) {
        self.inner.failing.lock().insert(ns);
    }

    /// Clears every injected write failure.
    pub fn clear_write_failures(&self) {
        self.inner.failing.lock().clear();
    }

    /// Number of successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    /// Inserts documents in a transaction of their own.
    ///
    /// # Errors
    ///
    /// Fails like any other commit.
    pub fn seed(&self, ns: &Namespace, docs: Vec<Document>) -> ReplResult<()> {
        let mut txn = self.open_write_transaction()?;
        txn.insert(ns, docs)?;
        txn.commit()
    }

    /// Documents of a collection ordered by `_id` key.
    #[must_use]
    pub fn contents(&self, ns: &Namespace) -> Vec<Document> {
        let state = self.inner.state.read();
        let Some(coll) = state.collection(ns) else {
            return Vec::new();
        };
        let mut keyed: Vec<(&DocKey, &Did)> = coll.ids.iter().collect();
        keyed.sort();
        keyed
            .into_iter()
            .filter_map(|(_, did)| coll.docs.get(did).cloned())
            .collect()
    }

    /// Every user namespace with its documents ordered by `_id` key.
    /// Replication metadata is left out.
    #[must_use]
    pub fn dump(&self) -> BTreeMap<String, Vec<Document>> {
        let namespaces: Vec<Namespace> = {
            let state = self.inner.state.read();
            state
                .databases
                .iter()
                .filter(|(db, _)| db.as_str() != RESERVED_DATABASE)
                .flat_map(|(db, colls)| colls.keys().map(move |c| Namespace::new(db.clone(), c.clone())))
                .collect()
        };
        namespaces
            .into_iter()
            .map(|ns| {
                let docs = self.contents(&ns);
                (ns.to_string(), docs)
            })
            .collect()
    }

    fn take_injected_rollback(&self) -> bool {
        self.inner
            .injected_rollbacks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn open_read_transaction(&self) -> ReplResult<Box<dyn ReadTransaction + '_>> {
        Ok(Box::new(MemoryReadTransaction {
            store: self.clone(),
        }))
    }

    fn open_write_transaction(&self) -> ReplResult<Box<dyn WriteTransaction + '_>> {
        Ok(Box::new(MemoryWriteTransaction {
            store: self.clone(),
            pending: Vec::new(),
        }))
    }
}

struct MemoryReadTransaction {
    store: MemoryDocumentStore,
}

struct MemoryWriteTransaction {
    store: MemoryDocumentStore,
    pending: Vec<Pending>,
}

fn find_dids(state: &State, ns: &Namespace, keys: &[DocKey]) -> HashMap<DocKey, Did> {
    let Some(coll) = state.collection(ns) else {
        return HashMap::new();
    };
    keys.iter()
        .filter_map(|k| coll.ids.get(k).map(|did| (k.clone(), *did)))
        .collect()
}

fn fetch(state: &State, ns: &Namespace, dids: &[Did]) -> HashMap<Did, Document> {
    let Some(coll) = state.collection(ns) else {
        return HashMap::new();
    };
    dids.iter()
        .filter_map(|did| coll.docs.get(did).map(|d| (*did, d.clone())))
        .collect()
}

fn scan(state: &State, ns: &Namespace) -> Vec<Document> {
    state
        .collection(ns)
        .map(|c| c.docs.values().cloned().collect())
        .unwrap_or_default()
}

fn list_databases(state: &State) -> Vec<String> {
    state
        .databases
        .iter()
        .filter(|(_, colls)| !colls.is_empty())
        .map(|(db, _)| db.clone())
        .collect()
}

fn list_collections(state: &State, database: &str) -> Vec<String> {
    state
        .databases
        .get(database)
        .map(|colls| colls.keys().cloned().collect())
        .unwrap_or_default()
}

fn list_indexes(state: &State, ns: &Namespace) -> Vec<IndexSpec> {
    state
        .collection(ns)
        .map(|c| c.indexes.values().cloned().collect())
        .unwrap_or_default()
}

macro_rules! read_methods {
    () => {
        fn find_dids(&self, ns: &Namespace, keys: &[DocKey]) -> ReplResult<HashMap<DocKey, Did>> {
            Ok(find_dids(&self.store.inner.state.read(), ns, keys))
        }

        fn fetch(&self, ns: &Namespace, dids: &[Did]) -> ReplResult<HashMap<Did, Document>> {
            Ok(fetch(&self.store.inner.state.read(), ns, dids))
        }

        fn scan(&self, ns: &Namespace) -> ReplResult<Vec<Document>> {
            Ok(scan(&self.store.inner.state.read(), ns))
        }

        fn list_databases(&self) -> ReplResult<Vec<String>> {
            Ok(list_databases(&self.store.inner.state.read()))
        }

        fn list_collections(&self, database: &str) -> ReplResult<Vec<String>> {
            Ok(list_collections(&self.store.inner.state.read(), database))
        }

        fn list_indexes(&self, ns: &Namespace) -> ReplResult<Vec<IndexSpec>> {
            Ok(list_indexes(&self.store.inner.state.read(), ns))
        }
    };
}

impl ReadTransaction for MemoryReadTransaction {
    read_methods!();
}

impl ReadTransaction for MemoryWriteTransaction {
    read_methods!();
}

impl WriteTransaction for MemoryWriteTransaction {
    fn delete(&mut self, ns: &Namespace, dids: &[Did]) -> ReplResult<()> {
        if !dids.is_empty() {
            self.pending.push(Pending::Delete {
                ns: ns.clone(),
                dids: dids.to_vec(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, ns: &Namespace, docs: Vec<Document>) -> ReplResult<()> {
        if !docs.is_empty() {
            self.pending.push(Pending::Insert {
                ns: ns.clone(),
                docs,
            });
        }
        Ok(())
    }

    fn create_collection(&mut self, ns: &Namespace) -> ReplResult<()> {
        self.pending.push(Pending::CreateCollection(ns.clone()));
        Ok(())
    }

    fn drop_collection(&mut self, ns: &Namespace) -> ReplResult<bool> {
        let existed = self.collection_exists(ns)?;
        self.pending.push(Pending::DropCollection(ns.clone()));
        Ok(existed)
    }

    fn drop_database(&mut self, database: &str) -> ReplResult<bool> {
        let existed = !self.list_collections(database)?.is_empty();
        self.pending.push(Pending::DropDatabase(database.to_string()));
        Ok(existed)
    }

    fn rename_collection(
        &mut self,
        from: &Namespace,
        to: &Namespace,
        drop_target: bool,
    ) -> ReplResult<()> {
        if from.database() != to.database() {
            return Err(ReplError::user(format!(
                "cannot rename {from} to {to} across databases"
            )));
        }
        self.pending.push(Pending::Rename {
            from: from.clone(),
            to: to.clone(),
            drop_target,
        });
        Ok(())
    }

    fn create_index(&mut self, ns: &Namespace, index: &IndexSpec) -> ReplResult<()> {
        self.pending.push(Pending::CreateIndex {
            ns: ns.clone(),
            index: index.clone(),
        });
        Ok(())
    }

    fn drop_index(&mut self, ns: &Namespace, name: &str) -> ReplResult<bool> {
        let existed = self.list_indexes(ns)?.iter().any(|i| i.name == name);
        self.pending.push(Pending::DropIndex {
            ns: ns.clone(),
            name: name.to_string(),
        });
        Ok(existed)
    }

    fn commit(self: Box<Self>) -> ReplResult<()> {
        let MemoryWriteTransaction { store, pending } = *self;
        if pending.is_empty() {
            return Ok(());
        }
        if store.take_injected_rollback() {
            return Err(ReplError::rollback("injected rollback"));
        }
        {
            let failing = store.inner.failing.lock();
            if let Some(ns) = failing.iter().find(|ns| pending.iter().any(|p| p.touches(ns))) {
                return Err(ReplError::user(format!("injected write failure on {ns}")));
            }
        }

        let mut state = store.inner.state.write();
        let touched: BTreeSet<String> = pending.iter().map(|p| p.database().to_string()).collect();
        let mut staged: BTreeMap<String, Database> = touched
            .into_iter()
            .map(|db| {
                let copy = state.databases.get(&db).cloned().unwrap_or_default();
                (db, copy)
            })
            .collect();

        let op_count = pending.len();
        for op in pending {
            apply(&mut staged, op, &store.inner.next_did)?;
        }

        for (db, database) in staged {
            if database.is_empty() {
                state.databases.remove(&db);
            } else {
                state.databases.insert(db, database);
            }
        }
        store.inner.commits.fetch_add(1, Ordering::Relaxed);
        trace!(writes = op_count, "memory store commit");
        Ok(())
    }
}

fn staged_db<'a>(staged: &'a mut BTreeMap<String, Database>, db: &str) -> &'a mut Database {
    staged.entry(db.to_string()).or_default()
}

fn apply(staged: &mut BTreeMap<String, Database>, op: Pending, next_did: &AtomicU64) -> ReplResult<()> {
    match op {
        Pending::Delete { ns, dids } => {
            if let Some(coll) = staged_db(staged, ns.database()).get_mut(ns.collection()) {
                for did in dids {
                    if let Some(doc) = coll.docs.remove(&did) {
                        if let Ok(key) = DocKey::of_document(&doc) {
                            coll.ids.remove(&key);
                        }
                    }
                }
            }
        }
        Pending::Insert { ns, docs } => {
            let coll = staged_db(staged, ns.database())
                .entry(ns.collection().to_string())
                .or_default();
            for doc in docs {
                let key = DocKey::of_document(&doc)?;
                if coll.ids.contains_key(&key) {
                    return Err(ReplError::DuplicateKey {
                        namespace: ns.to_string(),
                        key: key.to_string(),
                    });
                }
                for index in coll.indexes.values().filter(|i| i.unique) {
                    let tuple = index_tuple(index, &doc);
                    if coll.docs.values().any(|d| index_tuple(index, d) == tuple) {
                        return Err(ReplError::DuplicateKey {
                            namespace: ns.to_string(),
                            key: format!("{} {:?}", index.name, tuple),
                        });
                    }
                }
                let did = next_did.fetch_add(1, Ordering::Relaxed);
                coll.ids.insert(key, did);
                coll.docs.insert(did, doc);
            }
        }
        Pending::CreateCollection(ns) => {
            staged_db(staged, ns.database())
                .entry(ns.collection().to_string())
                .or_default();
        }
        Pending::DropCollection(ns) => {
            staged_db(staged, ns.database()).remove(ns.collection());
        }
        Pending::DropDatabase(db) => {
            staged_db(staged, &db).clear();
        }
        Pending::Rename {
            from,
            to,
            drop_target,
        } => {
            let db = staged_db(staged, from.database());
            if db.contains_key(to.collection()) {
                if !drop_target {
                    return Err(ReplError::user(format!("rename target {to} already exists")));
                }
                db.remove(to.collection());
            }
            let coll = db
                .remove(from.collection())
                .ok_or_else(|| ReplError::user(format!("rename source {from} does not exist")))?;
            db.insert(to.collection().to_string(), coll);
        }
        Pending::CreateIndex { ns, index } => {
            let coll = staged_db(staged, ns.database())
                .entry(ns.collection().to_string())
                .or_default();
            if index.unique {
                let mut seen = HashSet::new();
                for doc in coll.docs.values() {
                    if !seen.insert(index_tuple(&index, doc)) {
                        return Err(ReplError::DuplicateKey {
                            namespace: ns.to_string(),
                            key: index.name.clone(),
                        });
                    }
                }
            }
            coll.indexes.insert(index.name.clone(), index);
        }
        Pending::DropIndex { ns, name } => {
            if let Some(coll) = staged_db(staged, ns.database()).get_mut(ns.collection()) {
                coll.indexes.remove(&name);
            }
        }
    }
    Ok(())
}

fn index_tuple(index: &IndexSpec, doc: &Document) -> Vec<String> {
    index
        .keys
        .iter()
        .map(|path| lookup(doc, path).unwrap_or(&Value::Null).to_string())
        .collect()
}

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, segment| value.get(segment))
}
