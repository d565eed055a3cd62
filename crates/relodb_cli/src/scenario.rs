//! Oplog scenario files.
//!
//! A scenario describes a replica before and after replaying an oplog:
//!
//! ```json
//! {
//!   "name": "update after insert",
//!   "initialState": {"shop": {"items": [{"_id": 1, "n": 1}]}},
//!   "oplog": [
//!     {"position": {"term": 1, "timestampMillis": 5}, "hash": 5,
//!      "ns": "shop.items", "op": "update", "id": 1,
//!      "update": {"$set": {"n": 2}}}
//!   ],
//!   "expectedState": {"shop": {"items": [{"_id": 1, "n": 2}]}}
//! }
//! ```
//!
//! A scenario may name an `expectedError` instead; the replay then must
//! fail with an error whose message contains that text.

use std::collections::BTreeMap;
use std::path::Path;

use relodb_oplog::{DocKey, Document, Namespace, OplogOperation};
use serde::Deserialize;

use crate::error::{CliError, CliResult};

/// Documents per collection per database, as written in scenario files.
pub type DatabaseState = BTreeMap<String, BTreeMap<String, Vec<Document>>>;

/// Documents per namespace, ordered by `_id` key, without empty collections.
pub type NamespaceState = BTreeMap<String, Vec<Document>>;

/// A parsed scenario file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Replica contents before the replay.
    #[serde(default)]
    pub initial_state: DatabaseState,
    /// Entries to replay, in oplog order.
    pub oplog: Vec<OplogOperation>,
    /// Replica contents after the replay.
    #[serde(default)]
    pub expected_state: Option<DatabaseState>,
    /// Text the replay error must contain.
    #[serde(default)]
    pub expected_error: Option<String>,
}

impl Scenario {
    /// Reads and parses a scenario file. A missing name defaults to the
    /// file stem.
    pub fn load(path: &Path) -> CliResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut scenario: Scenario =
            serde_json::from_str(&text).map_err(|source| CliError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if scenario.name.is_empty() {
            scenario.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(scenario)
    }

    /// The initial state as namespaces and their documents.
    pub fn initial_namespaces(&self) -> CliResult<Vec<(Namespace, Vec<Document>)>> {
        let mut out = Vec::new();
        for (database, collections) in &self.initial_state {
            for (collection, docs) in collections {
                let ns: Namespace = format!("{database}.{collection}").parse()?;
                out.push((ns, docs.clone()));
            }
        }
        Ok(out)
    }
}

/// Brings a scenario state into the shape `MemoryDocumentStore::dump`
/// returns.
pub fn normalize(state: &DatabaseState) -> CliResult<NamespaceState> {
    let mut out = NamespaceState::new();
    for (database, collections) in state {
        for (collection, docs) in collections {
            if docs.is_empty() {
                continue;
            }
            let mut keyed = Vec::with_capacity(docs.len());
            for doc in docs {
                keyed.push((DocKey::of_document(doc)?, doc.clone()));
            }
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            out.insert(
                format!("{database}.{collection}"),
                keyed.into_iter().map(|(_, doc)| doc).collect(),
            );
        }
    }
    Ok(out)
}

/// Lists how `actual` differs from `expected`, one line per namespace.
/// Empty collections count as absent.
pub fn diff(expected: &NamespaceState, actual: &NamespaceState) -> Vec<String> {
    let mut lines = Vec::new();
    let actual: NamespaceState = actual
        .iter()
        .filter(|(_, docs)| !docs.is_empty())
        .map(|(ns, docs)| (ns.clone(), docs.clone()))
        .collect();

    for (ns, want) in expected {
        match actual.get(ns) {
            None => lines.push(format!("{ns}: missing, expected {} documents", want.len())),
            Some(got) if got != want => {
                let extra = got.iter().filter(|d| !want.contains(d)).count();
                let missing = want.iter().filter(|d| !got.contains(d)).count();
                lines.push(format!(
                    "{ns}: {missing} expected documents missing, {extra} unexpected documents"
                ));
            }
            Some(_) => {}
        }
    }
    for (ns, got) in &actual {
        if !expected.contains_key(ns) {
            lines.push(format!("{ns}: unexpected, holds {} documents", got.len()));
        }
    }
    lines
}
