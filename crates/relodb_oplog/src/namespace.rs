//! Namespaces and document keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OplogError, OplogResult};
use crate::ID_FIELD;

/// A `database.collection` pair.
///
/// The textual form splits on the first dot, so collection names may contain
/// dots (`app.system.profile` is collection `system.profile` in `app`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    /// Creates a namespace.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns a namespace in the same database with another collection name.
    pub fn sibling(&self, collection: impl Into<String>) -> Self {
        Self::new(self.database.clone(), collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = OplogError;

    fn from_str(s: &str) -> OplogResult<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(OplogError::InvalidNamespace(s.to_string())),
        }
    }
}

impl TryFrom<String> for Namespace {
    type Error = OplogError;

    fn try_from(value: String) -> OplogResult<Self> {
        value.parse()
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

/// Canonical, hashable form of a document `_id`.
///
/// Two `_id` values map to the same key iff they are equal JSON values.
/// Object members are written in sorted order, so member order in the
/// source text does not matter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocKey(String);

impl DocKey {
    /// Builds the key for an `_id` value.
    pub fn from_id(id: &Value) -> Self {
        let mut out = String::new();
        write_canonical(id, &mut out);
        DocKey(out)
    }

    /// Extracts the key of a document.
    pub fn of_document(doc: &Value) -> OplogResult<Self> {
        document_id(doc).map(Self::from_id)
    }

    /// Canonical text of the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Returns the `_id` of a document, rejecting non-objects and null ids.
pub(crate) fn document_id(doc: &Value) -> OplogResult<&Value> {
    let object = doc
        .as_object()
        .ok_or_else(|| OplogError::InvalidDocument(format!("expected an object, got {doc}")))?;
    match object.get(ID_FIELD) {
        Some(Value::Null) | None => Err(OplogError::InvalidDocument(format!(
            "document has no {ID_FIELD}"
        ))),
        Some(id) => Ok(id),
    }
}
