//! Replication filters.
//!
//! Filters decide which databases, collections and indexes are replicated.
//! A rule maps a database name to a list of collection patterns; an empty
//! list stands for the whole database and a pattern ending in `*` matches
//! by prefix. The `local` database and the reserved metadata database are
//! never replicated whatever the rules say.

use std::collections::{BTreeMap, BTreeSet};

use relodb_oplog::{CommandOp, Namespace, OpKind, OplogBatch, OplogOperation};
use serde::{Deserialize, Serialize};

use crate::error::ReplResult;
use crate::store::RESERVED_DATABASE;

/// Database that holds node-local data on the primary.
pub const LOCAL_DATABASE: &str = "local";

/// Include and exclude rules for replication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFilters {
    /// Databases (and optionally collections) to replicate. Empty means
    /// everything.
    #[serde(default)]
    include: BTreeMap<String, Vec<String>>,
    /// Databases (and optionally collections) to skip.
    #[serde(default)]
    exclude: BTreeMap<String, Vec<String>>,
    /// Index names never created locally.
    #[serde(default, rename = "excludeIndexes")]
    excluded_indexes: BTreeSet<String>,
}

fn matches_any(patterns: &[String], collection: &str) -> bool {
    patterns.iter().any(|p| match p.strip_suffix('*') {
        Some(prefix) => collection.starts_with(prefix),
        None => p == collection,
    })
}

impl ReplicationFilters {
    /// Filters that replicate every user database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replicates a whole database.
    pub fn include_database(mut self, database: impl Into<String>) -> Self {
        self.include.entry(database.into()).or_default().clear();
        self
    }

    /// Replicates collections of a database matching `pattern`.
    pub fn include_collection(
        mut self,
        database: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.include
            .entry(database.into())
            .or_default()
            .push(pattern.into());
        self
    }

    /// Skips a whole database.
    pub fn exclude_database(mut self, database: impl Into<String>) -> Self {
        self.exclude.entry(database.into()).or_default().clear();
        self
    }

    /// Skips collections of a database matching `pattern`.
    pub fn exclude_collection(
        mut self,
        database: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.exclude
            .entry(database.into())
            .or_default()
            .push(pattern.into());
        self
    }

    /// Never creates indexes with this name.
    pub fn exclude_index(mut self, name: impl Into<String>) -> Self {
        self.excluded_indexes.insert(name.into());
        self
    }

    /// Returns true if any part of `database` may be replicated.
    pub fn database_filter(&self, database: &str) -> bool {
        if database == LOCAL_DATABASE || database == RESERVED_DATABASE {
            return false;
        }
        if !self.include.is_empty() && !self.include.contains_key(database) {
            return false;
        }
        !matches!(self.exclude.get(database), Some(patterns) if patterns.is_empty())
    }

    /// Returns true if the collection is replicated.
    pub fn namespace_filter(&self, ns: &Namespace) -> bool {
        if !self.database_filter(ns.database()) {
            return false;
        }
        let included = match self.include.get(ns.database()) {
            None => self.include.is_empty(),
            Some(patterns) => patterns.is_empty() || matches_any(patterns, ns.collection()),
        };
        let excluded = match self.exclude.get(ns.database()) {
            None => false,
            Some(patterns) => patterns.is_empty() || matches_any(patterns, ns.collection()),
        };
        included && !excluded
    }

    /// Returns true if the index is created locally.
    pub fn index_filter(&self, ns: &Namespace, name: &str) -> bool {
        self.namespace_filter(ns) && !self.excluded_indexes.contains(name)
    }

    /// Returns true if the oplog entry should be applied.
    pub fn operation_filter(&self, op: &OplogOperation) -> bool {
        match &op.kind {
            OpKind::Command {
                command: CommandOp::DropDatabase,
            } => self.database_filter(op.namespace.database()),
            OpKind::Noop => true,
            _ => self.namespace_filter(&op.namespace),
        }
    }

    /// Drops the entries of `batch` that are not replicated. The batch keeps
    /// its tail, so the skipped entries still count as applied.
    pub fn filter_batch(&self, mut batch: OplogBatch) -> OplogBatch {
        batch.retain(|op| self.operation_filter(op));
        batch
    }
}

/// Fails on the first entry the engine cannot apply.
pub fn check_batch(batch: &OplogBatch) -> ReplResult<()> {
    for op in batch.ops() {
        op.check_supported()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relodb_oplog::Position;
    use serde_json::json;

    fn ns(db: &str, coll: &str) -> Namespace {
        Namespace::new(db, coll)
    }

    #[test]
    fn system_databases_are_never_replicated() {
        let filters = ReplicationFilters::new().include_database(LOCAL_DATABASE);
        assert!(!filters.database_filter(LOCAL_DATABASE));
        assert!(!ReplicationFilters::new().database_filter(RESERVED_DATABASE));
        assert!(ReplicationFilters::new().database_filter("shop"));
    }

    #[test]
    fn include_rules() {
        let filters = ReplicationFilters::new()
            .include_database("shop")
            .include_collection("crm", "contacts")
            .include_collection("crm", "tmp_*");
        assert!(filters.namespace_filter(&ns("shop", "anything")));
        assert!(filters.namespace_filter(&ns("crm", "contacts")));
        assert!(filters.namespace_filter(&ns("crm", "tmp_2024")));
        assert!(!filters.namespace_filter(&ns("crm", "leads")));
        assert!(!filters.namespace_filter(&ns("other", "x")));
    }

    #[test]
    fn exclude_rules() {
        let filters = ReplicationFilters::new()
            .exclude_database("audit")
            .exclude_collection("shop", "cache*")
            .exclude_index("text_idx");
        assert!(!filters.database_filter("audit"));
        assert!(filters.database_filter("shop"));
        assert!(!filters.namespace_filter(&ns("shop", "cache_items")));
        assert!(filters.namespace_filter(&ns("shop", "orders")));
        assert!(!filters.index_filter(&ns("shop", "orders"), "text_idx"));
        assert!(filters.index_filter(&ns("shop", "orders"), "sku_1"));
    }

    #[test]
    fn filtered_batch_keeps_tail() {
        let filters = ReplicationFilters::new().exclude_database("audit");
        let batch = OplogBatch::new(
            vec![
                OplogOperation::insert(Position::new(1, 1), 1, ns("shop", "o"), json!({"_id": 1})),
                OplogOperation::insert(Position::new(1, 2), 2, ns("audit", "e"), json!({"_id": 1})),
            ],
            true,
        );
        let filtered = filters.filter_batch(batch);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.tail().unwrap().position, Position::new(1, 2));
    }

    #[test]
    fn filters_parse_from_json() {
        let filters: ReplicationFilters = serde_json::from_value(json!({
            "include": {"shop": []},
            "excludeIndexes": ["geo"]
        }))
        .unwrap();
        assert!(filters.namespace_filter(&ns("shop", "x")));
        assert!(!filters.namespace_filter(&ns("crm", "x")));
        assert!(!filters.index_filter(&ns("shop", "x"), "geo"));
    }
}
