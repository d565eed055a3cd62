//! Command application.

use std::sync::Arc;

use relodb_oplog::{CommandOp, IndexSpec, OpKind, OplogOperation};
use tracing::{debug, info, warn};

use super::namespace::MAX_ATTEMPTS;
use crate::context::ApplierContext;
use crate::error::{ReplError, ReplResult};
use crate::filter::ReplicationFilters;
use crate::metrics::ExecutorMetrics;
use crate::store::{DocumentStore, WriteTransaction};

/// Applies schema commands, each in its own write transaction.
///
/// Dropping something that does not exist is logged and treated as
/// success, since replays routinely see drops of already-dropped targets.
pub struct CommandApplier {
    store: Arc<dyn DocumentStore>,
    filters: Arc<ReplicationFilters>,
    metrics: Arc<ExecutorMetrics>,
}

impl CommandApplier {
    /// Creates a command applier.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        filters: Arc<ReplicationFilters>,
        metrics: Arc<ExecutorMetrics>,
    ) -> Self {
        Self {
            store,
            filters,
            metrics,
        }
    }

    /// Applies a command entry, redoing it once on rollback.
    ///
    /// # Errors
    ///
    /// Fails with [`ReplError::UnsupportedOperation`] for unknown commands
    /// and with backend errors otherwise.
    pub fn apply(&self, op: &OplogOperation, context: &ApplierContext) -> ReplResult<()> {
        let OpKind::Command { command } = &op.kind else {
            return Err(ReplError::UnsupportedOperation(format!(
                "{} at {} is not a command",
                op.kind_name(),
                op.position
            )));
        };
        if let CommandOp::Unsupported { command } = command {
            return Err(ReplError::UnsupportedOperation(format!(
                "command {command} at {}",
                op.position
            )));
        }

        let mut attempt = 1;
        loop {
            match self.try_apply(op, command, context) {
                Ok(()) => {
                    self.metrics.record_command();
                    return Ok(());
                }
                Err(e) if e.is_rollback() && attempt < MAX_ATTEMPTS => {
                    self.metrics.record_rollback();
                    debug!(command = command.name(), error = %e, "rollback while applying command, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_apply(
        &self,
        op: &OplogOperation,
        command: &CommandOp,
        context: &ApplierContext,
    ) -> ReplResult<()> {
        let mut txn = self.store.open_write_transaction()?;
        self.apply_in(op, command, context, txn.as_mut())?;
        txn.commit()
    }

    fn apply_in(
        &self,
        op: &OplogOperation,
        command: &CommandOp,
        context: &ApplierContext,
        txn: &mut dyn WriteTransaction,
    ) -> ReplResult<()> {
        let ns = &op.namespace;
        match command {
            CommandOp::Create => txn.create_collection(ns),
            CommandOp::Drop => {
                if !txn.drop_collection(ns)? {
                    info!(namespace = %ns, "collection to drop does not exist, ignoring");
                }
                Ok(())
            }
            CommandOp::DropDatabase => {
                if !txn.drop_database(ns.database())? {
                    info!(database = ns.database(), "database to drop does not exist, ignoring");
                }
                Ok(())
            }
            CommandOp::CreateIndexes { indexes } => {
                for index in indexes {
                    if index.name == IndexSpec::ID_INDEX {
                        continue;
                    }
                    if !self.filters.index_filter(ns, &index.name) {
                        debug!(namespace = %ns, index = %index.name, "index excluded by filters");
                        continue;
                    }
                    txn.create_index(ns, index)?;
                }
                Ok(())
            }
            CommandOp::DropIndexes { index } => {
                if index == "*" {
                    for existing in txn.list_indexes(ns)? {
                        txn.drop_index(ns, &existing.name)?;
                    }
                } else if index == IndexSpec::ID_INDEX {
                    warn!(namespace = %ns, "refusing to drop the _id index");
                } else if !txn.drop_index(ns, index)? {
                    info!(namespace = %ns, index = %index, "index to drop does not exist, ignoring");
                }
                Ok(())
            }
            CommandOp::RenameCollection { to, drop_target } => {
                let target = ns.sibling(to.clone());
                if !txn.collection_exists(ns)? && context.is_reapplying() {
                    info!(from = %ns, to = %target, "rename source does not exist while reapplying, ignoring");
                    return Ok(());
                }
                txn.rename_collection(ns, &target, *drop_target)
            }
            CommandOp::Unsupported { command } => Err(ReplError::UnsupportedOperation(
                format!("command {command}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use relodb_oplog::{Namespace, Position};
    use serde_json::json;

    fn applier(store: &MemoryDocumentStore, filters: ReplicationFilters) -> CommandApplier {
        CommandApplier::new(
            Arc::new(store.clone()),
            Arc::new(filters),
            Arc::new(ExecutorMetrics::new()),
        )
    }

    fn cmd(coll: &str, command: CommandOp) -> OplogOperation {
        OplogOperation::command(Position::new(1, 1), 0, Namespace::new("shop", coll), command)
    }

    #[test]
    fn dropping_absent_targets_succeeds() {
        let store = MemoryDocumentStore::new();
        let applier = applier(&store, ReplicationFilters::new());
        let ctx = ApplierContext::new();
        applier.apply(&cmd("gone", CommandOp::Drop), &ctx).unwrap();
        applier
            .apply(&cmd("$cmd", CommandOp::DropDatabase), &ctx)
            .unwrap();
        applier
            .apply(
                &cmd("gone", CommandOp::DropIndexes { index: "x_1".into() }),
                &ctx,
            )
            .unwrap();
    }

    #[test]
    fn index_commands_honor_filters() {
        let store = MemoryDocumentStore::new();
        let applier = applier(&store, ReplicationFilters::new().exclude_index("geo"));
        let ctx = ApplierContext::new();
        applier
            .apply(
                &cmd(
                    "items",
                    CommandOp::CreateIndexes {
                        indexes: vec![
                            IndexSpec::new("sku_1", vec!["sku".into()]),
                            IndexSpec::new("geo", vec!["loc".into()]),
                        ],
                    },
                ),
                &ctx,
            )
            .unwrap();
        let ns = Namespace::new("shop", "items");
        let names: Vec<String> = store
            .open_read_transaction()
            .unwrap()
            .list_indexes(&ns)
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["sku_1".to_string()]);

        applier
            .apply(&cmd("items", CommandOp::DropIndexes { index: "*".into() }), &ctx)
            .unwrap();
        assert!(store
            .open_read_transaction()
            .unwrap()
            .list_indexes(&ns)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn rename_moves_documents() {
        let store = MemoryDocumentStore::new();
        let from = Namespace::new("shop", "items");
        store.seed(&from, vec![json!({"_id": 1})]).unwrap();
        let applier = applier(&store, ReplicationFilters::new());
        applier
            .apply(
                &cmd(
                    "items",
                    CommandOp::RenameCollection {
                        to: "archive".into(),
                        drop_target: false,
                    },
                ),
                &ApplierContext::new(),
            )
            .unwrap();
        assert_eq!(
            store.contents(&from.sibling("archive")),
            vec![json!({"_id": 1})]
        );

        let missing = cmd(
            "items",
            CommandOp::RenameCollection {
                to: "other".into(),
                drop_target: false,
            },
        );
        assert!(applier.apply(&missing, &ApplierContext::new()).is_err());
        applier.apply(&missing, &ApplierContext::recovery()).unwrap();
    }

    #[test]
    fn unsupported_commands_fail() {
        let store = MemoryDocumentStore::new();
        let applier = applier(&store, ReplicationFilters::new());
        let err = applier
            .apply(
                &cmd(
                    "$cmd",
                    CommandOp::Unsupported {
                        command: "applyOps".into(),
                    },
                ),
                &ApplierContext::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ReplError::UnsupportedOperation(_)));
    }

    #[test]
    fn create_is_retried_after_rollback() {
        let store = MemoryDocumentStore::new();
        let applier = applier(&store, ReplicationFilters::new());
        store.inject_rollbacks(1);
        applier
            .apply(&cmd("items", CommandOp::Create), &ApplierContext::new())
            .unwrap();
        assert!(store
            .open_read_transaction()
            .unwrap()
            .collection_exists(&Namespace::new("shop", "items"))
            .unwrap());
    }
}
