//! Oplog operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OplogError, OplogResult};
use crate::namespace::{document_id, DocKey, Namespace};
use crate::position::Position;
use crate::update::UpdateAction;
use crate::Document;

/// A single entry of the replicated oplog.
///
/// The JSON form flattens the kind into the entry:
///
/// ```json
/// {"position": {"term": 1, "timestampMillis": 100}, "hash": 42,
///  "ns": "shop.orders", "op": "insert", "doc": {"_id": 1}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogOperation {
    /// Where the entry sits in the oplog.
    pub position: Position,
    /// Hash the primary assigned to the entry.
    #[serde(default)]
    pub hash: i64,
    /// Target namespace. For commands this is the collection the command
    /// acts on; database-wide commands use any collection name, by
    /// convention `$cmd`.
    #[serde(rename = "ns")]
    pub namespace: Namespace,
    /// What the entry does.
    #[serde(flatten)]
    pub kind: OpKind,
}

/// The kind of an oplog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OpKind {
    /// Inserts a full document.
    Insert {
        /// The inserted document, including `_id`.
        doc: Document,
    },
    /// Updates the document with the given `_id`.
    Update {
        /// `_id` of the target document.
        id: Value,
        /// Replacement document or modifier document.
        update: Value,
        /// Whether a missing target is created.
        #[serde(default)]
        upsert: bool,
    },
    /// Deletes the document with the given `_id`.
    Delete {
        /// `_id` of the target document.
        id: Value,
    },
    /// No effect beyond advancing the oplog.
    Noop,
    /// A schema or administrative command.
    Command {
        /// The command.
        command: CommandOp,
    },
}

/// Commands carried by the oplog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "camelCase")]
pub enum CommandOp {
    /// Creates the collection.
    Create,
    /// Drops the collection.
    Drop,
    /// Drops the whole database.
    DropDatabase,
    /// Creates indexes on the collection.
    CreateIndexes {
        /// Index definitions.
        indexes: Vec<IndexSpec>,
    },
    /// Drops an index by name, or every secondary index with `*`.
    DropIndexes {
        /// Index name or `*`.
        index: String,
    },
    /// Renames the collection within its database.
    RenameCollection {
        /// New collection name.
        to: String,
        /// Replace an existing target collection.
        #[serde(default, rename = "dropTarget")]
        drop_target: bool,
    },
    /// Any command this engine does not know how to apply.
    Unsupported {
        /// Command name as logged by the primary.
        command: String,
    },
}

/// Definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name, unique within the collection.
    pub name: String,
    /// Indexed field paths.
    pub keys: Vec<String>,
    /// Whether two documents may share the same key tuple.
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    /// Name of the index every collection has on `_id`.
    pub const ID_INDEX: &'static str = "_id_";

    /// Creates a non-unique index definition.
    pub fn new(name: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            keys,
            unique: false,
        }
    }

    /// Marks the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl CommandOp {
    /// Name of the command as it appears in the oplog.
    pub fn name(&self) -> &str {
        match self {
            CommandOp::Create => "create",
            CommandOp::Drop => "drop",
            CommandOp::DropDatabase => "dropDatabase",
            CommandOp::CreateIndexes { .. } => "createIndexes",
            CommandOp::DropIndexes { .. } => "dropIndexes",
            CommandOp::RenameCollection { .. } => "renameCollection",
            CommandOp::Unsupported { command } => command,
        }
    }
}

impl OplogOperation {
    /// Creates an operation.
    pub fn new(position: Position, hash: i64, namespace: Namespace, kind: OpKind) -> Self {
        Self {
            position,
            hash,
            namespace,
            kind,
        }
    }

    /// Creates an insert.
    pub fn insert(position: Position, hash: i64, namespace: Namespace, doc: Document) -> Self {
        Self::new(position, hash, namespace, OpKind::Insert { doc })
    }

    /// Creates an update.
    pub fn update(
        position: Position,
        hash: i64,
        namespace: Namespace,
        id: Value,
        update: Value,
        upsert: bool,
    ) -> Self {
        Self::new(
            position,
            hash,
            namespace,
            OpKind::Update { id, update, upsert },
        )
    }

    /// Creates a delete.
    pub fn delete(position: Position, hash: i64, namespace: Namespace, id: Value) -> Self {
        Self::new(position, hash, namespace, OpKind::Delete { id })
    }

    /// Creates a noop.
    pub fn noop(position: Position, hash: i64, namespace: Namespace) -> Self {
        Self::new(position, hash, namespace, OpKind::Noop)
    }

    /// Creates a command.
    pub fn command(position: Position, hash: i64, namespace: Namespace, command: CommandOp) -> Self {
        Self::new(position, hash, namespace, OpKind::Command { command })
    }

    /// Returns true for insert, update and delete entries.
    pub fn is_crud(&self) -> bool {
        matches!(
            self.kind,
            OpKind::Insert { .. } | OpKind::Update { .. } | OpKind::Delete { .. }
        )
    }

    /// Returns true for command entries.
    pub fn is_command(&self) -> bool {
        matches!(self.kind, OpKind::Command { .. })
    }

    /// `_id` of the document a CRUD entry touches.
    pub fn document_id(&self) -> OplogResult<Option<&Value>> {
        match &self.kind {
            OpKind::Insert { doc } => document_id(doc).map(Some),
            OpKind::Update { id, .. } | OpKind::Delete { id } => {
                if id.is_null() {
                    Err(OplogError::InvalidDocument(format!(
                        "{} at {} has a null _id",
                        self.kind_name(),
                        self.position
                    )))
                } else {
                    Ok(Some(id))
                }
            }
            OpKind::Noop | OpKind::Command { .. } => Ok(None),
        }
    }

    /// Key of the document a CRUD entry touches.
    pub fn doc_key(&self) -> OplogResult<Option<DocKey>> {
        Ok(self.document_id()?.map(DocKey::from_id))
    }

    /// Short name of the kind, for logs and errors.
    pub fn kind_name(&self) -> &str {
        match &self.kind {
            OpKind::Insert { .. } => "insert",
            OpKind::Update { .. } => "update",
            OpKind::Delete { .. } => "delete",
            OpKind::Noop => "noop",
            OpKind::Command { command } => command.name(),
        }
    }

    /// Checks that the engine knows how to apply this entry.
    ///
    /// Unknown commands, unknown update operators and entries without a
    /// usable `_id` fail here, before anything is executed.
    pub fn check_supported(&self) -> OplogResult<()> {
        self.document_id()?;
        match &self.kind {
            OpKind::Update { update, .. } => UpdateAction::parse(update).map(|_| ()),
            OpKind::Command {
                command: CommandOp::Unsupported { command },
            } => Err(OplogError::UnsupportedCommand(command.clone())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    #[test]
    fn json_form_is_flat() {
        let op = OplogOperation::insert(Position::new(1, 100), 42, ns(), json!({"_id": 1}));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({
                "position": {"term": 1, "timestampMillis": 100},
                "hash": 42,
                "ns": "shop.orders",
                "op": "insert",
                "doc": {"_id": 1}
            })
        );
        let back: OplogOperation = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn commands_parse_from_json() {
        let op: OplogOperation = serde_json::from_value(json!({
            "position": {"term": 1, "timestampMillis": 5},
            "ns": "shop.orders",
            "op": "command",
            "command": {"name": "renameCollection", "to": "archive"}
        }))
        .unwrap();
        assert_eq!(op.hash, 0);
        assert_eq!(
            op.kind,
            OpKind::Command {
                command: CommandOp::RenameCollection {
                    to: "archive".into(),
                    drop_target: false
                }
            }
        );
        assert_eq!(op.kind_name(), "renameCollection");
    }

    #[test]
    fn check_supported_rejects_unknown_commands_and_modifiers() {
        let cmd = OplogOperation::command(
            Position::new(1, 1),
            0,
            ns(),
            CommandOp::Unsupported {
                command: "applyOps".into(),
            },
        );
        assert_eq!(
            cmd.check_supported(),
            Err(OplogError::UnsupportedCommand("applyOps".into()))
        );

        let upd = OplogOperation::update(
            Position::new(1, 2),
            0,
            ns(),
            json!(1),
            json!({"$rename": {"a": "b"}}),
            false,
        );
        assert!(upd.check_supported().unwrap_err().is_unsupported());

        let del = OplogOperation::delete(Position::new(1, 3), 0, ns(), Value::Null);
        assert!(matches!(
            del.check_supported(),
            Err(OplogError::InvalidDocument(_))
        ));
    }

    #[test]
    fn doc_key_for_each_kind() {
        let p = Position::new(1, 1);
        let ins = OplogOperation::insert(p, 0, ns(), json!({"_id": "a"}));
        let del = OplogOperation::delete(p, 0, ns(), json!("a"));
        assert_eq!(ins.doc_key().unwrap(), del.doc_key().unwrap());
        assert_eq!(OplogOperation::noop(p, 0, ns()).doc_key().unwrap(), None);
    }
}
