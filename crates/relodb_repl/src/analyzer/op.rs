//! Analyzed operations and the fold that merges them.

use relodb_oplog::{
    with_id, DocKey, Document, Modifier, OpKind, OplogOperation, UpdateAction, ID_FIELD,
};
use serde_json::{Map, Value};

use crate::context::ApplierContext;
use crate::error::{Mismatch, ReplResult};

/// Net effect of one or more CRUD entries on a single document.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzedOpKind {
    /// Nothing to do.
    Noop,
    /// Insert a document that must not exist yet.
    Insert(Document),
    /// Remove the document if present.
    Delete,
    /// Replace the document if present.
    Replace(Document),
    /// Remove the document if present, then insert this one.
    DeleteCreate(Document),
    /// Modify the document; with `upsert`, create it from `{_id}` first
    /// when missing.
    Update {
        /// Modifiers, applied in order.
        modifiers: Vec<Modifier>,
        /// Create when missing.
        upsert: bool,
    },
}

impl AnalyzedOpKind {
    /// Short name, for mismatches and logs.
    pub fn name(&self) -> &'static str {
        match self {
            AnalyzedOpKind::Noop => "noop",
            AnalyzedOpKind::Insert(_) => "insert",
            AnalyzedOpKind::Delete => "delete",
            AnalyzedOpKind::Replace(_) => "replace",
            AnalyzedOpKind::DeleteCreate(_) => "delete-create",
            AnalyzedOpKind::Update { upsert: true, .. } => "upsert",
            AnalyzedOpKind::Update { upsert: false, .. } => "update",
        }
    }

    /// Returns true if the document exists after this operation whatever
    /// the state before.
    fn guarantees_existence(&self) -> bool {
        matches!(
            self,
            AnalyzedOpKind::Insert(_)
                | AnalyzedOpKind::DeleteCreate(_)
                | AnalyzedOpKind::Update { upsert: true, .. }
        )
    }
}

/// The folded effect of a run of entries on one document.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedOp {
    key: DocKey,
    id: Value,
    requires_match: bool,
    kind: AnalyzedOpKind,
}

impl AnalyzedOp {
    /// Creates an analyzed operation.
    pub fn new(id: Value, kind: AnalyzedOpKind, requires_match: bool) -> Self {
        Self {
            key: DocKey::from_id(&id),
            id,
            requires_match,
            kind,
        }
    }

    /// Interprets a CRUD entry under `context`. Returns `None` for noops
    /// and commands.
    ///
    /// # Errors
    ///
    /// Fails if the entry has no usable `_id` or a malformed update.
    pub fn from_operation(op: &OplogOperation, context: &ApplierContext) -> ReplResult<Option<Self>> {
        let analyzed = match &op.kind {
            OpKind::Insert { doc } => {
                let id = op.document_id()?.cloned().unwrap_or(Value::Null);
                let kind = if context.is_reapplying() {
                    AnalyzedOpKind::DeleteCreate(doc.clone())
                } else {
                    AnalyzedOpKind::Insert(doc.clone())
                };
                Self::new(id, kind, false)
            }
            OpKind::Update { id, update, upsert } => {
                op.document_id()?;
                let upsert = *upsert || context.is_updates_as_upserts();
                match UpdateAction::parse(update)? {
                    UpdateAction::Replace(doc) => {
                        let doc = with_id(&doc, id)?;
                        if upsert {
                            Self::new(id.clone(), AnalyzedOpKind::DeleteCreate(doc), false)
                        } else {
                            Self::new(id.clone(), AnalyzedOpKind::Replace(doc), true)
                        }
                    }
                    UpdateAction::Modify(modifiers) => Self::new(
                        id.clone(),
                        AnalyzedOpKind::Update { modifiers, upsert },
                        !upsert,
                    ),
                }
            }
            OpKind::Delete { id } => {
                op.document_id()?;
                Self::new(id.clone(), AnalyzedOpKind::Delete, true)
            }
            OpKind::Noop | OpKind::Command { .. } => return Ok(None),
        };
        Ok(Some(analyzed))
    }

    /// Key of the target document.
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    /// `_id` of the target document.
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// The net effect.
    pub fn kind(&self) -> &AnalyzedOpKind {
        &self.kind
    }

    /// Whether a missing target is an error.
    pub fn requires_match(&self) -> bool {
        self.requires_match
    }

    /// Whether the executor must look up the did of the target.
    pub fn requires_to_fetch_id(&self) -> bool {
        !matches!(self.kind, AnalyzedOpKind::Noop | AnalyzedOpKind::Insert(_))
    }

    /// Whether the executor must load the current document.
    pub fn requires_fetch(&self) -> bool {
        matches!(self.kind, AnalyzedOpKind::Update { .. })
    }

    /// Whether an existing target is removed.
    pub fn deletes(&self) -> bool {
        matches!(
            self.kind,
            AnalyzedOpKind::Delete
                | AnalyzedOpKind::Replace(_)
                | AnalyzedOpKind::DeleteCreate(_)
                | AnalyzedOpKind::Update { .. }
        )
    }

    /// The mismatch reported when a required target is missing.
    pub fn mismatch(&self) -> Mismatch {
        Mismatch {
            key: self.key.clone(),
            kind: self.kind.name(),
        }
    }

    /// Document to insert after deletions.
    ///
    /// `matched` tells whether the target existed; `prior` is its content
    /// when it was fetched.
    ///
    /// # Errors
    ///
    /// Fails when a modifier cannot be applied to the prior document.
    pub fn calculate_doc_to_insert(
        &self,
        matched: bool,
        prior: Option<&Document>,
    ) -> ReplResult<Option<Document>> {
        Ok(match &self.kind {
            AnalyzedOpKind::Noop | AnalyzedOpKind::Delete => None,
            AnalyzedOpKind::Insert(doc) | AnalyzedOpKind::DeleteCreate(doc) => Some(doc.clone()),
            AnalyzedOpKind::Replace(doc) => matched.then(|| doc.clone()),
            AnalyzedOpKind::Update { modifiers, upsert } => match prior {
                Some(doc) if matched => Some(Modifier::apply_all(modifiers, doc)?),
                _ if *upsert => Some(Modifier::apply_all(modifiers, &self.seed_document())?),
                _ => None,
            },
        })
    }

    fn seed_document(&self) -> Document {
        let mut object = Map::new();
        object.insert(ID_FIELD.to_string(), self.id.clone());
        Value::Object(object)
    }

    /// Merges `next`, a later operation on the same document, into this
    /// one.
    ///
    /// Returns the combined operation when applying it once has the same
    /// effect as applying both in order. Otherwise both operations are
    /// handed back unchanged and must be executed separately.
    pub fn and_then(self, next: AnalyzedOp) -> Result<AnalyzedOp, (AnalyzedOp, AnalyzedOp)> {
        debug_assert_eq!(self.key, next.key);
        match fold_kinds(&self, &next) {
            Some((kind, requires_match)) => Ok(AnalyzedOp {
                key: self.key,
                id: self.id,
                requires_match,
                kind,
            }),
            None => Err((self, next)),
        }
    }
}

fn concat(a: &[Modifier], b: &[Modifier]) -> Vec<Modifier> {
    a.iter().chain(b).cloned().collect()
}

fn fold_kinds(prev: &AnalyzedOp, next: &AnalyzedOp) -> Option<(AnalyzedOpKind, bool)> {
    use AnalyzedOpKind as K;

    let p_rm = prev.requires_match;
    let n_rm = next.requires_match;

    match (&prev.kind, &next.kind) {
        (_, K::Noop) => Some((prev.kind.clone(), p_rm)),
        (K::Noop, _) => Some((next.kind.clone(), next.requires_match)),

        // Folding would drop the insert's duplicate-key check.
        (K::Insert(_), K::DeleteCreate(_)) => None,
        // Whatever happened before, the document ends up as `doc`.
        (_, K::DeleteCreate(doc)) => Some((K::DeleteCreate(doc.clone()), p_rm)),

        (K::Insert(_), K::Delete) => Some((K::Noop, p_rm)),
        (p, K::Delete) if p.guarantees_existence() => Some((K::Delete, p_rm)),
        (K::Replace(_) | K::Update { upsert: false, .. }, K::Delete) => {
            Some((K::Delete, p_rm || n_rm))
        }
        // The second delete can only match if it is not required to.
        (K::Delete, K::Delete) if !n_rm => Some((K::Delete, p_rm)),

        (K::Delete, K::Insert(doc)) => Some((K::DeleteCreate(doc.clone()), p_rm)),

        (K::Insert(_), K::Replace(doc)) => Some((K::Insert(doc.clone()), p_rm)),
        (K::DeleteCreate(_) | K::Update { upsert: true, .. }, K::Replace(doc)) => {
            Some((K::DeleteCreate(doc.clone()), p_rm))
        }
        (K::Replace(_) | K::Update { upsert: false, .. }, K::Replace(doc)) => {
            Some((K::Replace(doc.clone()), p_rm || n_rm))
        }
        (K::Delete, K::Replace(_)) if !n_rm => Some((K::Delete, p_rm)),

        (K::Insert(doc), K::Update { modifiers, .. }) => Modifier::apply_all(modifiers, doc)
            .ok()
            .map(|d| (K::Insert(d), p_rm)),
        (K::DeleteCreate(doc), K::Update { modifiers, .. }) => {
            Modifier::apply_all(modifiers, doc)
                .ok()
                .map(|d| (K::DeleteCreate(d), p_rm))
        }
        (K::Replace(doc), K::Update { modifiers, upsert: false }) => {
            Modifier::apply_all(modifiers, doc)
                .ok()
                .map(|d| (K::Replace(d), p_rm || n_rm))
        }
        (K::Delete, K::Update { modifiers, upsert: true }) => {
            Modifier::apply_all(modifiers, &prev.seed_document())
                .ok()
                .map(|d| (K::DeleteCreate(d), p_rm))
        }
        (K::Delete, K::Update { upsert: false, .. }) if !n_rm => Some((K::Delete, p_rm)),
        (
            K::Update {
                modifiers: first,
                upsert: first_upsert,
            },
            K::Update {
                modifiers: second,
                upsert: second_upsert,
            },
        ) => match (first_upsert, second_upsert) {
            (true, _) => Some((
                K::Update {
                    modifiers: concat(first, second),
                    upsert: true,
                },
                p_rm,
            )),
            (false, false) => Some((
                K::Update {
                    modifiers: concat(first, second),
                    upsert: false,
                },
                p_rm || n_rm,
            )),
            (false, true) => None,
        },

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(field: &str, value: Value) -> AnalyzedOpKind {
        AnalyzedOpKind::Update {
            modifiers: vec![Modifier::Set {
                path: field.into(),
                value,
            }],
            upsert: false,
        }
    }

    fn op(kind: AnalyzedOpKind, requires_match: bool) -> AnalyzedOp {
        AnalyzedOp::new(json!(1), kind, requires_match)
    }

    #[test]
    fn insert_then_update_folds_into_insert() {
        let folded = op(AnalyzedOpKind::Insert(json!({"_id": 1, "a": 1})), false)
            .and_then(op(set("b", json!(2)), true))
            .unwrap();
        assert_eq!(
            folded.kind(),
            &AnalyzedOpKind::Insert(json!({"_id": 1, "a": 1, "b": 2}))
        );
        assert!(!folded.requires_match());
    }

    #[test]
    fn insert_then_delete_is_noop() {
        let folded = op(AnalyzedOpKind::Insert(json!({"_id": 1})), false)
            .and_then(op(AnalyzedOpKind::Delete, true))
            .unwrap();
        assert_eq!(folded.kind(), &AnalyzedOpKind::Noop);
    }

    #[test]
    fn delete_then_insert_is_delete_create() {
        let folded = op(AnalyzedOpKind::Delete, true)
            .and_then(op(AnalyzedOpKind::Insert(json!({"_id": 1, "v": 2})), false))
            .unwrap();
        assert_eq!(
            folded.kind(),
            &AnalyzedOpKind::DeleteCreate(json!({"_id": 1, "v": 2}))
        );
        assert!(folded.requires_match());
    }

    #[test]
    fn update_after_update_keeps_required_match() {
        let folded = op(set("a", json!(1)), true)
            .and_then(op(set("b", json!(2)), true))
            .unwrap();
        match folded.kind() {
            AnalyzedOpKind::Update { modifiers, upsert } => {
                assert_eq!(modifiers.len(), 2);
                assert!(!upsert);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(folded.requires_match());
    }

    #[test]
    fn incompatible_pairs_are_handed_back() {
        let upsert = AnalyzedOpKind::Update {
            modifiers: vec![],
            upsert: true,
        };
        let (a, b) = op(set("a", json!(1)), true)
            .and_then(op(upsert, false))
            .unwrap_err();
        assert_eq!(a.kind().name(), "update");
        assert_eq!(b.kind().name(), "upsert");

        assert!(op(AnalyzedOpKind::Insert(json!({"_id": 1})), false)
            .and_then(op(AnalyzedOpKind::Insert(json!({"_id": 1})), false))
            .is_err());
        assert!(op(AnalyzedOpKind::Delete, true)
            .and_then(op(AnalyzedOpKind::Delete, true))
            .is_err());
    }

    #[test]
    fn insert_is_not_folded_into_an_upsert_replace() {
        let (insert, replace) = op(AnalyzedOpKind::Insert(json!({"_id": 1})), false)
            .and_then(op(AnalyzedOpKind::DeleteCreate(json!({"_id": 1, "v": 2})), false))
            .unwrap_err();
        assert_eq!(insert.kind(), &AnalyzedOpKind::Insert(json!({"_id": 1})));
        assert_eq!(
            replace.kind(),
            &AnalyzedOpKind::DeleteCreate(json!({"_id": 1, "v": 2}))
        );

        let folded = op(AnalyzedOpKind::Delete, true)
            .and_then(op(AnalyzedOpKind::DeleteCreate(json!({"_id": 1})), false))
            .unwrap();
        assert_eq!(folded.kind(), &AnalyzedOpKind::DeleteCreate(json!({"_id": 1})));
    }

    #[test]
    fn calculate_doc_to_insert() {
        let update = op(set("a", json!(5)), true);
        assert_eq!(update.calculate_doc_to_insert(false, None).unwrap(), None);
        assert_eq!(
            update
                .calculate_doc_to_insert(true, Some(&json!({"_id": 1, "a": 1})))
                .unwrap(),
            Some(json!({"_id": 1, "a": 5}))
        );

        let upsert = op(
            AnalyzedOpKind::Update {
                modifiers: vec![Modifier::Set {
                    path: "a".into(),
                    value: json!(5),
                }],
                upsert: true,
            },
            false,
        );
        assert_eq!(
            upsert.calculate_doc_to_insert(false, None).unwrap(),
            Some(json!({"_id": 1, "a": 5}))
        );

        let replace = op(AnalyzedOpKind::Replace(json!({"_id": 1, "r": true})), true);
        assert_eq!(replace.calculate_doc_to_insert(false, None).unwrap(), None);
        assert!(replace.calculate_doc_to_insert(true, None).unwrap().is_some());
    }

    #[test]
    fn from_operation_respects_context() {
        use relodb_oplog::{Namespace, Position};

        let ns = Namespace::new("db", "c");
        let insert = OplogOperation::insert(Position::new(1, 1), 0, ns.clone(), json!({"_id": 1}));
        let strict = AnalyzedOp::from_operation(&insert, &ApplierContext::new())
            .unwrap()
            .unwrap();
        assert_eq!(strict.kind().name(), "insert");
        let lenient = AnalyzedOp::from_operation(&insert, &ApplierContext::recovery())
            .unwrap()
            .unwrap();
        assert_eq!(lenient.kind().name(), "delete-create");

        let update = OplogOperation::update(
            Position::new(1, 2),
            0,
            ns.clone(),
            json!(1),
            json!({"$set": {"a": 1}}),
            false,
        );
        let plain = AnalyzedOp::from_operation(&update, &ApplierContext::new())
            .unwrap()
            .unwrap();
        assert!(plain.requires_match());
        let upserted = AnalyzedOp::from_operation(&update, &ApplierContext::recovery())
            .unwrap()
            .unwrap();
        assert!(!upserted.requires_match());
        assert_eq!(upserted.kind().name(), "upsert");

        let noop = OplogOperation::noop(Position::new(1, 3), 0, ns);
        assert!(AnalyzedOp::from_operation(&noop, &ApplierContext::new())
            .unwrap()
            .is_none());
    }
}
