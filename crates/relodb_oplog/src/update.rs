//! Update documents.
//!
//! An oplog update carries either a full replacement document or a set of
//! field modifiers (`$set`, `$unset`). Modifiers address fields by dotted
//! path and create intermediate objects as needed.
//!
//! Only modifiers that give the same result when applied twice are
//! accepted: recovery replays oplog windows over data that may already
//! hold their effect. Relative modifiers such as `$inc` are rejected with
//! [`OplogError::UnsupportedModifier`]; primaries log them as `$set`.

use serde_json::{Map, Value};

use crate::error::{OplogError, OplogResult};
use crate::{Document, ID_FIELD};

/// A single field modification.
#[derive(Debug, Clone, PartialEq)]
pub enum Modifier {
    /// Sets a field to a value.
    Set {
        /// Dotted field path.
        path: String,
        /// New value.
        value: Value,
    },
    /// Removes a field if present.
    Unset {
        /// Dotted field path.
        path: String,
    },
}

/// Parsed form of an update document.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    /// The whole document is replaced (the `_id` is kept).
    Replace(Document),
    /// Fields are modified in order.
    Modify(Vec<Modifier>),
}

impl UpdateAction {
    /// Parses an update document.
    ///
    /// A document whose keys all start with `$` is a modifier update; one
    /// with no such keys is a replacement. Mixing both is rejected.
    pub fn parse(update: &Value) -> OplogResult<Self> {
        let object = update
            .as_object()
            .ok_or_else(|| OplogError::InvalidUpdate(format!("expected an object, got {update}")))?;

        let operators = object.keys().filter(|k| k.starts_with('$')).count();
        if operators == 0 {
            return Ok(UpdateAction::Replace(update.clone()));
        }
        if operators != object.len() {
            return Err(OplogError::InvalidUpdate(
                "update mixes operators and plain fields".into(),
            ));
        }

        let mut modifiers = Vec::new();
        for (op, fields) in object {
            let fields = fields.as_object().ok_or_else(|| {
                OplogError::InvalidUpdate(format!("argument of {op} must be an object"))
            })?;
            for (path, value) in fields {
                check_path(path)?;
                let modifier = match op.as_str() {
                    "$set" => Modifier::Set {
                        path: path.clone(),
                        value: value.clone(),
                    },
                    "$unset" => Modifier::Unset { path: path.clone() },
                    other => return Err(OplogError::UnsupportedModifier(other.to_string())),
                };
                modifiers.push(modifier);
            }
        }
        Ok(UpdateAction::Modify(modifiers))
    }
}

fn check_path(path: &str) -> OplogResult<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(OplogError::InvalidUpdate(format!("invalid field path '{path}'")));
    }
    if path == ID_FIELD || path.starts_with("_id.") {
        return Err(OplogError::InvalidUpdate(format!(
            "field '{path}' is immutable"
        )));
    }
    Ok(())
}

impl Modifier {
    /// Dotted path this modifier touches.
    pub fn path(&self) -> &str {
        match self {
            Modifier::Set { path, .. } | Modifier::Unset { path } => path,
        }
    }

    /// Applies the modifier to a document in place.
    pub fn apply(&self, doc: &mut Map<String, Value>) -> OplogResult<()> {
        match self {
            Modifier::Set { path, value } => {
                let (parent, leaf) = parent_for_write(doc, path, "$set")?;
                parent.insert(leaf.to_string(), value.clone());
            }
            Modifier::Unset { path } => {
                if let Some((parent, leaf)) = parent_for_read(doc, path) {
                    parent.remove(leaf);
                }
            }
        }
        Ok(())
    }

    /// Applies a sequence of modifiers to a copy of `doc`.
    pub fn apply_all(modifiers: &[Modifier], doc: &Document) -> OplogResult<Document> {
        let mut object = doc
            .as_object()
            .cloned()
            .ok_or_else(|| OplogError::InvalidDocument(format!("expected an object, got {doc}")))?;
        for modifier in modifiers {
            modifier.apply(&mut object)?;
        }
        Ok(Value::Object(object))
    }
}

/// Returns `replacement` carrying the `_id` of the document it replaces.
///
/// # Errors
///
/// Fails if `replacement` is not an object or names a different `_id`.
pub fn with_id(replacement: &Document, id: &Value) -> OplogResult<Document> {
    let mut object = replacement.as_object().cloned().ok_or_else(|| {
        OplogError::InvalidDocument(format!("expected an object, got {replacement}"))
    })?;
    if let Some(existing) = object.get(ID_FIELD) {
        if existing != id {
            return Err(OplogError::InvalidUpdate(format!(
                "replacement changes {ID_FIELD} from {id} to {existing}"
            )));
        }
    }
    object.insert(ID_FIELD.to_string(), id.clone());
    Ok(Value::Object(object))
}

fn parent_for_write<'a, 'p>(
    doc: &'a mut Map<String, Value>,
    path: &'p str,
    modifier: &'static str,
) -> OplogResult<(&'a mut Map<String, Value>, &'p str)> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or(path);
    let mut current = doc;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(inner) => inner,
            other => {
                return Err(OplogError::TypeMismatch {
                    modifier,
                    path: path.to_string(),
                    reason: format!("'{segment}' holds non-object {other}"),
                })
            }
        };
    }
    Ok((current, leaf))
}

fn parent_for_read<'a, 'p>(
    doc: &'a mut Map<String, Value>,
    path: &'p str,
) -> Option<(&'a mut Map<String, Value>, &'p str)> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop()?;
    let mut current = doc;
    for segment in segments {
        current = current.get_mut(segment)?.as_object_mut()?;
    }
    Some((current, leaf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_replacement() {
        let action = UpdateAction::parse(&json!({"name": "bob"})).unwrap();
        assert_eq!(action, UpdateAction::Replace(json!({"name": "bob"})));
    }

    #[test]
    fn parse_rejects_mixed_and_unknown() {
        assert!(matches!(
            UpdateAction::parse(&json!({"$set": {"a": 1}, "b": 2})),
            Err(OplogError::InvalidUpdate(_))
        ));
        assert!(matches!(
            UpdateAction::parse(&json!({"$push": {"a": 1}})),
            Err(OplogError::UnsupportedModifier(op)) if op == "$push"
        ));
        assert!(UpdateAction::parse(&json!({"$set": {"_id": 2}})).is_err());
    }

    #[test]
    fn relative_modifiers_are_rejected() {
        for op in ["$inc", "$mul", "$push"] {
            let mut update = Map::new();
            update.insert(op.to_string(), json!({"n": 5}));
            let err = UpdateAction::parse(&Value::Object(update)).unwrap_err();
            assert!(err.is_unsupported(), "{op}: {err}");
        }
    }

    #[test]
    fn modifiers_apply_in_order() {
        let UpdateAction::Modify(modifiers) =
            UpdateAction::parse(&json!({"$set": {"a.b": 1, "c": "x"}, "$unset": {"n": ""}}))
                .unwrap()
        else {
            panic!("expected modifiers");
        };
        let doc = Modifier::apply_all(&modifiers, &json!({"_id": 1, "n": 3})).unwrap();
        assert_eq!(doc, json!({"_id": 1, "a": {"b": 1}, "c": "x"}));

        let unset = [
            Modifier::Unset { path: "a.b".into() },
            Modifier::Unset {
                path: "missing.x".into(),
            },
        ];
        assert_eq!(
            Modifier::apply_all(&unset, &doc).unwrap(),
            json!({"_id": 1, "a": {}, "c": "x"})
        );
    }

    #[test]
    fn modifiers_apply_twice_to_the_same_result() {
        let UpdateAction::Modify(modifiers) =
            UpdateAction::parse(&json!({"$set": {"n": 5, "a.b": [1]}, "$unset": {"m": ""}}))
                .unwrap()
        else {
            panic!("expected modifiers");
        };
        let once = Modifier::apply_all(&modifiers, &json!({"_id": 1, "n": 0, "m": 1})).unwrap();
        assert_eq!(Modifier::apply_all(&modifiers, &once).unwrap(), once);
    }

    #[test]
    fn set_through_a_scalar_is_a_type_mismatch() {
        let modifier = Modifier::Set {
            path: "n.x".into(),
            value: json!(1),
        };
        let err = Modifier::apply_all(&[modifier], &json!({"_id": 1, "n": "a"})).unwrap_err();
        assert!(matches!(err, OplogError::TypeMismatch { modifier: "$set", .. }));
    }

    #[test]
    fn replacement_keeps_id() {
        assert_eq!(
            with_id(&json!({"v": 2}), &json!("k")).unwrap(),
            json!({"_id": "k", "v": 2})
        );
        assert_eq!(
            with_id(&json!({"_id": "k", "v": 2}), &json!("k")).unwrap(),
            json!({"_id": "k", "v": 2})
        );
        assert!(with_id(&json!({"_id": "other", "v": 2}), &json!("k")).is_err());
        assert!(with_id(&json!(3), &json!("k")).is_err());
    }
}
