//! Error types for the oplog model.

use thiserror::Error;

/// Result type for oplog model operations.
pub type OplogResult<T> = Result<T, OplogError>;

/// Errors raised while interpreting oplog operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OplogError {
    /// A namespace string could not be split into database and collection.
    #[error("invalid namespace '{0}'")]
    InvalidNamespace(String),

    /// A document is not an object or lacks a usable `_id`.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// An update document mixes operators with fields or is malformed.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// An update uses an operator this engine does not apply.
    #[error("unsupported update operator '{0}'")]
    UnsupportedModifier(String),

    /// A command this engine does not apply.
    #[error("unsupported command '{0}'")]
    UnsupportedCommand(String),

    /// A modifier targeted a value of the wrong type.
    #[error("cannot apply {modifier} to field '{path}': {reason}")]
    TypeMismatch {
        /// Modifier name, e.g. `$set`.
        modifier: &'static str,
        /// Dotted field path.
        path: String,
        /// What went wrong.
        reason: String,
    },
}

impl OplogError {
    /// Returns true if the error names something the engine does not support,
    /// as opposed to malformed input.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            OplogError::UnsupportedModifier(_) | OplogError::UnsupportedCommand(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_classification() {
        assert!(OplogError::UnsupportedCommand("applyOps".into()).is_unsupported());
        assert!(OplogError::UnsupportedModifier("$push".into()).is_unsupported());
        assert!(!OplogError::InvalidNamespace("nodot".into()).is_unsupported());
    }

    #[test]
    fn error_display() {
        let err = OplogError::TypeMismatch {
            modifier: "$set",
            path: "a.b".into(),
            reason: "'a' holds non-object 3".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot apply $set to field 'a.b': 'a' holds non-object 3"
        );
    }
}
