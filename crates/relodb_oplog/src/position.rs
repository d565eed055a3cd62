//! Oplog positions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A point in the replicated oplog.
///
/// Positions are ordered by `(term, timestamp)`: a newer election term always
/// sorts after every entry of an older one, and within a term the wall-clock
/// timestamp decides. Both components are non-negative in practice, so
/// [`Position::EPOCH`] sorts before any real entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Position {
    /// Election term of the primary that wrote the entry.
    pub term: i64,
    /// Timestamp in milliseconds.
    #[serde(rename = "timestampMillis")]
    pub timestamp: i64,
}

impl Position {
    /// The position used before anything was ever applied.
    pub const EPOCH: Position = Position {
        term: 0,
        timestamp: 0,
    };

    /// Creates a position.
    pub const fn new(term: i64, timestamp: i64) -> Self {
        Self { term, timestamp }
    }

    /// Returns true for [`Position::EPOCH`].
    pub fn is_epoch(&self) -> bool {
        *self == Self::EPOCH
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(t:{}, ts:{})", self.term, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn term_dominates_timestamp() {
        assert!(Position::new(2, 0) > Position::new(1, 1_000_000));
        assert!(Position::new(1, 5) < Position::new(1, 6));
        assert!(Position::EPOCH < Position::new(0, 1));
    }

    #[test]
    fn json_shape() {
        let json = serde_json::to_value(Position::new(3, 150)).unwrap();
        assert_eq!(json, serde_json::json!({"term": 3, "timestampMillis": 150}));
    }

    proptest! {
        #[test]
        fn order_is_lexicographic(a in (0i64..100, 0i64..1000), b in (0i64..100, 0i64..1000)) {
            let pa = Position::new(a.0, a.1);
            let pb = Position::new(b.0, b.1);
            prop_assert_eq!(pa.cmp(&pb), a.cmp(&b));
        }
    }
}
