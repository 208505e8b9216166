//! Conflict resolution policies

use crate::document::Document;

/// Outcome of comparing a local and a remote version of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    TakeRemote,
    KeepLocal,
}

/// Picks a winner between two versions of the same document.
///
/// Implementations must be deterministic and commutative: every replica
/// that sees the same set of versions must end up with the same winner.
pub trait ConflictHandler: Send + Sync {
    fn resolve(&self, local: &Document, remote: &Document) -> Resolution;
}

/// Highest revision wins; identical revisions keep the local copy
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictHandler for LastWriteWins {
    fn resolve(&self, local: &Document, remote: &Document) -> Resolution {
        if remote.revision > local.revision {
            Resolution::TakeRemote
        } else {
            Resolution::KeepLocal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentId, Revision};
    use crate::value::Value;
    use serde_json::json;

    fn version(height: u64, name: &str) -> Document {
        let data = Value::from(json!({"id": "1", "name": name}));
        Document {
            id: DocumentId::new("1").unwrap(),
            revision: Revision::compute(height, &data, false),
            data,
            deleted: false,
            updated_at: 0,
        }
    }

    #[test]
    fn test_higher_height_wins() {
        let lww = LastWriteWins;
        assert_eq!(lww.resolve(&version(1, "a"), &version(2, "b")), Resolution::TakeRemote);
        assert_eq!(lww.resolve(&version(3, "a"), &version(2, "b")), Resolution::KeepLocal);
    }

    #[test]
    fn test_same_height_converges() {
        let lww = LastWriteWins;
        let a = version(2, "a");
        let b = version(2, "b");
        // Whichever side holds which copy, both replicas keep the same one
        let winner_on_a = match lww.resolve(&a, &b) {
            Resolution::TakeRemote => &b,
            Resolution::KeepLocal => &a,
        };
        let winner_on_b = match lww.resolve(&b, &a) {
            Resolution::TakeRemote => &a,
            Resolution::KeepLocal => &b,
        };
        assert_eq!(winner_on_a.revision, winner_on_b.revision);
        assert_eq!(lww.resolve(&a, &a.clone()), Resolution::KeepLocal);
    }
}
