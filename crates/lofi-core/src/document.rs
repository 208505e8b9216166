//! Document types and revisions

use crate::error::{Error, Result};
use crate::value::{Fields, Value};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default upper bound for primary key length in bytes
pub const DEFAULT_MAX_KEY_LENGTH: usize = 100;

/// Number of hex characters kept from the content digest
const REVISION_HASH_LEN: usize = 16;

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Document identifier - UTF-8 string, pattern `[a-zA-Z0-9:_.-]+`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a new document ID with the default length limit
    pub fn new(id: impl Into<String>) -> Result<Self> {
        Self::with_max_length(id, DEFAULT_MAX_KEY_LENGTH)
    }

    /// Create a new document ID, validating the format against `max_length` bytes
    pub fn with_max_length(id: impl Into<String>, max_length: usize) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidDocumentId("Document ID cannot be empty".into()));
        }

        if id.len() > max_length {
            return Err(Error::InvalidDocumentId(format!(
                "Document ID exceeds {} bytes",
                max_length
            )));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.'))
        {
            return Err(Error::InvalidDocumentId(
                "Document ID must match pattern [a-zA-Z0-9:_.-]+".into(),
            ));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Revision marker: a write counter plus a digest of the content.
///
/// Revisions are totally ordered by `(height, hash)`, so any set of
/// competing revisions has one deterministic maximum on every replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    height: u64,
    hash: String,
}

impl Revision {
    /// Compute the revision for content written at `height`
    pub fn compute(height: u64, data: &Value, deleted: bool) -> Self {
        let mut hasher = Sha256::new();
        // Fields are a BTreeMap, so the encoding is canonical
        hasher.update(serde_json::to_vec(data).unwrap_or_default());
        hasher.update([deleted as u8]);
        let digest = hex::encode(hasher.finalize());

        Self {
            height,
            hash: digest[..REVISION_HASH_LEN].to_string(),
        }
    }

    /// Revision following `previous` for the given content
    pub fn next(previous: Option<&Revision>, data: &Value, deleted: bool) -> Self {
        let height = previous.map_or(1, |r| r.height + 1);
        Self::compute(height, data, deleted)
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

impl std::str::FromStr for Revision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (height, hash) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRevision(s.to_string()))?;
        let height = height
            .parse::<u64>()
            .map_err(|_| Error::InvalidRevision(s.to_string()))?;
        if height == 0 || hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidRevision(s.to_string()));
        }
        Ok(Self {
            height,
            hash: hash.to_string(),
        })
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A versioned document snapshot.
///
/// `data` always holds an object including the primary key field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub data: Value,
    pub revision: Revision,
    #[serde(default)]
    pub deleted: bool,
    pub updated_at: u64,
}

impl Document {
    /// Build a document at the revision following `previous`
    pub(crate) fn next_version(
        id: DocumentId,
        data: Value,
        deleted: bool,
        previous: Option<&Revision>,
    ) -> Self {
        let revision = Revision::next(previous, &data, deleted);
        Self {
            id,
            data,
            revision,
            deleted,
            updated_at: now_ms(),
        }
    }

    /// Get a field (or nested path) of the document body
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.data.get_path(path)
    }

    /// The document body as a field map
    pub fn fields(&self) -> Option<&Fields> {
        self.data.as_object()
    }

    /// True if this document is a tombstone
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// JSON view of the body (for handlers and logging)
    pub fn to_json(&self) -> serde_json::Value {
        (&self.data).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id_valid() {
        assert!(DocumentId::new("user:123").is_ok());
        assert!(DocumentId::new("cart_items-456").is_ok());
        assert!(DocumentId::new("1712345678.5").is_ok());
    }

    #[test]
    fn test_document_id_invalid() {
        assert!(DocumentId::new("").is_err());
        assert!(DocumentId::new("user/123").is_err());
        assert!(DocumentId::new("a".repeat(101)).is_err());
        assert!(DocumentId::with_max_length("abcd", 3).is_err());
    }

    #[test]
    fn test_revision_is_deterministic() {
        let data = Value::from(json!({"id": "1", "name": "a"}));
        let a = Revision::compute(3, &data, false);
        let b = Revision::compute(3, &data, false);
        assert_eq!(a, b);
        assert_ne!(a, Revision::compute(3, &data, true));
    }

    #[test]
    fn test_revision_ordering() {
        let data = Value::from(json!({"id": "1"}));
        let first = Revision::next(None, &data, false);
        let second = Revision::next(Some(&first), &data, false);
        assert_eq!(first.height(), 1);
        assert!(second > first);
    }

    #[test]
    fn test_revision_string_form() {
        let rev: Revision = "12-00ff".parse().unwrap();
        assert_eq!(rev.height(), 12);
        assert_eq!(rev.to_string(), "12-00ff");
        assert!("0-ab".parse::<Revision>().is_err());
        assert!("x-ab".parse::<Revision>().is_err());
        assert!("12".parse::<Revision>().is_err());
    }
}
