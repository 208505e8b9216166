//! Error types for LOFI Core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Invalid document ID: {0}")]
    InvalidDocumentId(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Revision conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Document already exists: {0}")]
    DocumentExists(String),

    #[error("Validation failed for {collection}: {message}")]
    Validation { collection: String, message: String },

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Invalid revision: {0}")]
    InvalidRevision(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Database is closed")]
    Closed,
}

impl Error {
    pub(crate) fn validation(collection: &str, message: impl Into<String>) -> Self {
        Error::Validation {
            collection: collection.to_string(),
            message: message.into(),
        }
    }

    /// True for revision mismatches that a caller may resolve by re-reading
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::DocumentExists(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for LOFI Core operations
pub type Result<T> = std::result::Result<T, Error>;
