//! LOFI Storage Backends
//!
//! Provides pluggable storage for everything a database persists:
//! - Memory (default): Fast, volatile storage
//! - SQLite: Embedded persistence
//!
//! Documents and change events reach storage through the [`Persister`],
//! which seals encrypted fields on the way out and opens them on load.

pub mod memory;
pub mod persister;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use lofi_core::{ChangeEvent, Document, DocumentId, LocalDocument};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Direction of a replication checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Pull,
    Push,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

/// Identifies one replication checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub collection: String,
    /// Name of the remote endpoint
    pub endpoint: String,
    pub direction: Direction,
}

impl CheckpointKey {
    pub fn new(collection: impl Into<String>, endpoint: impl Into<String>, direction: Direction) -> Self {
        Self {
            collection: collection.into(),
            endpoint: endpoint.into(),
            direction,
        }
    }
}

/// A leadership lease record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner: String,
    /// Unix millis
    pub expires_at: u64,
}

/// Storage backend trait
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write document states together with the change events that produced
    /// them. Either all of it is stored or none of it. Re-appending a known
    /// sequence replaces it.
    async fn commit_changes(
        &self,
        collection: &str,
        docs: &[Document],
        events: &[ChangeEvent],
    ) -> Result<(), StorageError>;

    /// Load every document of a collection, tombstones included
    async fn load_documents(&self, collection: &str) -> Result<Vec<Document>, StorageError>;

    /// Permanently remove documents. Returns how many existed.
    async fn purge_documents(&self, collection: &str, ids: &[DocumentId]) -> Result<usize, StorageError>;

    /// Drop change events with `sequence <= through`. Returns how many were dropped.
    async fn compact_changes(&self, collection: &str, through: u64) -> Result<usize, StorageError>;

    /// Load the change log of a collection in sequence order
    async fn load_changes(&self, collection: &str) -> Result<Vec<ChangeEvent>, StorageError>;

    async fn save_checkpoint(&self, key: &CheckpointKey, checkpoint: &serde_json::Value) -> Result<(), StorageError>;

    async fn load_checkpoint(&self, key: &CheckpointKey) -> Result<Option<serde_json::Value>, StorageError>;

    async fn set_local(&self, namespace: &str, doc: &LocalDocument) -> Result<(), StorageError>;

    async fn load_locals(&self, namespace: &str) -> Result<Vec<LocalDocument>, StorageError>;

    async fn remove_local(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;

    /// Take or renew the lease `name` for `owner`.
    ///
    /// Succeeds if the lease is free, expired, or already held by `owner`.
    /// Must be atomic across every instance sharing this storage.
    async fn try_acquire_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Release the lease if held by `owner`
    async fn release_lease(&self, name: &str, owner: &str) -> Result<bool, StorageError>;

    /// Current unexpired holder of a lease
    async fn lease_holder(&self, name: &str) -> Result<Option<Lease>, StorageError>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Core(#[from] lofi_core::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub document_count: usize,
    pub change_count: usize,
    pub total_size_bytes: usize,
}

pub use memory::MemoryStorage;
pub use persister::Persister;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
