//! In-memory storage backend

use crate::{CheckpointKey, Lease, Storage, StorageError, StorageStats};
use async_trait::async_trait;
use dashmap::DashMap;
use lofi_core::{now_ms, ChangeEvent, Document, DocumentId, LocalDocument};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// In-memory storage backend
///
/// Fast, volatile storage suitable for development, tests and sharing
/// between instances of one process. Data is lost when the process exits.
/// Rows are kept serialized so every load hands out fresh copies.
#[derive(Default)]
pub struct MemoryStorage {
    /// (collection, id) -> document bytes
    documents: DashMap<(String, String), Vec<u8>>,
    /// collection -> sequence -> event bytes
    changes: DashMap<String, BTreeMap<u64, Vec<u8>>>,
    checkpoints: DashMap<CheckpointKey, serde_json::Value>,
    /// (namespace, key) -> local document bytes
    locals: DashMap<(String, String), Vec<u8>>,
    leases: Mutex<HashMap<String, Lease>>,
    /// Held while documents and changes are written together
    commit: Mutex<()>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn commit_changes(
        &self,
        collection: &str,
        docs: &[Document],
        events: &[ChangeEvent],
    ) -> Result<(), StorageError> {
        // Serialize everything up front so a failure leaves storage untouched
        let doc_rows = docs
            .iter()
            .map(|doc| Ok((doc.id.as_str().to_string(), serde_json::to_vec(doc)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;
        let event_rows = events
            .iter()
            .map(|event| Ok((event.sequence, serde_json::to_vec(event)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        let _commit = self.commit.lock();
        for (id, bytes) in doc_rows {
            self.documents.insert((collection.to_string(), id), bytes);
        }
        self.changes
            .entry(collection.to_string())
            .or_default()
            .extend(event_rows);
        Ok(())
    }

    async fn load_documents(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        let mut docs = Vec::new();
        for entry in self.documents.iter() {
            if entry.key().0 == collection {
                docs.push(serde_json::from_slice(entry.value())?);
            }
        }
        Ok(docs)
    }

    async fn purge_documents(&self, collection: &str, ids: &[DocumentId]) -> Result<usize, StorageError> {
        Ok(ids
            .iter()
            .filter(|id| {
                self.documents
                    .remove(&(collection.to_string(), id.as_str().to_string()))
                    .is_some()
            })
            .count())
    }

    async fn compact_changes(&self, collection: &str, through: u64) -> Result<usize, StorageError> {
        let _commit = self.commit.lock();
        match self.changes.get_mut(collection) {
            Some(mut log) => {
                let kept = log.split_off(&through.saturating_add(1));
                let dropped = log.len();
                *log = kept;
                Ok(dropped)
            }
            None => Ok(0),
        }
    }

    async fn load_changes(&self, collection: &str) -> Result<Vec<ChangeEvent>, StorageError> {
        match self.changes.get(collection) {
            Some(log) => log
                .values()
                .map(|bytes| serde_json::from_slice(bytes).map_err(StorageError::from))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    async fn save_checkpoint(&self, key: &CheckpointKey, checkpoint: &serde_json::Value) -> Result<(), StorageError> {
        self.checkpoints.insert(key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, key: &CheckpointKey) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.checkpoints.get(key).map(|r| r.value().clone()))
    }

    async fn set_local(&self, namespace: &str, doc: &LocalDocument) -> Result<(), StorageError> {
        self.locals.insert(
            (namespace.to_string(), doc.key.clone()),
            serde_json::to_vec(doc)?,
        );
        Ok(())
    }

    async fn load_locals(&self, namespace: &str) -> Result<Vec<LocalDocument>, StorageError> {
        let mut docs = Vec::new();
        for entry in self.locals.iter() {
            if entry.key().0 == namespace {
                docs.push(serde_json::from_slice(entry.value())?);
            }
        }
        Ok(docs)
    }

    async fn remove_local(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .locals
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    async fn try_acquire_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = now_ms();
        let mut leases = self.leases.lock();
        let available = match leases.get(name) {
            Some(lease) => lease.owner == owner || lease.expires_at <= now,
            None => true,
        };
        if available {
            leases.insert(
                name.to_string(),
                Lease {
                    name: name.to_string(),
                    owner: owner.to_string(),
                    expires_at: now + ttl.as_millis() as u64,
                },
            );
        }
        Ok(available)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let mut leases = self.leases.lock();
        match leases.get(name) {
            Some(lease) if lease.owner == owner => {
                leases.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lease_holder(&self, name: &str) -> Result<Option<Lease>, StorageError> {
        let now = now_ms();
        Ok(self
            .leases
            .lock()
            .get(name)
            .filter(|lease| lease.expires_at > now)
            .cloned())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let doc_bytes: usize = self.documents.iter().map(|e| e.value().len()).sum();
        let change_count: usize = self.changes.iter().map(|e| e.value().len()).sum();
        let change_bytes: usize = self
            .changes
            .iter()
            .map(|e| e.value().values().map(Vec::len).sum::<usize>())
            .sum();

        Ok(StorageStats {
            document_count: self.documents.len(),
            change_count,
            total_size_bytes: doc_bytes + change_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;
    use lofi_core::{Collection, CollectionSchema};
    use serde_json::json;

    fn todos() -> Collection {
        Collection::standalone(CollectionSchema::new("todos").allow_additional_fields()).unwrap()
    }

    fn events(c: &Collection) -> Vec<ChangeEvent> {
        c.changes().since(0).iter().map(|e| (**e).clone()).collect()
    }

    #[tokio::test]
    async fn test_commit_and_load_documents() {
        let storage = MemoryStorage::new();
        let c = todos();
        let doc = c.insert(json!({"id": "1", "name": "a"})).unwrap();

        storage.commit_changes("todos", &[doc.clone()], &events(&c)).await.unwrap();
        assert_eq!(storage.load_documents("todos").await.unwrap(), vec![doc.clone()]);
        assert_eq!(storage.load_changes("todos").await.unwrap(), events(&c));
        assert!(storage.load_documents("other").await.unwrap().is_empty());

        assert_eq!(storage.purge_documents("todos", &[doc.id.clone()]).await.unwrap(), 1);
        assert!(storage.load_documents("todos").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changes_are_ordered_and_idempotent() {
        let storage = MemoryStorage::new();
        let c = todos();
        c.insert(json!({"id": "1"})).unwrap();
        c.insert(json!({"id": "2"})).unwrap();
        let events = events(&c);

        storage.commit_changes("todos", &[], &events[1..]).await.unwrap();
        storage.commit_changes("todos", &[], &events).await.unwrap();
        let loaded = storage.load_changes("todos").await.unwrap();
        assert_eq!(loaded, events);
    }

    #[tokio::test]
    async fn test_compact_changes() {
        let storage = MemoryStorage::new();
        let c = todos();
        for i in 0..4 {
            c.insert(json!({"id": i.to_string()})).unwrap();
        }
        storage.commit_changes("todos", &[], &events(&c)).await.unwrap();

        assert_eq!(storage.compact_changes("todos", 3).await.unwrap(), 3);
        assert_eq!(storage.compact_changes("todos", 3).await.unwrap(), 0);
        assert_eq!(storage.compact_changes("other", 3).await.unwrap(), 0);
        let left = storage.load_changes("todos").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].sequence, 4);
    }

    #[tokio::test]
    async fn test_checkpoints() {
        let storage = MemoryStorage::new();
        let key = CheckpointKey::new("todos", "remote", Direction::Pull);
        assert!(storage.load_checkpoint(&key).await.unwrap().is_none());

        storage.save_checkpoint(&key, &json!({"id": "9", "updated_at": 5})).await.unwrap();
        assert_eq!(
            storage.load_checkpoint(&key).await.unwrap(),
            Some(json!({"id": "9", "updated_at": 5}))
        );
        let push = CheckpointKey::new("todos", "remote", Direction::Push);
        assert!(storage.load_checkpoint(&push).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let storage = MemoryStorage::new();
        let ttl = Duration::from_millis(50);

        assert!(storage.try_acquire_lease("leader", "a", ttl).await.unwrap());
        assert!(!storage.try_acquire_lease("leader", "b", ttl).await.unwrap());
        // Renewal by the holder
        assert!(storage.try_acquire_lease("leader", "a", ttl).await.unwrap());
        assert_eq!(storage.lease_holder("leader").await.unwrap().unwrap().owner, "a");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(storage.lease_holder("leader").await.unwrap().is_none());
        assert!(storage.try_acquire_lease("leader", "b", ttl).await.unwrap());

        assert!(!storage.release_lease("leader", "a").await.unwrap());
        assert!(storage.release_lease("leader", "b").await.unwrap());
        assert!(storage.try_acquire_lease("leader", "a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats() {
        let storage = MemoryStorage::new();
        let c = todos();
        let doc = c.insert(json!({"id": "1", "name": "some data here"})).unwrap();
        storage.commit_changes("todos", &[doc], &events(&c)).await.unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.change_count, 1);
        assert!(stats.total_size_bytes > 0);
    }
}
