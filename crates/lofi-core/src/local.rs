//! Local documents - instance-local key/value entries that never replicate

use crate::document::now_ms;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

const LOCAL_CHANNEL_CAPACITY: usize = 256;

/// A local document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDocument {
    pub key: String,
    pub data: serde_json::Value,
    /// Incremented on every write of this key
    pub revision: u64,
    pub updated_at: u64,
}

impl LocalDocument {
    /// Get a top-level field of the stored value
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.data.get(field)
    }
}

/// Notification of a local document write or removal
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    /// Empty for database-level entries, the collection name otherwise
    pub namespace: String,
    pub key: String,
    /// `None` when removed
    pub document: Option<LocalDocument>,
}

/// Key/value store of local documents for one namespace
pub struct LocalDocuments {
    namespace: String,
    entries: RwLock<HashMap<String, LocalDocument>>,
    sender: broadcast::Sender<LocalChange>,
}

impl LocalDocuments {
    pub fn new(namespace: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Self {
            namespace: namespace.into(),
            entries: RwLock::new(HashMap::new()),
            sender,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, key: &str) -> Option<LocalDocument> {
        self.entries.read().get(key).cloned()
    }

    /// Insert, failing if the key exists
    pub fn insert(&self, key: &str, data: serde_json::Value) -> Result<LocalDocument> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Err(Error::DocumentExists(key.to_string()));
        }
        let doc = self.write_locked(&mut entries, key, data);
        drop(entries);
        self.notify(key, Some(doc.clone()));
        Ok(doc)
    }

    /// Insert or overwrite
    pub fn set(&self, key: &str, data: serde_json::Value) -> Result<LocalDocument> {
        if key.is_empty() {
            return Err(Error::InvalidDocumentId("local document key cannot be empty".into()));
        }
        let doc = {
            let mut entries = self.entries.write();
            self.write_locked(&mut entries, key, data)
        };
        self.notify(key, Some(doc.clone()));
        Ok(doc)
    }

    /// Replace the value of `key` with `updater(current)` in one step
    pub fn update<F>(&self, key: &str, updater: F) -> Result<LocalDocument>
    where
        F: FnOnce(Option<&serde_json::Value>) -> serde_json::Value,
    {
        if key.is_empty() {
            return Err(Error::InvalidDocumentId("local document key cannot be empty".into()));
        }
        let doc = {
            let mut entries = self.entries.write();
            let data = updater(entries.get(key).map(|d| &d.data));
            self.write_locked(&mut entries, key, data)
        };
        self.notify(key, Some(doc.clone()));
        Ok(doc)
    }

    fn write_locked(
        &self,
        entries: &mut HashMap<String, LocalDocument>,
        key: &str,
        data: serde_json::Value,
    ) -> LocalDocument {
        let revision = entries.get(key).map_or(1, |d| d.revision + 1);
        let doc = LocalDocument {
            key: key.to_string(),
            data,
            revision,
            updated_at: now_ms(),
        };
        entries.insert(key.to_string(), doc.clone());
        doc
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let existed = self.entries.write().remove(key).is_some();
        if existed {
            self.notify(key, None);
        }
        existed
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Load persisted entries without emitting notifications
    pub fn restore(&self, docs: Vec<LocalDocument>) {
        let mut entries = self.entries.write();
        for doc in docs {
            entries.insert(doc.key.clone(), doc);
        }
    }

    /// All writes and removals in this namespace
    pub fn changes(&self) -> broadcast::Receiver<LocalChange> {
        self.sender.subscribe()
    }

    /// Observe one key: yields the current value first, then every change
    pub fn watch(&self, key: &str) -> LocalWatch {
        // Subscribe before reading so no write slips in between
        let receiver = self.sender.subscribe();
        LocalWatch {
            key: key.to_string(),
            current: Some(self.get(key)),
            receiver,
        }
    }

    fn notify(&self, key: &str, document: Option<LocalDocument>) {
        let _ = self.sender.send(LocalChange {
            namespace: self.namespace.clone(),
            key: key.to_string(),
            document,
        });
    }
}

/// Stream of values of a single local document
pub struct LocalWatch {
    key: String,
    current: Option<Option<LocalDocument>>,
    receiver: broadcast::Receiver<LocalChange>,
}

impl LocalWatch {
    /// Next value of the key (`Some(None)` when removed); `None` once closed
    pub async fn next(&mut self) -> Option<Option<LocalDocument>> {
        if let Some(current) = self.current.take() {
            return Some(current);
        }
        loop {
            match self.receiver.recv().await {
                Ok(change) if change.key == self.key => return Some(change.document),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
