//! Persister - moves database state to and from a [`Storage`] backend
//!
//! Collections are in-memory; the persister loads them at open and then
//! flushes every change event past its per-collection watermark. Encrypted
//! fields are sealed on the way out and opened on load, so storage never
//! holds them in plaintext.

use crate::{Storage, StorageError};
use dashmap::DashMap;
use lofi_core::{
    open_fields, seal_fields, ChangeEvent, Collection, Database, DatabaseConfig, Document, FieldCipher,
    LocalDocuments,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Bridges a [`Database`] and its [`Storage`]
pub struct Persister {
    db: Arc<Database>,
    storage: Arc<dyn Storage>,
    /// collection -> last persisted sequence
    flushed: DashMap<String, u64>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Persister {
    /// Open a database from `config` and load its persisted state
    pub async fn open(config: DatabaseConfig, storage: Arc<dyn Storage>) -> Result<Arc<Self>, StorageError> {
        let db = Database::open(config)?;
        Self::attach(db, storage).await
    }

    /// Load persisted state into a freshly opened database
    pub async fn attach(db: Arc<Database>, storage: Arc<dyn Storage>) -> Result<Arc<Self>, StorageError> {
        let persister = Self {
            db,
            storage,
            flushed: DashMap::new(),
            flush_lock: tokio::sync::Mutex::new(()),
        };
        persister.load().await?;
        Ok(Arc::new(persister))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn load(&self) -> Result<(), StorageError> {
        let cipher = self.db.cipher();
        for collection in self.db.collections() {
            let name = collection.name().to_string();
            let docs = self
                .storage
                .load_documents(&name)
                .await?
                .into_iter()
                .map(|doc| open_document(&collection, doc, cipher.as_deref()))
                .collect::<Result<Vec<_>, _>>()?;
            let events = self
                .storage
                .load_changes(&name)
                .await?
                .into_iter()
                .map(|event| open_event(&collection, event, cipher.as_deref()))
                .collect::<Result<Vec<_>, _>>()?;

            collection.restore(docs, events)?;
            self.flushed.insert(name.clone(), collection.changes().last_sequence());
            collection.locals().restore(self.storage.load_locals(&name).await?);

            debug!(
                collection = %name,
                documents = collection.len(),
                sequence = collection.changes().last_sequence(),
                "Loaded collection"
            );
        }
        self.db.locals().restore(self.storage.load_locals("").await?);

        info!(database = %self.db.name(), "Loaded persisted state");
        Ok(())
    }

    /// Persist every change of `collection` not yet written.
    /// Returns the persisted sequence.
    pub async fn flush(&self, collection: &Collection) -> Result<u64, StorageError> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked(collection).await
    }

    async fn flush_locked(&self, collection: &Collection) -> Result<u64, StorageError> {
        let name = collection.name();
        let from = self.flushed.get(name).map_or(0, |r| *r.value());
        let events = collection.changes().since(from);
        let last = match events.last() {
            Some(event) => event.sequence,
            None => return Ok(from),
        };

        let cipher = self.db.cipher();
        let mut latest: BTreeMap<&str, &Document> = BTreeMap::new();
        for event in &events {
            latest.insert(event.document.id.as_str(), &event.document);
        }
        let docs = latest
            .into_values()
            .map(|doc| seal_document(collection, doc, cipher.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;
        let sealed_events = events
            .iter()
            .map(|event| seal_event(collection, event, cipher.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;

        self.storage.commit_changes(name, &docs, &sealed_events).await?;
        self.flushed.insert(name.to_string(), last);

        debug!(collection = %name, from, to = last, documents = docs.len(), "Flushed changes");
        Ok(last)
    }

    /// Flush every collection and all local documents
    pub async fn flush_all(&self) -> Result<(), StorageError> {
        let _guard = self.flush_lock.lock().await;
        for collection in self.db.collections() {
            self.flush_locked(&collection).await?;
            self.flush_locals(collection.locals()).await?;
        }
        self.flush_locals(self.db.locals()).await
    }

    async fn flush_locals(&self, locals: &LocalDocuments) -> Result<(), StorageError> {
        let namespace = locals.namespace();
        let stored = self.storage.load_locals(namespace).await?;
        let current: HashSet<String> = locals.keys().into_iter().collect();

        for key in &current {
            if let Some(doc) = locals.get(key) {
                let unchanged = stored
                    .iter()
                    .any(|s| s.key == doc.key && s.revision == doc.revision && s.data == doc.data);
                if !unchanged {
                    self.storage.set_local(namespace, &doc).await?;
                }
            }
        }
        for doc in stored.iter().filter(|s| !current.contains(&s.key)) {
            self.storage.remove_local(namespace, &doc.key).await?;
        }
        Ok(())
    }

    /// Purge tombstones older than `min_deleted_age` from memory and
    /// storage, skipping collections opened less than `min_collection_age`
    /// ago. Returns the number of purged documents.
    pub async fn cleanup(&self, min_deleted_age: Duration, min_collection_age: Duration) -> Result<usize, StorageError> {
        let _guard = self.flush_lock.lock().await;
        let mut total = 0;
        for collection in self.db.collections() {
            if collection.age() < min_collection_age {
                debug!(collection = %collection.name(), "Cleanup skipped: collection too young");
                continue;
            }
            // Tombstones must reach storage before they can be purged from it
            self.flush_locked(&collection).await?;
            let purged = collection.cleanup(min_deleted_age);
            if !purged.is_empty() {
                total += self.storage.purge_documents(collection.name(), &purged).await?;
            }
        }
        Ok(total)
    }

    /// Drop change events up to `through` from memory and storage once
    /// every consumer has read them. The newest event always stays so the
    /// sequence continues after a restart. Returns the number dropped.
    pub async fn compact(&self, collection: &Collection, through: u64) -> Result<usize, StorageError> {
        let _guard = self.flush_lock.lock().await;
        let flushed = self.flush_locked(collection).await?;
        let through = through.min(flushed.saturating_sub(1));
        if through == 0 {
            return Ok(0);
        }
        let dropped = collection.changes().compact(through);
        self.storage.compact_changes(collection.name(), through).await?;
        if dropped > 0 {
            debug!(collection = %collection.name(), through, dropped, "Compacted change log");
        }
        Ok(dropped)
    }

    /// Flush periodically until the database closes, then flush once more
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mut shutdown = self.db.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush_all().await {
                            error!(database = %self.db.name(), "Flush failed: {}", e);
                        }
                    }
                    _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => break,
                }
            }
            if let Err(e) = self.flush_all().await {
                error!(database = %self.db.name(), "Final flush failed: {}", e);
            }
            debug!(database = %self.db.name(), "Persister stopped");
        })
    }
}

fn seal_document(
    collection: &Collection,
    doc: &Document,
    cipher: Option<&dyn FieldCipher>,
) -> Result<Document, StorageError> {
    match cipher {
        Some(cipher) if collection.schema().has_encrypted_fields() => Ok(Document {
            data: seal_fields(collection.schema(), &doc.data, cipher)?,
            ..doc.clone()
        }),
        _ => Ok(doc.clone()),
    }
}

fn open_document(
    collection: &Collection,
    doc: Document,
    cipher: Option<&dyn FieldCipher>,
) -> Result<Document, StorageError> {
    match cipher {
        Some(cipher) if collection.schema().has_encrypted_fields() => Ok(Document {
            data: open_fields(collection.schema(), &doc.data, cipher)?,
            ..doc
        }),
        _ => Ok(doc),
    }
}

fn seal_event(
    collection: &Collection,
    event: &ChangeEvent,
    cipher: Option<&dyn FieldCipher>,
) -> Result<ChangeEvent, StorageError> {
    Ok(ChangeEvent {
        document: seal_document(collection, &event.document, cipher)?,
        previous: match &event.previous {
            Some(prev) => Some(seal_document(collection, prev, cipher)?),
            None => None,
        },
        ..event.clone()
    })
}

fn open_event(
    collection: &Collection,
    event: ChangeEvent,
    cipher: Option<&dyn FieldCipher>,
) -> Result<ChangeEvent, StorageError> {
    Ok(ChangeEvent {
        document: open_document(collection, event.document, cipher)?,
        previous: match event.previous {
            Some(prev) => Some(open_document(collection, prev, cipher)?),
            None => None,
        },
        ..event
    })
}
