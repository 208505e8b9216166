//! Database - a named set of collections sharing a lifecycle

use crate::cipher::{FieldCipher, PasswordCipher};
use crate::collection::Collection;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::local::{LocalDocument, LocalDocuments, LocalWatch};
use crate::schema::CollectionSchema;
use crate::state::State;
use crate::value::Value;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// When and how tombstones are purged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    /// Tombstones younger than this are kept
    pub minimum_deleted_time_ms: u64,
    /// Collections opened more recently than this are not cleaned
    pub minimum_collection_age_ms: u64,
    /// Interval between cleanup runs
    pub run_each_ms: u64,
    /// Only purge once replication has nothing left to push
    pub await_replications_in_sync: bool,
    /// Only purge on the elected leader
    pub wait_for_leadership: bool,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            minimum_deleted_time_ms: 30 * 24 * 60 * 60 * 1000,
            minimum_collection_age_ms: 60 * 1000,
            run_each_ms: 5 * 60 * 1000,
            await_replications_in_sync: true,
            wait_for_leadership: true,
        }
    }
}

impl CleanupPolicy {
    pub fn minimum_deleted_time(&self) -> Duration {
        Duration::from_millis(self.minimum_deleted_time_ms)
    }

    pub fn minimum_collection_age(&self) -> Duration {
        Duration::from_millis(self.minimum_collection_age_ms)
    }

    pub fn run_each(&self) -> Duration {
        Duration::from_millis(self.run_each_ms)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub name: String,
    /// Password for encrypted fields
    pub password: Option<String>,
    pub cleanup: CleanupPolicy,
    pub collections: Vec<CollectionSchema>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "lofi".to_string(),
            password: None,
            cleanup: CleanupPolicy::default(),
            collections: Vec::new(),
        }
    }
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn collection(mut self, schema: CollectionSchema) -> Self {
        self.collections.push(schema);
        self
    }

    pub fn cleanup(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup = policy;
        self
    }
}

/// A local-first database
pub struct Database {
    config: DatabaseConfig,
    /// Random id of this instance, used as the election owner
    instance_id: String,
    collections: DashMap<String, Arc<Collection>>,
    locals: LocalDocuments,
    cipher: Option<Arc<dyn FieldCipher>>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Database {
    /// Open a database with the collections of `config`
    pub fn open(config: DatabaseConfig) -> Result<Arc<Self>> {
        let cipher = match &config.password {
            Some(password) => Some(Arc::new(PasswordCipher::new(password)?) as Arc<dyn FieldCipher>),
            None => None,
        };
        Self::open_with_cipher(config, cipher)
    }

    /// Open a database with a custom field cipher
    pub fn open_with_cipher(
        config: DatabaseConfig,
        cipher: Option<Arc<dyn FieldCipher>>,
    ) -> Result<Arc<Self>> {
        let (shutdown, _) = watch::channel(false);
        let db = Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            collections: DashMap::new(),
            locals: LocalDocuments::new(""),
            cipher,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
            config,
        };
        for schema in db.config.collections.clone() {
            db.add_collection(schema)?;
        }
        info!(
            database = %db.config.name,
            instance = %db.instance_id,
            collections = db.collections.len(),
            "Database opened"
        );
        Ok(Arc::new(db))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn cipher(&self) -> Option<Arc<dyn FieldCipher>> {
        self.cipher.clone()
    }

    /// Create a collection
    pub fn add_collection(&self, schema: CollectionSchema) -> Result<Arc<Collection>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if schema.has_encrypted_fields() && self.cipher.is_none() {
            return Err(Error::Encryption(format!(
                "collection {} has encrypted fields but the database has no password",
                schema.name
            )));
        }
        let name = schema.name.clone();
        match self.collections.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::CollectionExists(name)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let collection = Arc::new(Collection::new(schema, self.closed.clone())?);
                entry.insert(collection.clone());
                Ok(collection)
            }
        }
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// All collections, ordered by name
    pub fn collections(&self) -> Vec<Arc<Collection>> {
        let mut all: Vec<_> = self.collections.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Database-level local documents
    pub fn locals(&self) -> &LocalDocuments {
        &self.locals
    }

    pub fn get_local(&self, key: &str) -> Option<LocalDocument> {
        self.locals.get(key)
    }

    pub fn set_local(&self, key: &str, data: serde_json::Value) -> Result<LocalDocument> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.locals.set(key, data)
    }

    pub fn remove_local(&self, key: &str) -> bool {
        self.locals.remove(key)
    }

    pub fn watch_local(&self, key: &str) -> LocalWatch {
        self.locals.watch(key)
    }

    /// Reactive state namespace stored in the local document `_state:<prefix>`
    pub fn add_state(self: &Arc<Self>, prefix: &str) -> Result<State> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(State::new(self.clone(), prefix))
    }

    /// Resolve a reference field of `doc` (from `collection`) to the
    /// referenced documents. Missing targets are skipped.
    pub fn populate(&self, collection: &str, doc: &Document, field: &str) -> Result<Vec<Document>> {
        let source = self.collection(collection)?;
        let target = source
            .schema()
            .descriptor(field)
            .and_then(|d| d.reference.clone())
            .ok_or_else(|| {
                Error::validation(collection, format!("field {} is not a reference", field))
            })?;
        let target = self.collection(&target)?;

        let keys: Vec<&str> = match doc.get(field) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(key)) => vec![key.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(other) => {
                return Err(Error::validation(
                    collection,
                    format!("reference {} holds a {}", field, other.type_name()),
                ))
            }
        };
        Ok(keys.into_iter().filter_map(|key| target.find_one(key)).collect())
    }

    /// Stop accepting writes and signal background tasks to stop
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        info!(database = %self.config.name, "Database closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves to `true` once the database is closed
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("instance_id", &self.instance_id)
            .field("collections", &self.collections.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;
    use serde_json::json;

    fn config() -> DatabaseConfig {
        DatabaseConfig::new("todosdb")
            .password("sudoLetMeIn")
            .collection(
                CollectionSchema::new("todos")
                    .field(FieldDescriptor::string("id").required())
                    .field(FieldDescriptor::string("name").required())
                    .field(FieldDescriptor::boolean("done")),
            )
            .collection(
                CollectionSchema::new("list")
                    .field(FieldDescriptor::string("id").required())
                    .field(FieldDescriptor::string("description").encrypted())
                    .field(FieldDescriptor::string("list_id").references("todos")),
            )
    }

    #[test]
    fn test_open_with_collections() {
        let db = Database::open(config()).unwrap();
        let names: Vec<String> = db.collections().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["list", "todos"]);
        assert!(db.collection("missing").is_err());
        assert!(matches!(
            db.add_collection(CollectionSchema::new("todos")),
            Err(Error::CollectionExists(_))
        ));
    }

    #[test]
    fn test_encrypted_fields_need_password() {
        let mut cfg = config();
        cfg.password = None;
        assert!(matches!(Database::open(cfg), Err(Error::Encryption(_))));
    }

    #[test]
    fn test_populate_reference() {
        let db = Database::open(config()).unwrap();
        db.collection("todos")
            .unwrap()
            .insert(json!({"id": "t1", "name": "buy milk"}))
            .unwrap();
        let list = db.collection("list").unwrap();
        let entry = list
            .insert(json!({"id": "l1", "description": "groceries", "list_id": "t1"}))
            .unwrap();

        let todos = db.populate("list", &entry, "list_id").unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].get("name"), Some(&Value::from("buy milk")));
        assert!(db.populate("list", &entry, "description").is_err());
    }

    #[test]
    fn test_local_documents() {
        let db = Database::open(config()).unwrap();
        db.set_local("token", json!("secret")).unwrap();
        assert_eq!(db.get_local("token").unwrap().data, json!("secret"));
        assert!(db.remove_local("token"));
        assert!(db.get_local("token").is_none());
    }

    #[tokio::test]
    async fn test_close_stops_writes_and_signals() {
        let db = Database::open(config()).unwrap();
        let todos = db.collection("todos").unwrap();
        let mut signal = db.shutdown_signal();

        db.close();
        db.close();
        assert!(db.is_closed());
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
        assert!(matches!(
            todos.insert(json!({"id": "t1", "name": "x"})),
            Err(Error::Closed)
        ));
        assert!(db.set_local("k", json!(1)).is_err());
    }
}
