//! Reactive state - a JSON object of named values kept in a local document
//!
//! ```ignore
//! let state = db.add_state("")?;
//! state.modify("initState", |_| json!("value"))?;
//! let mut watch = state.watch("initState");
//! ```
//!
//! State belongs to the instance: it is persisted with the database's local
//! documents and never replicated.

use crate::database::Database;
use crate::error::{Error, Result};
use crate::local::LocalWatch;
use std::sync::Arc;

const STATE_KEY_PREFIX: &str = "_state:";

/// Handle to one state namespace of a database
pub struct State {
    db: Arc<Database>,
    /// Local document holding the state object
    doc_key: String,
}

impl State {
    pub(crate) fn new(db: Arc<Database>, prefix: &str) -> Self {
        Self {
            db,
            doc_key: format!("{}{}", STATE_KEY_PREFIX, prefix),
        }
    }

    /// The whole state object (`{}` when nothing was set)
    pub fn get(&self) -> serde_json::Value {
        self.db
            .get_local(&self.doc_key)
            .map(|doc| doc.data)
            .unwrap_or_else(|| serde_json::json!({}))
    }

    /// Value of one key
    pub fn get_key(&self, key: &str) -> Option<serde_json::Value> {
        self.db
            .get_local(&self.doc_key)
            .and_then(|doc| doc.data.get(key).cloned())
    }

    /// Set `key` to `updater(current value)` atomically. Returns the new value.
    pub fn modify<F>(&self, key: &str, updater: F) -> Result<serde_json::Value>
    where
        F: FnOnce(Option<&serde_json::Value>) -> serde_json::Value,
    {
        if self.db.is_closed() {
            return Err(Error::Closed);
        }
        let mut value = None;
        self.db.locals().update(&self.doc_key, |current| {
            let mut object = match current {
                Some(serde_json::Value::Object(map)) => map.clone(),
                _ => serde_json::Map::new(),
            };
            let next = updater(object.get(key));
            object.insert(key.to_string(), next.clone());
            value = Some(next);
            serde_json::Value::Object(object)
        })?;
        Ok(value.unwrap_or(serde_json::Value::Null))
    }

    /// Overwrite `key`
    pub fn set(&self, key: &str, value: serde_json::Value) -> Result<serde_json::Value> {
        self.modify(key, move |_| value)
    }

    /// Observe one key: yields the current value, then every distinct change
    pub fn watch(&self, key: &str) -> StateWatch {
        StateWatch {
            inner: self.db.watch_local(&self.doc_key),
            key: key.to_string(),
            last: None,
        }
    }
}

/// Stream of values of one state key
pub struct StateWatch {
    inner: LocalWatch,
    key: String,
    last: Option<Option<serde_json::Value>>,
}

impl StateWatch {
    /// Next value (`Some(None)` while unset); `None` once closed
    pub async fn next(&mut self) -> Option<Option<serde_json::Value>> {
        loop {
            let doc = self.inner.next().await?;
            let value = doc.and_then(|d| d.data.get(&self.key).cloned());
            if self.last.as_ref() != Some(&value) {
                self.last = Some(value.clone());
                return Some(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::database::{Database, DatabaseConfig};
    use serde_json::json;

    #[test]
    fn test_modify_and_get() {
        let db = Database::open(DatabaseConfig::new("todosdb")).unwrap();
        let state = db.add_state("").unwrap();
        assert_eq!(state.get(), json!({}));
        assert_eq!(state.get_key("initState"), None);

        state.modify("initState", |_| json!("value state")).unwrap();
        let next = state
            .modify("initState", |current| {
                assert_eq!(current, Some(&json!("value state")));
                json!("change value state")
            })
            .unwrap();
        assert_eq!(next, json!("change value state"));
        state.set("show", json!(true)).unwrap();

        assert_eq!(state.get(), json!({"initState": "change value state", "show": true}));
        assert_eq!(state.get_key("show"), Some(json!(true)));
    }

    #[test]
    fn test_namespaces_are_separate() {
        let db = Database::open(DatabaseConfig::new("todosdb")).unwrap();
        let ui = db.add_state("ui").unwrap();
        let sync = db.add_state("sync").unwrap();
        ui.set("show", json!(false)).unwrap();
        assert_eq!(sync.get(), json!({}));
        assert!(db.add_state("").unwrap().get_key("show").is_none());
    }

    #[test]
    fn test_closed_database_rejects_writes() {
        let db = Database::open(DatabaseConfig::new("todosdb")).unwrap();
        let state = db.add_state("").unwrap();
        db.close();
        assert!(state.set("a", json!(1)).is_err());
        assert!(db.add_state("").is_err());
    }

    #[tokio::test]
    async fn test_watch_skips_other_keys() {
        let db = Database::open(DatabaseConfig::new("todosdb")).unwrap();
        let state = db.add_state("").unwrap();
        let mut watch = state.watch("initState");
        assert_eq!(watch.next().await, Some(None));

        state.set("other", json!(1)).unwrap();
        state.set("initState", json!("a")).unwrap();
        assert_eq!(watch.next().await, Some(Some(json!("a"))));

        // Rewriting the same value is not a change
        state.set("initState", json!("a")).unwrap();
        state.set("initState", json!("b")).unwrap();
        assert_eq!(watch.next().await, Some(Some(json!("b"))));
    }
}
