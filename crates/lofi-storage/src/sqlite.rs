//! SQLite storage backend

use crate::{CheckpointKey, Lease, Storage, StorageError, StorageStats};
use async_trait::async_trait;
use lofi_core::{now_ms, ChangeEvent, Document, DocumentId, LocalDocument};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// SQLite storage backend
///
/// Embedded persistence for a single device. Instances opening the same
/// file share leases, which is how leader election spans processes.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                deleted INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_deleted ON documents(collection, deleted, updated_at);

            CREATE TABLE IF NOT EXISTS changes (
                collection TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, sequence)
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                collection TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                direction TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, endpoint, direction)
            );

            CREATE TABLE IF NOT EXISTS locals (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );

            CREATE TABLE IF NOT EXISTS leases (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn commit_changes(
        &self,
        collection: &str,
        docs: &[Document],
        events: &[ChangeEvent],
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        for doc in docs {
            let body = serde_json::to_string(doc)?;
            tx.execute(
                r#"
                INSERT INTO documents (collection, id, body, deleted, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(collection, id) DO UPDATE SET
                    body = excluded.body,
                    deleted = excluded.deleted,
                    updated_at = excluded.updated_at
                "#,
                params![collection, doc.id.as_str(), body, doc.deleted, doc.updated_at as i64],
            )
            .map_err(db_err)?;
        }
        for event in events {
            let body = serde_json::to_string(event)?;
            tx.execute(
                "INSERT OR REPLACE INTO changes (collection, sequence, body) VALUES (?1, ?2, ?3)",
                params![collection, event.sequence as i64, body],
            )
            .map_err(db_err)?;
        }
        // Dropping the transaction on an early return rolls it back
        tx.commit().map_err(db_err)
    }

    async fn load_documents(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT body FROM documents WHERE collection = ?1 ORDER BY id")
            .map_err(db_err)?;
        let bodies = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StorageError::from))
            .collect()
    }

    async fn purge_documents(&self, collection: &str, ids: &[DocumentId]) -> Result<usize, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let mut purged = 0;
        for id in ids {
            purged += tx
                .execute(
                    "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                    params![collection, id.as_str()],
                )
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(purged)
    }

    async fn compact_changes(&self, collection: &str, through: u64) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM changes WHERE collection = ?1 AND sequence <= ?2",
            params![collection, through.min(i64::MAX as u64) as i64],
        )
        .map_err(db_err)
    }

    async fn load_changes(&self, collection: &str) -> Result<Vec<ChangeEvent>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT body FROM changes WHERE collection = ?1 ORDER BY sequence")
            .map_err(db_err)?;
        let bodies = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StorageError::from))
            .collect()
    }

    async fn save_checkpoint(&self, key: &CheckpointKey, checkpoint: &serde_json::Value) -> Result<(), StorageError> {
        let body = serde_json::to_string(checkpoint)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO checkpoints (collection, endpoint, direction, body)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(collection, endpoint, direction) DO UPDATE SET body = excluded.body
            "#,
            params![key.collection, key.endpoint, key.direction.as_str(), body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_checkpoint(&self, key: &CheckpointKey) -> Result<Option<serde_json::Value>, StorageError> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM checkpoints WHERE collection = ?1 AND endpoint = ?2 AND direction = ?3",
                params![key.collection, key.endpoint, key.direction.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn set_local(&self, namespace: &str, doc: &LocalDocument) -> Result<(), StorageError> {
        let body = serde_json::to_string(doc)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO locals (namespace, key, body) VALUES (?1, ?2, ?3)
            ON CONFLICT(namespace, key) DO UPDATE SET body = excluded.body
            "#,
            params![namespace, doc.key, body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_locals(&self, namespace: &str) -> Result<Vec<LocalDocument>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT body FROM locals WHERE namespace = ?1")
            .map_err(db_err)?;
        let bodies = stmt
            .query_map(params![namespace], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StorageError::from))
            .collect()
    }

    async fn remove_local(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM locals WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    async fn try_acquire_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = now_ms() as i64;
        let expires_at = now + ttl.as_millis() as i64;
        let conn = self.conn.lock();

        // The WHERE clause makes the upsert a compare-and-set
        let affected = conn
            .execute(
                r#"
                INSERT INTO leases (name, owner, expires_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE SET
                    owner = excluded.owner,
                    expires_at = excluded.expires_at
                WHERE leases.owner = excluded.owner OR leases.expires_at <= ?4
                "#,
                params![name, owner, expires_at, now],
            )
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM leases WHERE name = ?1 AND owner = ?2",
                params![name, owner],
            )
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    async fn lease_holder(&self, name: &str) -> Result<Option<Lease>, StorageError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, owner, expires_at FROM leases WHERE name = ?1 AND expires_at > ?2",
            params![name, now_ms() as i64],
            |row| {
                Ok(Lease {
                    name: row.get(0)?,
                    owner: row.get(1)?,
                    expires_at: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock();

        let document_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(db_err)?;

        let change_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM changes", [], |row| row.get(0))
            .map_err(db_err)?;

        let total_size: i64 = conn
            .query_row(
                r#"
                SELECT COALESCE((SELECT SUM(LENGTH(body)) FROM documents), 0)
                     + COALESCE((SELECT SUM(LENGTH(body)) FROM changes), 0)
                "#,
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        Ok(StorageStats {
            document_count: document_count as usize,
            change_count: change_count as usize,
            total_size_bytes: total_size as usize,
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
    async fn test_sqlite_documents() {
        let storage = SqliteStorage::in_memory().unwrap();
        let c = todos();
        let v1 = c.insert(json!({"id": "1", "name": "a"})).unwrap();
        storage.commit_changes("todos", &[v1], &[]).await.unwrap();

        // Upsert replaces the row
        let v2 = c.soft_delete("1", None).unwrap();
        storage.commit_changes("todos", &[v2.clone()], &[]).await.unwrap();
        assert_eq!(storage.load_documents("todos").await.unwrap(), vec![v2.clone()]);
        assert_eq!(storage.stats().await.unwrap().document_count, 1);

        assert_eq!(storage.purge_documents("todos", &[v2.id]).await.unwrap(), 1);
        assert!(storage.load_documents("todos").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_changes_and_checkpoints() {
        let storage = SqliteStorage::in_memory().unwrap();
        let c = todos();
        c.insert(json!({"id": "1"})).unwrap();
        c.patch("1", json!({"name": "b"})).unwrap();
        storage.commit_changes("todos", &[], &events(&c)).await.unwrap();
        storage.commit_changes("todos", &[], &events(&c)).await.unwrap();
        assert_eq!(storage.load_changes("todos").await.unwrap(), events(&c));

        assert_eq!(storage.compact_changes("todos", 1).await.unwrap(), 1);
        assert_eq!(storage.load_changes("todos").await.unwrap(), events(&c)[1..].to_vec());

        let key = CheckpointKey::new("todos", "remote", Direction::Push);
        storage.save_checkpoint(&key, &json!({"sequence": 1})).await.unwrap();
        storage.save_checkpoint(&key, &json!({"sequence": 2})).await.unwrap();
        assert_eq!(storage.load_checkpoint(&key).await.unwrap(), Some(json!({"sequence": 2})));
    }

    #[tokio::test]
    async fn test_sqlite_locals() {
        let storage = SqliteStorage::in_memory().unwrap();
        let locals = lofi_core::LocalDocuments::new("");
        let doc = locals.set("token", json!("abc")).unwrap();

        storage.set_local("", &doc).await.unwrap();
        assert_eq!(storage.load_locals("").await.unwrap(), vec![doc]);
        assert!(storage.load_locals("todos").await.unwrap().is_empty());
        assert!(storage.remove_local("", "token").await.unwrap());
        assert!(!storage.remove_local("", "token").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_lease_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lofi.db");
        let a = SqliteStorage::new(&path).unwrap();
        let b = SqliteStorage::new(&path).unwrap();
        let ttl = Duration::from_millis(100);

        assert!(a.try_acquire_lease("leader", "a", ttl).await.unwrap());
        assert!(!b.try_acquire_lease("leader", "b", ttl).await.unwrap());
        assert_eq!(b.lease_holder("leader").await.unwrap().unwrap().owner, "a");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(b.try_acquire_lease("leader", "b", ttl).await.unwrap());
        assert!(!a.release_lease("leader", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lofi.db");
        let c = todos();
        let doc = c.insert(json!({"id": "1", "name": "kept"})).unwrap();

        {
            let storage = SqliteStorage::new(&path).unwrap();
            storage.commit_changes("todos", &[doc.clone()], &events(&c)).await.unwrap();
        }
        let storage = SqliteStorage::new(&path).unwrap();
        assert_eq!(storage.load_documents("todos").await.unwrap(), vec![doc]);
        assert_eq!(storage.load_changes("todos").await.unwrap(), events(&c));
    }

    #[tokio::test]
    async fn test_sqlite_commit_is_all_or_nothing() {
        let storage = SqliteStorage::in_memory().unwrap();
        let c = todos();
        let doc = c.insert(json!({"id": "1"})).unwrap();
        storage
            .conn
            .lock()
            .execute_batch("DROP TABLE changes; CREATE TABLE changes (collection TEXT CHECK (0))")
            .unwrap();

        assert!(storage.commit_changes("todos", &[doc], &events(&c)).await.is_err());
        assert!(storage.load_documents("todos").await.unwrap().is_empty());
    }
}
