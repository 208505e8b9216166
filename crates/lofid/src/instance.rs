//! One database instance with its background tasks

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use lofi_replication::{spawn_cleanup, LeaderElector, MemoryRemote, Remote, Replication};
use lofi_storage::{MemoryStorage, Persister, SqliteStorage, Storage};

use crate::config::DaemonConfig;

/// SQLite file under `dir`, or memory when no directory is configured
pub fn open_storage(dir: Option<&Path>, file: &str) -> Result<Arc<dyn Storage>> {
    match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
            let path = dir.join(file);
            info!(path = %path.display(), "Opening SQLite storage");
            Ok(Arc::new(SqliteStorage::new(&path)?))
        }
        None => Ok(Arc::new(MemoryStorage::new())),
    }
}

pub struct Instance {
    pub name: String,
    pub persister: Arc<Persister>,
    pub elector: Arc<LeaderElector>,
    pub replications: Vec<Arc<Replication>>,
    tasks: Vec<JoinHandle<()>>,
    replication_tasks: Vec<JoinHandle<lofi_replication::Result<()>>>,
}

impl Instance {
    /// Open the database and configure replication of every collection
    pub async fn open(
        index: usize,
        config: &DaemonConfig,
        leases: Arc<dyn Storage>,
        remote: Arc<MemoryRemote>,
    ) -> Result<Self> {
        let name = format!("instance-{}", index);
        let storage = open_storage(config.daemon.data_dir.as_deref(), &format!("{}.db", name))?;
        let persister = Persister::open(config.database.clone(), storage)
            .await
            .with_context(|| format!("Failed to open database for {}", name))?;

        if let Some(token) = &config.daemon.token {
            persister
                .database()
                .set_local(&config.replication.token_key, serde_json::Value::String(token.clone()))?;
        }

        let owner = format!("{}-{}", name, persister.database().instance_id());
        let elector = LeaderElector::new(leases, owner, config.election.to_config());

        let mut replications = Vec::new();
        for collection in persister.database().collections() {
            let remote = Remote::from_handler("memory", remote.clone());
            let replication = Replication::builder(persister.clone(), collection.name(), remote)
                .config(config.replication.to_config())
                .build()
                .await?;
            replications.push(replication);
        }

        info!(
            instance = %name,
            database = %persister.database().name(),
            collections = replications.len(),
            "Instance opened"
        );

        Ok(Self {
            name,
            persister,
            elector,
            replications,
            tasks: Vec::new(),
            replication_tasks: Vec::new(),
        })
    }

    /// Start election, flushing, replication and cleanup
    pub fn start(&mut self, flush_interval: Duration) {
        let db = self.persister.database();
        self.tasks.push(self.elector.clone().spawn(db.shutdown_signal()));
        self.tasks.push(self.persister.clone().spawn(flush_interval));
        for replication in &self.replications {
            self.replication_tasks
                .push(replication.clone().spawn(Some(self.elector.clone())));
        }
        self.tasks.push(spawn_cleanup(
            self.persister.clone(),
            Some(self.elector.clone()),
            self.replications.clone(),
        ));
    }

    /// One push and pull cycle for every collection
    pub async fn run_once(&self) -> Result<()> {
        for replication in &self.replications {
            replication
                .run_once()
                .await
                .with_context(|| format!("Replication of {} failed", replication.collection().name()))?;
        }
        self.persister.flush_all().await?;
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    /// Close the database and wait for background tasks
    pub async fn shutdown(self) -> Result<()> {
        self.persister.flush_all().await?;
        self.persister.database().close();
        for task in self.replication_tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(instance = %self.name, "Replication ended with error: {}", e),
                Err(e) => warn!(instance = %self.name, "Replication task panicked: {}", e),
            }
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(instance = %self.name, "Background task panicked: {}", e);
            }
        }
        let stats = self.persister.storage().stats().await?;
        info!(
            instance = %self.name,
            documents = stats.document_count,
            changes = stats.change_count,
            "Instance stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> DaemonConfig {
        let mut config = DaemonConfig::builtin();
        config.database.password = Some("sudoLetMeIn".into());
        config.replication.cycle_interval_ms = 50;
        config.election.lease_ttl_ms = 300;
        config.election.heartbeat_ms = 50;
        config
    }

    #[tokio::test]
    async fn test_run_once_pushes_every_collection() {
        let remote = Arc::new(MemoryRemote::new());
        let leases: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let instance = Instance::open(0, &config(), leases, remote.clone()).await.unwrap();

        let db = instance.persister.database();
        db.collection("todos")
            .unwrap()
            .insert(json!({"id": "t1", "name": "groceries", "done": false, "timestamp": "2024-01-01T00:00:00Z"}))
            .unwrap();
        db.collection("list")
            .unwrap()
            .insert(json!({"id": "l1", "description": "milk", "list_id": "t1"}))
            .unwrap();

        instance.run_once().await.unwrap();
        assert!(remote.get("todos", "t1").is_some());
        assert!(remote.get("list", "l1").is_some());
        instance.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_token_stored_as_local_document() {
        let mut config = config();
        config.daemon.token = Some("secret".into());
        let leases: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let instance = Instance::open(0, &config, leases, Arc::new(MemoryRemote::new()))
            .await
            .unwrap();
        let token = instance.persister.database().get_local("token").unwrap();
        assert_eq!(token.data, json!("secret"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_one_leader_across_instances() {
        let config = config();
        let remote = Arc::new(MemoryRemote::new());
        let leases: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut instances = Vec::new();
        for i in 0..3 {
            let mut instance = Instance::open(i, &config, leases.clone(), remote.clone()).await.unwrap();
            instance.start(Duration::from_millis(50));
            instances.push(instance);
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(instances.iter().filter(|i| i.is_leader()).count(), 1);

        for instance in instances {
            instance.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sqlite_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.daemon.data_dir = Some(dir.path().join("data"));
        let leases = open_storage(config.daemon.data_dir.as_deref(), "leases.db").unwrap();

        let instance = Instance::open(0, &config, leases, Arc::new(MemoryRemote::new()))
            .await
            .unwrap();
        instance
            .persister
            .database()
            .collection("list")
            .unwrap()
            .insert(json!({"id": "l1", "description": "secret note", "list_id": "t1"}))
            .unwrap();
        instance.shutdown().await.unwrap();

        assert!(dir.path().join("data").join("instance-0.db").exists());
        assert!(dir.path().join("data").join("leases.db").exists());
    }
}
