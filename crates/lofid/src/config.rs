//! Daemon configuration file
//!
//! ```toml
//! [database]
//! name = "todosdb"
//!
//! [database.cleanup]
//! minimum_deleted_time_ms = 10000
//! minimum_collection_age_ms = 10000
//! run_each_ms = 10000
//!
//! [replication]
//! push_batch_size = 50
//! cycle_interval_ms = 10000
//!
//! [election]
//! lease_ttl_ms = 5000
//! heartbeat_ms = 1000
//!
//! [daemon]
//! instances = 2
//! data_dir = "/var/lib/lofi"
//! ```
//!
//! Every table is optional. Without `[[database.collections]]` the daemon
//! serves the `todos` and `list` collections.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use lofi_core::{CollectionSchema, DatabaseConfig, FieldDescriptor};
use lofi_replication::{ElectionConfig, ReplicationConfig, RetryConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database: DatabaseConfig,
    pub replication: ReplicationSettings,
    pub election: ElectionSettings,
    pub daemon: DaemonSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    pub push_batch_size: usize,
    pub pull_batch_size: usize,
    pub live: bool,
    pub token_key: String,
    pub cycle_interval_ms: u64,
    /// Give up after this many failed cycles (default: never)
    pub max_attempts: Option<usize>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        let defaults = ReplicationConfig::default();
        Self {
            push_batch_size: defaults.push_batch_size,
            pull_batch_size: defaults.pull_batch_size,
            live: defaults.live,
            token_key: defaults.token_key,
            cycle_interval_ms: defaults.cycle_interval.as_millis() as u64,
            max_attempts: None,
            initial_delay_ms: defaults.retry.initial_delay.as_millis() as u64,
            max_delay_ms: defaults.retry.max_delay.as_millis() as u64,
        }
    }
}

impl ReplicationSettings {
    pub fn to_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            push_batch_size: self.push_batch_size,
            pull_batch_size: self.pull_batch_size,
            live: self.live,
            token_key: self.token_key.clone(),
            cycle_interval: Duration::from_millis(self.cycle_interval_ms),
            retry: RetryConfig {
                max_attempts: self.max_attempts.unwrap_or(usize::MAX),
                initial_delay: Duration::from_millis(self.initial_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                ..RetryConfig::daemon()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElectionSettings {
    pub name: String,
    pub lease_ttl_ms: u64,
    pub heartbeat_ms: u64,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        let defaults = ElectionConfig::default();
        Self {
            name: defaults.name,
            lease_ttl_ms: defaults.lease_ttl.as_millis() as u64,
            heartbeat_ms: defaults.heartbeat.as_millis() as u64,
        }
    }
}

impl ElectionSettings {
    pub fn to_config(&self) -> ElectionConfig {
        ElectionConfig {
            name: self.name.clone(),
            lease_ttl: Duration::from_millis(self.lease_ttl_ms),
            heartbeat: Duration::from_millis(self.heartbeat_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// In-process instances sharing one lease
    pub instances: usize,
    /// SQLite directory; in-memory when unset
    pub data_dir: Option<PathBuf>,
    /// Bearer token stored in each instance's `token` local document
    pub token: Option<String>,
    pub flush_interval_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            instances: 1,
            data_dir: None,
            token: None,
            flush_interval_ms: 1000,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        config.fill_defaults();
        Ok(config)
    }

    fn fill_defaults(&mut self) {
        if self.database.collections.is_empty() {
            self.database.collections = default_collections();
        }
    }

    /// Defaults plus the built-in collections
    pub fn builtin() -> Self {
        let mut config = Self::default();
        config.database.name = "todosdb".to_string();
        config.fill_defaults();
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.daemon.instances == 0 {
            anyhow::bail!("At least one instance is required");
        }
        if self.election.heartbeat_ms == 0 || self.election.heartbeat_ms >= self.election.lease_ttl_ms {
            anyhow::bail!(
                "Heartbeat ({}ms) must be positive and shorter than the lease ttl ({}ms)",
                self.election.heartbeat_ms,
                self.election.lease_ttl_ms
            );
        }
        let has_encrypted = self.database.collections.iter().any(|c| c.has_encrypted_fields());
        if has_encrypted && self.database.password.is_none() {
            anyhow::bail!("Collections with encrypted fields need a database password");
        }
        Ok(())
    }
}

/// A todo list and its encrypted entries
pub fn default_collections() -> Vec<CollectionSchema> {
    vec![
        CollectionSchema::new("todos")
            .field(FieldDescriptor::string("id").required().max_length(100))
            .field(FieldDescriptor::string("name").required())
            .field(FieldDescriptor::boolean("done").required())
            .field(FieldDescriptor::datetime("timestamp").required()),
        CollectionSchema::new("list")
            .field(FieldDescriptor::string("id").required().max_length(100))
            .field(FieldDescriptor::string("description").encrypted())
            .field(FieldDescriptor::string("list_id").required().references("todos")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = DaemonConfig::parse("").unwrap();
        assert_eq!(config.daemon.instances, 1);
        assert_eq!(config.database.collections.len(), 2);
        assert_eq!(config.replication.to_config().retry.max_attempts, usize::MAX);
        assert_eq!(config.election.to_config(), ElectionConfig::default());
    }

    #[test]
    fn test_parse_tables() {
        let config = DaemonConfig::parse(
            r#"
            [database]
            name = "notes"

            [database.cleanup]
            minimum_deleted_time_ms = 10000
            minimum_collection_age_ms = 2000
            run_each_ms = 10000

            [[database.collections]]
            name = "notes"
            fields = [
                { name = "id", type = "string", required = true },
                { name = "body", type = "string" },
            ]

            [replication]
            push_batch_size = 10
            cycle_interval_ms = 250
            max_attempts = 4

            [election]
            lease_ttl_ms = 2000
            heartbeat_ms = 500

            [daemon]
            instances = 3
            data_dir = "/tmp/lofi"
            "#,
        )
        .unwrap();

        assert_eq!(config.database.name, "notes");
        assert_eq!(config.database.cleanup.run_each(), Duration::from_secs(10));
        assert_eq!(config.database.cleanup.minimum_collection_age(), Duration::from_secs(2));
        assert!(config.database.cleanup.wait_for_leadership);
        assert_eq!(config.database.collections.len(), 1);

        let replication = config.replication.to_config();
        assert_eq!(replication.push_batch_size, 10);
        assert_eq!(replication.pull_batch_size, 50);
        assert_eq!(replication.cycle_interval, Duration::from_millis(250));
        assert_eq!(replication.retry.max_attempts, 4);

        assert_eq!(config.election.to_config().lease_ttl, Duration::from_secs(2));
        assert_eq!(config.daemon.instances, 3);
        assert_eq!(config.daemon.data_dir, Some(PathBuf::from("/tmp/lofi")));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate() {
        let mut config = DaemonConfig::builtin();
        assert!(config.validate().is_err(), "encrypted list without password");

        config.database.password = Some("sudoLetMeIn".into());
        config.validate().unwrap();

        config.election.heartbeat_ms = config.election.lease_ttl_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lofi.toml");
        std::fs::write(&path, "[daemon]\ninstances = 2\n").unwrap();
        assert_eq!(DaemonConfig::load(&path).unwrap().daemon.instances, 2);
        assert!(DaemonConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
