//! LOFI Daemon (lofid)
//!
//! Runs local-first database instances that elect a leader over a shared
//! lease and replicate every collection with an in-memory remote.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (one in-memory instance)
//! lofid --password sudoLetMeIn
//!
//! # Three instances competing for leadership, persisted to SQLite
//! lofid --password sudoLetMeIn --instances 3 --data-dir /var/lib/lofi
//!
//! # With configuration file
//! lofid --config /etc/lofi/lofi.toml
//!
//! # Single push/pull cycle, then exit
//! lofid --password sudoLetMeIn --once
//! ```

mod config;
mod instance;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lofi_replication::MemoryRemote;

use crate::config::DaemonConfig;
use crate::instance::{open_storage, Instance};

/// LOFI Daemon - local-first replication
#[derive(Parser, Debug)]
#[command(name = "lofid")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "LOFI_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOFI_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Directory for SQLite files (default: in-memory only)
    #[arg(long, env = "LOFI_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Password for encrypted fields
    #[arg(long, env = "LOFI_PASSWORD")]
    password: Option<String>,

    /// Bearer token for the live pull stream
    #[arg(long, env = "LOFI_TOKEN")]
    token: Option<String>,

    /// Number of in-process instances
    #[arg(long, env = "LOFI_INSTANCES")]
    instances: Option<usize>,

    /// Leader lease duration in milliseconds
    #[arg(long, env = "LOFI_LEASE_TTL_MS")]
    lease_ttl_ms: Option<u64>,

    /// Lease renewal interval in milliseconds
    #[arg(long, env = "LOFI_HEARTBEAT_MS")]
    heartbeat_ms: Option<u64>,

    /// Run one replication cycle per instance and exit
    #[arg(long)]
    once: bool,
}

impl Args {
    /// Command line values take precedence over the file
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(dir) = &self.data_dir {
            config.daemon.data_dir = Some(dir.clone());
        }
        if let Some(password) = &self.password {
            config.database.password = Some(password.clone());
        }
        if let Some(token) = &self.token {
            config.daemon.token = Some(token.clone());
        }
        if let Some(instances) = self.instances {
            config.daemon.instances = instances;
        }
        if let Some(ttl) = self.lease_ttl_ms {
            config.election.lease_ttl_ms = ttl;
        }
        if let Some(heartbeat) = self.heartbeat_ms {
            config.election.heartbeat_ms = heartbeat;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            DaemonConfig::load(path)?
        }
        None => DaemonConfig::builtin(),
    };
    args.apply(&mut config);
    config.validate()?;

    match &config.daemon.data_dir {
        Some(dir) => info!(path = %dir.display(), "SQLite persistence enabled"),
        None => info!("Running in-memory only (no --data-dir specified)"),
    }
    if config.daemon.token.is_none() {
        info!("No token configured, live stream stays closed");
    }

    let leases = open_storage(config.daemon.data_dir.as_deref(), "leases.db")?;
    let remote = Arc::new(MemoryRemote::new());

    let mut instances = Vec::with_capacity(config.daemon.instances);
    for index in 0..config.daemon.instances {
        instances.push(Instance::open(index, &config, leases.clone(), remote.clone()).await?);
    }

    if args.once {
        for instance in &instances {
            instance.run_once().await?;
        }
        for instance in instances {
            instance.shutdown().await?;
        }
        return Ok(());
    }

    info!(
        database = %config.database.name,
        instances = instances.len(),
        lease_ttl_ms = config.election.lease_ttl_ms,
        heartbeat_ms = config.election.heartbeat_ms,
        "Starting LOFI daemon"
    );

    let flush_interval = Duration::from_millis(config.daemon.flush_interval_ms);
    for instance in &mut instances {
        instance.start(flush_interval);
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for instance in instances {
        instance.shutdown().await?;
    }

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╦  ╔═╗╔═╗╦
  ║  ║ ║╠╣ ║
  ╩═╝╚═╝╚  ╩
  Local-First Replication
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
