//! LOFI Replication
//!
//! Keeps local collections in sync with a remote master:
//! - Push of local changes and pull of remote changes with durable checkpoints
//! - A token-gated live pull stream with forced resync on failure
//! - Exponential backoff on transport errors
//! - Lease-based leader election so one instance replicates at a time
//! - Tombstone cleanup once replication is in sync

pub mod cleanup;
pub mod election;
pub mod engine;
pub mod error;
pub mod handler;
pub mod memory;
pub mod retry;

pub use cleanup::{run_cleanup, spawn_cleanup};
pub use election::{ElectionConfig, LeaderElector};
pub use engine::{ConflictRecord, Replication, ReplicationBuilder, ReplicationConfig, ReplicationState};
pub use error::{ReplicationError, Result};
pub use handler::{PullBatch, PullHandler, PullStream, PushHandler, PushRow, Remote, RemoteContext, StreamEvent};
pub use memory::MemoryRemote;
pub use retry::RetryConfig;
