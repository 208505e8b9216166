//! Periodic tombstone cleanup
//!
//! Purging a tombstone before it reached the remote would resurrect the
//! document on the next pull, so a run is skipped unless this instance
//! leads and every replication has nothing left to push (as configured by
//! the database's [`CleanupPolicy`]).
//!
//! A pass also compacts the change log of every replicated collection up
//! to the lowest push checkpoint of its replications.

use crate::election::LeaderElector;
use crate::engine::Replication;
use crate::error::Result;
use lofi_core::CleanupPolicy;
use lofi_storage::Persister;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Run one cleanup pass. Returns `None` when the policy skipped it.
pub async fn run_cleanup(
    persister: &Persister,
    policy: &CleanupPolicy,
    leader: Option<&LeaderElector>,
    replications: &[Arc<Replication>],
) -> Result<Option<usize>> {
    if policy.wait_for_leadership {
        if let Some(elector) = leader {
            if !elector.is_leader() {
                debug!("Cleanup skipped: not leader");
                return Ok(None);
            }
        }
    }
    if policy.await_replications_in_sync && replications.iter().any(|r| !r.is_in_sync()) {
        debug!("Cleanup skipped: replication not in sync");
        return Ok(None);
    }

    let purged = persister
        .cleanup(policy.minimum_deleted_time(), policy.minimum_collection_age())
        .await?;
    if purged > 0 {
        info!(purged, "Cleanup purged tombstones");
    }

    for collection in persister.database().collections() {
        let pushed = replications
            .iter()
            .filter(|r| r.collection().name() == collection.name())
            .map(|r| r.push_checkpoint())
            .min();
        if let Some(through) = pushed {
            persister.compact(&collection, through).await?;
        }
    }
    Ok(Some(purged))
}

/// Run cleanup every `run_each` until the database closes
pub fn spawn_cleanup(
    persister: Arc<Persister>,
    leader: Option<Arc<LeaderElector>>,
    replications: Vec<Arc<Replication>>,
) -> JoinHandle<()> {
    let policy = persister.database().config().cleanup.clone();
    let mut shutdown = persister.database().shutdown_signal();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.run_each());
        // The first tick fires immediately; skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = run_cleanup(&persister, &policy, leader.as_deref(), &replications).await {
                        warn!("Cleanup failed: {}", e);
                    }
                }
                // A dropped sender stops the task as well
                _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => break,
            }
        }
        debug!("Cleanup task stopped");
    })
}
