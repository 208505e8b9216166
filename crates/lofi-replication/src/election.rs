//! Leader election over a shared lease
//!
//! Every instance sharing a [`Storage`] competes for one lease record. The
//! holder renews it every `heartbeat`; if it stops renewing, the lease
//! expires after `lease_ttl` and the next heartbeat of another instance
//! takes it over.
//!
//! An instance only considers itself leader until the expiry of the lease
//! it last confirmed, so a stalled leader steps down on its own before
//! anyone else can acquire the lease.

use crate::error::Result;
use lofi_core::now_ms;
use lofi_storage::Storage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Leader election settings
#[derive(Debug, Clone, PartialEq)]
pub struct ElectionConfig {
    /// Lease record name; instances using the same name compete
    pub name: String,
    pub lease_ttl: Duration,
    pub heartbeat: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            name: "leader".to_string(),
            lease_ttl: Duration::from_secs(5),
            heartbeat: Duration::from_secs(1),
        }
    }
}

impl ElectionConfig {
    pub fn testing() -> Self {
        Self {
            name: "leader".to_string(),
            lease_ttl: Duration::from_millis(300),
            heartbeat: Duration::from_millis(50),
        }
    }
}

/// Campaigns for leadership of one lease
pub struct LeaderElector {
    storage: Arc<dyn Storage>,
    owner: String,
    config: ElectionConfig,
    /// Unix millis until which this instance may act as leader
    leader_until: AtomicU64,
    leader: watch::Sender<bool>,
}

impl LeaderElector {
    pub fn new(storage: Arc<dyn Storage>, owner: impl Into<String>, config: ElectionConfig) -> Arc<Self> {
        let (leader, _) = watch::channel(false);
        Arc::new(Self {
            storage,
            owner: owner.into(),
            config,
            leader_until: AtomicU64::new(0),
            leader,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Whether this instance holds an unexpired lease
    pub fn is_leader(&self) -> bool {
        now_ms() < self.leader_until.load(Ordering::SeqCst)
    }

    /// Try to acquire or renew the lease once. Returns leadership.
    pub async fn tick(&self) -> Result<bool> {
        // Measure from before the request so the local view never outlives the lease
        let started = now_ms();
        let acquired = match self
            .storage
            .try_acquire_lease(&self.config.name, &self.owner, self.config.lease_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                self.leader_until.store(0, Ordering::SeqCst);
                self.publish(false);
                return Err(e.into());
            }
        };

        if acquired {
            self.leader_until
                .store(started + self.config.lease_ttl.as_millis() as u64, Ordering::SeqCst);
        } else {
            self.leader_until.store(0, Ordering::SeqCst);
        }
        self.publish(acquired);
        Ok(acquired)
    }

    fn publish(&self, leader: bool) {
        let changed = self.leader.send_if_modified(|current| {
            if *current != leader {
                *current = leader;
                true
            } else {
                false
            }
        });
        if changed {
            if leader {
                info!(owner = %self.owner, lease = %self.config.name, "Became leader");
            } else {
                info!(owner = %self.owner, lease = %self.config.name, "Lost leadership");
            }
        }
    }

    /// Give up the lease immediately
    pub async fn resign(&self) -> Result<()> {
        self.leader_until.store(0, Ordering::SeqCst);
        self.publish(false);
        let released = self.storage.release_lease(&self.config.name, &self.owner).await?;
        debug!(owner = %self.owner, released, "Resigned leadership");
        Ok(())
    }

    /// Leadership transitions
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader.subscribe()
    }

    /// Resolves once this instance is leader
    pub async fn wait_for_leadership(&self) {
        let mut leader = self.subscribe();
        loop {
            if self.is_leader() {
                return;
            }
            // Renewals after a lapse do not flip the channel, so poll as well
            tokio::select! {
                _ = leader.changed() => {}
                _ = tokio::time::sleep(self.config.heartbeat) => {}
            }
        }
    }

    /// Campaign every heartbeat until `shutdown` flips, then resign
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.heartbeat);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(owner = %self.owner, "Lease renewal failed: {}", e);
                        }
                    }
                    _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => break,
                }
            }
            if let Err(e) = self.resign().await {
                warn!(owner = %self.owner, "Failed to release lease: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lofi_storage::MemoryStorage;

    #[tokio::test]
    async fn test_single_winner() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let a = LeaderElector::new(storage.clone(), "a", ElectionConfig::testing());
        let b = LeaderElector::new(storage.clone(), "b", ElectionConfig::testing());

        assert!(a.tick().await.unwrap());
        assert!(!b.tick().await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert!(*a.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_resign_hands_over() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let a = LeaderElector::new(storage.clone(), "a", ElectionConfig::testing());
        let b = LeaderElector::new(storage.clone(), "b", ElectionConfig::testing());

        a.tick().await.unwrap();
        a.resign().await.unwrap();
        assert!(!a.is_leader());
        assert!(b.tick().await.unwrap());
        assert!(!a.tick().await.unwrap());
    }

    #[tokio::test]
    async fn test_leadership_expires_without_renewal() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let a = LeaderElector::new(storage, "a", ElectionConfig::testing());
        a.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_wait_for_leadership() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let a = LeaderElector::new(storage, "a", ElectionConfig::testing());
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let _task = a.clone().spawn(shutdown);

        tokio::time::timeout(Duration::from_secs(2), a.wait_for_leadership())
            .await
            .unwrap();
        assert!(a.is_leader());
    }
}
