//! Replication engine - keeps one collection in sync with a remote
//!
//! # Cycle
//!
//! ```text
//! Idle ──► Pushing ──► Pulling ──► Streaming ──► (Resync) ──► Pushing ...
//!   ▲                                   │
//!   └──────── backoff ◄── Error ◄───────┘
//! ```
//!
//! # Checkpoint Semantics
//!
//! Both checkpoints record the **last successfully applied** position:
//! - push: sequence of the last change event the remote accepted,
//! - pull: the opaque remote checkpoint of the last batch that was applied
//!   and persisted locally.
//!
//! A crash between applying and saving a checkpoint re-sends or re-applies
//! the same batch, which is harmless because applying a document twice is
//! the same as applying it once.

use crate::election::LeaderElector;
use crate::error::{ReplicationError, Result};
use crate::handler::{PullBatch, PushRow, Remote, RemoteContext, StreamEvent};
use crate::retry::RetryConfig;
use futures_util::StreamExt;
use lofi_core::{
    now_ms, ApplyOutcome, ChangeEvent, ChangeOrigin, Collection, ConflictHandler, Document, DocumentId,
    LastWriteWins, Resolution, Revision,
};
use lofi_storage::{CheckpointKey, Direction, Persister};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Replication settings
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationConfig {
    /// Maximum distinct documents per push request
    pub push_batch_size: usize,
    /// Documents requested per pull request
    pub pull_batch_size: usize,
    /// Open the live pull stream after each cycle
    pub live: bool,
    /// Local document holding the bearer token
    pub token_key: String,
    /// Pause between cycles when no live stream is open
    pub cycle_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            push_batch_size: 50,
            pull_batch_size: 50,
            live: true,
            token_key: "token".to_string(),
            cycle_interval: Duration::from_secs(10),
            retry: RetryConfig::daemon(),
        }
    }
}

impl ReplicationConfig {
    pub fn testing() -> Self {
        Self {
            cycle_interval: Duration::from_millis(50),
            retry: RetryConfig::testing(),
            ..Default::default()
        }
    }
}

/// Observable replication state
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationState {
    Idle,
    Pushing,
    Pulling,
    Streaming,
    Error { attempt: usize, message: String },
    Stopped,
}

/// A remote version that collided with an unpushed local edit
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub collection: String,
    pub id: DocumentId,
    pub local: Revision,
    pub remote: Revision,
    /// Which side the conflict handler kept
    pub resolution: Resolution,
    pub detected_at: u64,
}

/// Why the live stream phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// No stream configured or no token
    Unavailable,
    Resync,
    TokenChanged,
    LostLeadership,
    Stopped,
}

/// Builder for [`Replication`]
pub struct ReplicationBuilder {
    persister: Arc<Persister>,
    collection: String,
    remote: Remote,
    config: ReplicationConfig,
    conflict_handler: Arc<dyn ConflictHandler>,
}

impl ReplicationBuilder {
    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = handler;
        self
    }

    pub async fn build(self) -> Result<Arc<Replication>> {
        if self.config.push_batch_size == 0 || self.config.pull_batch_size == 0 {
            return Err(ReplicationError::Config("batch sizes must be positive".into()));
        }
        let collection = self.persister.database().collection(&self.collection)?;
        let push_key = CheckpointKey::new(&self.collection, &self.remote.endpoint, Direction::Push);
        let pull_key = CheckpointKey::new(&self.collection, &self.remote.endpoint, Direction::Pull);

        let push_sequence = self
            .persister
            .storage()
            .load_checkpoint(&push_key)
            .await?
            .and_then(|cp| cp.get("sequence").and_then(serde_json::Value::as_u64))
            .unwrap_or(0);

        let (state, _) = watch::channel(ReplicationState::Idle);
        let (progress, _) = watch::channel(0);

        info!(
            collection = %self.collection,
            endpoint = %self.remote.endpoint,
            push_sequence,
            "Replication configured"
        );

        Ok(Arc::new(Replication {
            persister: self.persister,
            collection,
            remote: self.remote,
            config: self.config,
            conflict_handler: self.conflict_handler,
            push_key,
            pull_key,
            push_sequence: AtomicU64::new(push_sequence),
            pulled: AtomicBool::new(false),
            state,
            progress,
            conflicts: Mutex::new(Vec::new()),
            cycle: tokio::sync::Mutex::new(()),
        }))
    }
}

/// Replication of one collection with one remote
pub struct Replication {
    persister: Arc<Persister>,
    collection: Arc<Collection>,
    remote: Remote,
    config: ReplicationConfig,
    conflict_handler: Arc<dyn ConflictHandler>,
    push_key: CheckpointKey,
    pull_key: CheckpointKey,
    /// Cached push checkpoint
    push_sequence: AtomicU64,
    /// A pull cycle completed since start
    pulled: AtomicBool,
    state: watch::Sender<ReplicationState>,
    /// Bumped after every completed cycle or stream batch
    progress: watch::Sender<u64>,
    conflicts: Mutex<Vec<ConflictRecord>>,
    /// Serializes push and pull work
    cycle: tokio::sync::Mutex<()>,
}

impl Replication {
    pub fn builder(persister: Arc<Persister>, collection: impl Into<String>, remote: Remote) -> ReplicationBuilder {
        ReplicationBuilder {
            persister,
            collection: collection.into(),
            remote,
            config: ReplicationConfig::default(),
            conflict_handler: Arc::new(LastWriteWins),
        }
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn state(&self) -> ReplicationState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReplicationState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ReplicationState) {
        self.state.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    fn bump_progress(&self) {
        self.progress.send_modify(|n| *n += 1);
    }

    /// Conflicts detected so far
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.lock().clone()
    }

    /// Sequence of the last change event accepted by the remote
    pub fn push_checkpoint(&self) -> u64 {
        self.push_sequence.load(Ordering::SeqCst)
    }

    pub async fn pull_checkpoint(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.persister.storage().load_checkpoint(&self.pull_key).await?)
    }

    fn context(&self) -> RemoteContext {
        let token = self
            .persister
            .database()
            .get_local(&self.config.token_key)
            .and_then(|doc| match doc.data {
                serde_json::Value::String(s) => Some(s),
                other => other.get("token").and_then(|t| t.as_str()).map(str::to_string),
            })
            .filter(|t| !t.is_empty());
        RemoteContext { token }
    }

    fn pending_events(&self) -> Vec<Arc<ChangeEvent>> {
        self.collection
            .changes()
            .since(self.push_checkpoint())
            .into_iter()
            .filter(|e| e.origin == ChangeOrigin::Local)
            .collect()
    }

    /// Number of local changes not yet accepted by the remote
    pub fn pending_count(&self) -> usize {
        self.pending_events().len()
    }

    /// No unpushed local change and at least one completed pull
    pub fn is_in_sync(&self) -> bool {
        self.pulled.load(Ordering::SeqCst) && self.pending_count() == 0
    }

    /// Resolves once [`Replication::is_in_sync`] holds
    pub async fn await_in_sync(&self) {
        let mut progress = self.progress.subscribe();
        loop {
            if self.is_in_sync() {
                return;
            }
            // The sender lives in self
            let _ = progress.changed().await;
        }
    }

    async fn save_push_checkpoint(&self, sequence: u64) -> Result<()> {
        self.persister
            .storage()
            .save_checkpoint(&self.push_key, &serde_json::json!({ "sequence": sequence }))
            .await?;
        self.push_sequence.store(sequence, Ordering::SeqCst);
        Ok(())
    }

    /// Push every local change recorded so far
    pub async fn push_once(&self) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        self.push_pending().await
    }

    async fn push_pending(&self) -> Result<usize> {
        let ctx = self.context();
        let name = self.collection.name();
        let target = self.collection.changes().last_sequence();
        let mut pushed = 0;

        loop {
            let from = self.push_checkpoint();
            if from >= target {
                break;
            }
            let events = self.collection.changes().since(from);
            let (rows, upper) = collect_push_batch(&events, from, target, self.config.push_batch_size);

            if rows.is_empty() {
                self.save_push_checkpoint(upper).await?;
                continue;
            }

            let count = rows.len();
            debug!(collection = %name, from, to = upper, rows = count, "Pushing batch");
            let conflicts = self.remote.push.push(&ctx, name, rows).await?;

            for master in conflicts {
                self.resolve_push_conflict(master)?;
            }
            self.persister.flush(&self.collection).await?;
            self.save_push_checkpoint(upper).await?;
            pushed += count;
        }

        if pushed > 0 {
            info!(collection = %name, pushed, checkpoint = self.push_checkpoint(), "Pushed local changes");
        }
        Ok(pushed)
    }

    fn resolve_push_conflict(&self, master: Document) -> Result<()> {
        let id = master.id.clone();
        match self.collection.apply_remote(master.clone(), self.conflict_handler.as_ref())? {
            ApplyOutcome::Applied(_) => {
                debug!(collection = %self.collection.name(), id = %id, "Remote version won push conflict");
            }
            ApplyOutcome::Unchanged => {}
            ApplyOutcome::KeptLocal(_) => {
                // Re-issue the local version on top of the master for the next push
                let rebased = self.collection.rebase_on(&master)?;
                debug!(
                    collection = %self.collection.name(),
                    id = %id,
                    revision = %rebased.revision,
                    "Local version won push conflict, rebased"
                );
            }
        }
        Ok(())
    }

    /// Pull until the remote has nothing newer
    pub async fn pull_once(&self) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        self.pull_pending().await
    }

    async fn pull_pending(&self) -> Result<usize> {
        let ctx = self.context();
        let name = self.collection.name();
        let batch_size = self.config.pull_batch_size;
        let mut total = 0;

        loop {
            let checkpoint = self.persister.storage().load_checkpoint(&self.pull_key).await?;
            let batch = self
                .remote
                .pull
                .pull(&ctx, name, checkpoint.as_ref(), batch_size)
                .await?;
            let received = batch.documents.len();
            total += self.apply_batch(batch).await?;
            if received < batch_size {
                break;
            }
        }

        self.pulled.store(true, Ordering::SeqCst);
        if total > 0 {
            info!(collection = %name, applied = total, "Pulled remote changes");
        }
        Ok(total)
    }

    /// Apply a pulled batch, persist it, then advance the pull checkpoint
    async fn apply_batch(&self, batch: PullBatch) -> Result<usize> {
        let pending: HashSet<DocumentId> = self
            .pending_events()
            .iter()
            .map(|e| e.document.id.clone())
            .collect();

        let mut applied = 0;
        for remote in batch.documents {
            let id = remote.id.clone();
            let remote_revision = remote.revision.clone();
            let local_revision = self.collection.get(id.as_str()).map(|d| d.revision);

            let outcome = self
                .collection
                .apply_remote(remote, self.conflict_handler.as_ref())?;
            let resolution = match outcome {
                ApplyOutcome::Applied(_) => {
                    applied += 1;
                    Resolution::TakeRemote
                }
                ApplyOutcome::Unchanged => continue,
                ApplyOutcome::KeptLocal(_) => Resolution::KeepLocal,
            };

            if let (true, Some(local)) = (pending.contains(&id), local_revision) {
                warn!(
                    collection = %self.collection.name(),
                    id = %id,
                    local = %local,
                    remote = %remote_revision,
                    resolution = ?resolution,
                    "Remote change conflicts with unpushed local edit"
                );
                self.conflicts.lock().push(ConflictRecord {
                    collection: self.collection.name().to_string(),
                    id,
                    local,
                    remote: remote_revision,
                    resolution,
                    detected_at: now_ms(),
                });
            }
        }

        self.persister.flush(&self.collection).await?;
        if let Some(checkpoint) = batch.checkpoint {
            self.persister
                .storage()
                .save_checkpoint(&self.pull_key, &checkpoint)
                .await?;
        }
        Ok(applied)
    }

    /// One push followed by one full pull
    pub async fn run_once(&self) -> Result<()> {
        let _cycle = self.cycle.lock().await;
        self.set_state(ReplicationState::Pushing);
        self.push_pending().await?;
        self.set_state(ReplicationState::Pulling);
        self.pull_pending().await?;
        self.set_state(ReplicationState::Idle);
        self.bump_progress();
        Ok(())
    }

    async fn stream_phase(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        leader: Option<&LeaderElector>,
    ) -> Result<StreamEnd> {
        let stream = match &self.remote.stream {
            Some(stream) if self.config.live => stream.clone(),
            _ => return Ok(StreamEnd::Unavailable),
        };
        let ctx = self.context();
        if ctx.token.is_none() {
            debug!(collection = %self.collection.name(), "No token, live stream not opened");
            return Ok(StreamEnd::Unavailable);
        }

        let mut events = stream
            .connect(&ctx, self.collection.name())
            .await
            .map_err(|e| ReplicationError::stream(e.to_string()))?;
        let mut local = self.collection.changes().subscribe();
        let mut token = self.persister.database().watch_local(&self.config.token_key);
        // The first item is the current value
        token.next().await;

        // Rebased versions from the last push are not in `local`
        if self.pending_count() > 0 {
            self.push_once().await?;
            self.bump_progress();
        }

        // Remote writes between the last pull and the subscription only
        // reach us through a pull. Stream batches buffered meanwhile are
        // re-applied as no-ops.
        self.pull_once().await?;
        self.bump_progress();

        self.set_state(ReplicationState::Streaming);
        debug!(collection = %self.collection.name(), "Live stream open");

        loop {
            tokio::select! {
                item = events.next() => match item {
                    Some(Ok(StreamEvent::Batch(batch))) => {
                        let _cycle = self.cycle.lock().await;
                        self.apply_batch(batch).await?;
                        self.bump_progress();
                    }
                    Some(Ok(StreamEvent::Resync)) | None => return Ok(StreamEnd::Resync),
                    Some(Err(e)) => return Err(ReplicationError::stream(e.to_string())),
                },
                event = local.recv() => match event {
                    Ok(event) if event.origin == ChangeOrigin::Remote => {}
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.push_once().await?;
                        self.bump_progress();
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(StreamEnd::Stopped),
                },
                _ = token.next() => return Ok(StreamEnd::TokenChanged),
                _ = leadership_lost(leader) => return Ok(StreamEnd::LostLeadership),
                _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => return Ok(StreamEnd::Stopped),
            }
        }
    }

    /// Replicate until `shutdown` flips or a non-retryable error occurs.
    ///
    /// With an elector, work only happens while this instance is leader.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, leader: Option<Arc<LeaderElector>>) -> Result<()> {
        let name = self.collection.name().to_string();
        let mut local = self.collection.changes().subscribe();
        let mut attempt = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(elector) = &leader {
                if !elector.is_leader() {
                    self.set_state(ReplicationState::Idle);
                    debug!(collection = %name, "Waiting for leadership");
                    tokio::select! {
                        _ = elector.wait_for_leadership() => {}
                        _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => break,
                    }
                }
            }

            let result = match self.run_once().await {
                Ok(()) => self.stream_phase(&mut shutdown, leader.as_deref()).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(StreamEnd::Unavailable) => {
                    attempt = 0;
                    self.set_state(ReplicationState::Idle);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.cycle_interval) => {}
                        _ = wait_for_local_change(&mut local) => {}
                        _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => break,
                    }
                }
                Ok(StreamEnd::Resync) => {
                    attempt = 0;
                    info!(collection = %name, "Stream requested resync, running full cycle");
                }
                Ok(StreamEnd::TokenChanged) | Ok(StreamEnd::LostLeadership) => attempt = 0,
                Ok(StreamEnd::Stopped) => break,
                Err(e) => {
                    attempt += 1;
                    self.set_state(ReplicationState::Error {
                        attempt,
                        message: e.to_string(),
                    });
                    if !e.is_retryable() || !self.config.retry.allows(attempt) {
                        error!(collection = %name, attempt, "Replication failed: {}", e);
                        self.set_state(ReplicationState::Stopped);
                        return Err(e);
                    }
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(collection = %name, attempt, delay_ms = delay.as_millis() as u64, "Replication cycle failed, retrying: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => break,
                    }
                }
            }
        }

        self.set_state(ReplicationState::Stopped);
        info!(collection = %name, "Replication stopped");
        Ok(())
    }

    /// Run the replication loop until the database closes
    pub fn spawn(self: Arc<Self>, leader: Option<Arc<LeaderElector>>) -> JoinHandle<Result<()>> {
        let shutdown = self.persister.database().shutdown_signal();
        tokio::spawn(self.run(shutdown, leader))
    }
}

impl std::fmt::Debug for Replication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replication")
            .field("collection", &self.collection.name())
            .field("remote", &self.remote)
            .field("state", &self.state())
            .field("push_checkpoint", &self.push_checkpoint())
            .finish()
    }
}

/// Collect up to `batch_size` documents of local changes in `(from, target]`,
/// one row per document carrying its latest version. Returns the rows and
/// the sequence the batch covers.
fn collect_push_batch(
    events: &[Arc<ChangeEvent>],
    from: u64,
    target: u64,
    batch_size: usize,
) -> (Vec<PushRow>, u64) {
    let mut slots: Vec<Option<PushRow>> = Vec::new();
    let mut index: HashMap<DocumentId, usize> = HashMap::new();
    let mut upper = from;

    for event in events {
        if event.sequence > target {
            break;
        }
        let id = &event.document.id;
        match (event.origin, index.get(id).copied()) {
            (ChangeOrigin::Local, Some(slot)) => {
                if let Some(row) = slots[slot].as_mut() {
                    row.new_document = event.document.clone();
                }
            }
            (ChangeOrigin::Local, None) => {
                if slots.len() == batch_size {
                    break;
                }
                index.insert(id.clone(), slots.len());
                slots.push(Some(PushRow {
                    new_document: event.document.clone(),
                    assumed_master: event.previous.clone(),
                }));
            }
            // A remote version replaced the pending one; nothing left to push
            (ChangeOrigin::Remote, Some(slot)) => {
                slots[slot] = None;
                index.remove(id);
            }
            (ChangeOrigin::Remote, None) => {}
        }
        upper = event.sequence;
    }

    (slots.into_iter().flatten().collect(), upper)
}

async fn wait_for_local_change(local: &mut broadcast::Receiver<Arc<ChangeEvent>>) {
    loop {
        match local.recv().await {
            Ok(event) if event.origin == ChangeOrigin::Local => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

async fn leadership_lost(leader: Option<&LeaderElector>) {
    match leader {
        Some(elector) => loop {
            tokio::time::sleep(elector.config().heartbeat).await;
            if !elector.is_leader() {
                return;
            }
        },
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lofi_core::CollectionSchema;
    use serde_json::json;

    fn events(c: &Collection) -> Vec<Arc<ChangeEvent>> {
        c.changes().since(0)
    }

    fn todos() -> Collection {
        Collection::standalone(CollectionSchema::new("todos").allow_additional_fields()).unwrap()
    }

    #[test]
    fn test_push_batch_dedupes_per_document() {
        let c = todos();
        let v1 = c.insert(json!({"id": "1", "n": 1})).unwrap();
        c.insert(json!({"id": "2", "n": 1})).unwrap();
        let latest = c.patch("1", json!({"n": 2})).unwrap();

        let (rows, upper) = collect_push_batch(&events(&c), 0, 3, 10);
        assert_eq!(upper, 3);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].new_document, latest);
        assert!(rows[0].assumed_master.is_none());
        assert_ne!(rows[0].new_document.revision, v1.revision);
    }

    #[test]
    fn test_push_batch_respects_size_and_target() {
        let c = todos();
        for i in 0..5 {
            c.insert(json!({"id": i.to_string()})).unwrap();
        }
        let (rows, upper) = collect_push_batch(&events(&c), 0, 5, 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(upper, 2);

        let (rows, upper) = collect_push_batch(&events(&c)[2..], 2, 4, 10);
        assert_eq!(rows.len(), 2);
        assert_eq!(upper, 4);
    }

    #[test]
    fn test_push_batch_drops_rows_overwritten_by_remote() {
        let c = todos();
        c.insert(json!({"id": "1", "n": 1})).unwrap();
        let mut remote = c.get("1").unwrap();
        remote.data = lofi_core::Value::from(json!({"id": "1", "n": 9}));
        remote.revision = Revision::compute(5, &remote.data, false);
        c.apply_remote(remote, &LastWriteWins).unwrap();

        let (rows, upper) = collect_push_batch(&events(&c), 0, 2, 10);
        assert!(rows.is_empty());
        assert_eq!(upper, 2);
    }

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert_eq!(config.token_key, "token");
        assert!(config.live);
        assert_eq!(config.retry, RetryConfig::daemon());
    }
}
