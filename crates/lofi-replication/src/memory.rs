//! In-memory remote endpoint
//!
//! A reference master implementing all three handler traits over a shared
//! map. Writes are accepted only when the row's assumed master matches the
//! stored version; otherwise the stored version is returned as a conflict.
//! Pull checkpoints are `{"seq": n}` where `n` counts accepted writes.

use crate::error::{ReplicationError, Result};
use crate::handler::{PullBatch, PullHandler, PullStream, PushHandler, PushRow, RemoteContext, StreamEvent};
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use lofi_core::Document;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

const STREAM_CHANNEL_CAPACITY: usize = 1024;

/// Matches every collection
const ALL_COLLECTIONS: &str = "*";

#[derive(Debug, Clone)]
enum Broadcast {
    Event(StreamEvent),
    Error(String),
}

#[derive(Debug, Clone)]
struct MasterEntry {
    seq: u64,
    document: Document,
}

#[derive(Default)]
struct MasterState {
    counter: u64,
    collections: HashMap<String, BTreeMap<String, MasterEntry>>,
}

impl MasterState {
    fn store(&mut self, collection: &str, document: Document) -> u64 {
        self.counter += 1;
        let seq = self.counter;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(document.id.as_str().to_string(), MasterEntry { seq, document });
        seq
    }
}

/// In-memory master for tests and demos
pub struct MemoryRemote {
    state: Mutex<MasterState>,
    events: broadcast::Sender<(String, Broadcast)>,
    /// Token required to open the live stream
    required_token: Option<String>,
    fail_pushes: AtomicUsize,
    fail_pulls: AtomicUsize,
    push_log: Mutex<Vec<Vec<PushRow>>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STREAM_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MasterState::default()),
            events,
            required_token: None,
            fail_pushes: AtomicUsize::new(0),
            fail_pulls: AtomicUsize::new(0),
            push_log: Mutex::new(Vec::new()),
        }
    }

    /// Require `token` to open the live stream
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.required_token = Some(token.into());
        self
    }

    /// Fail the next `n` push requests
    pub fn fail_next_pushes(&self, n: usize) {
        self.fail_pushes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` pull requests
    pub fn fail_next_pulls(&self, n: usize) {
        self.fail_pulls.store(n, Ordering::SeqCst);
    }

    /// Every push request received, failed ones included
    pub fn push_log(&self) -> Vec<Vec<PushRow>> {
        self.push_log.lock().clone()
    }

    /// Master documents of a collection, in key order
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.state
            .lock()
            .collections
            .get(collection)
            .map(|docs| docs.values().map(|e| e.document.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|e| e.document.clone())
    }

    /// Write directly to the master, as another client would
    pub fn write(&self, collection: &str, document: Document) {
        let seq = self.state.lock().store(collection, document.clone());
        self.broadcast(
            collection,
            Broadcast::Event(StreamEvent::Batch(PullBatch {
                documents: vec![document],
                checkpoint: Some(serde_json::json!({ "seq": seq })),
            })),
        );
    }

    /// Ask every connected stream to resync
    pub fn emit_resync(&self) {
        self.broadcast(ALL_COLLECTIONS, Broadcast::Event(StreamEvent::Resync));
    }

    /// Make every connected stream fail
    pub fn break_streams(&self, reason: impl Into<String>) {
        self.broadcast(ALL_COLLECTIONS, Broadcast::Error(reason.into()));
    }

    fn broadcast(&self, collection: &str, message: Broadcast) {
        // No receivers is fine
        let _ = self.events.send((collection.to_string(), message));
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PushHandler for MemoryRemote {
    async fn push(&self, _ctx: &RemoteContext, collection: &str, rows: Vec<PushRow>) -> Result<Vec<Document>> {
        self.push_log.lock().push(rows.clone());
        if Self::take_failure(&self.fail_pushes) {
            return Err(ReplicationError::transport("push rejected: remote unavailable"));
        }

        let mut conflicts = Vec::new();
        let mut written = Vec::new();
        let mut last_seq = 0;
        {
            let mut state = self.state.lock();
            for row in rows {
                let current = state
                    .collections
                    .get(collection)
                    .and_then(|docs| docs.get(row.new_document.id.as_str()))
                    .map(|e| e.document.clone());

                let conflict = match (&current, &row.assumed_master) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(cur), Some(assumed)) => cur.revision != assumed.revision,
                };
                match (conflict, current) {
                    (true, Some(cur)) => conflicts.push(cur),
                    _ => {
                        last_seq = state.store(collection, row.new_document.clone());
                        written.push(row.new_document);
                    }
                }
            }
        }

        debug!(collection, written = written.len(), conflicts = conflicts.len(), "Remote handled push");
        if !written.is_empty() {
            self.broadcast(
                collection,
                Broadcast::Event(StreamEvent::Batch(PullBatch {
                    documents: written,
                    checkpoint: Some(serde_json::json!({ "seq": last_seq })),
                })),
            );
        }
        Ok(conflicts)
    }
}

#[async_trait]
impl PullHandler for MemoryRemote {
    async fn pull(
        &self,
        _ctx: &RemoteContext,
        collection: &str,
        checkpoint: Option<&serde_json::Value>,
        batch_size: usize,
    ) -> Result<PullBatch> {
        if Self::take_failure(&self.fail_pulls) {
            return Err(ReplicationError::transport("pull rejected: remote unavailable"));
        }
        let after = checkpoint
            .and_then(|cp| cp.get("seq"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);

        let state = self.state.lock();
        let mut entries: Vec<&MasterEntry> = state
            .collections
            .get(collection)
            .map(|docs| docs.values().filter(|e| e.seq > after).collect())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.seq);
        entries.truncate(batch_size);

        let checkpoint = match entries.last() {
            Some(last) => Some(serde_json::json!({ "seq": last.seq })),
            None => checkpoint.cloned(),
        };
        Ok(PullBatch {
            documents: entries.into_iter().map(|e| e.document.clone()).collect(),
            checkpoint,
        })
    }
}

#[async_trait]
impl PullStream for MemoryRemote {
    async fn connect(
        &self,
        ctx: &RemoteContext,
        collection: &str,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        if let Some(required) = &self.required_token {
            if ctx.token.as_deref() != Some(required.as_str()) {
                return Err(ReplicationError::transport("stream rejected: invalid token"));
            }
        }

        let receiver = self.events.subscribe();
        let collection = collection.to_string();
        let stream = futures_util::stream::unfold((receiver, collection), |(mut receiver, collection)| async move {
            loop {
                match receiver.recv().await {
                    Ok((target, message)) if target == collection || target == ALL_COLLECTIONS => {
                        let item = match message {
                            Broadcast::Event(event) => Ok(event),
                            Broadcast::Error(reason) => Err(ReplicationError::stream(reason)),
                        };
                        return Some((item, (receiver, collection)));
                    }
                    Ok(_) => continue,
                    // Missed events are recovered by a full pull
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        return Some((Ok(StreamEvent::Resync), (receiver, collection)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
