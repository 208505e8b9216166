//! Live queries - incrementally maintained result sets
//!
//! Each subscriber owns an ordered delivery queue. The first item is always
//! [`LiveEvent::Initial`] with the full result set, followed by one
//! [`LiveEvent::Delta`] per change event that touched the result set.
//!
//! Membership is recomputed from the changed document alone: the
//! subscriber keeps its matching set keyed by sort order, so a change costs
//! `O(log n)` for unbounded queries and `O(window)` for `skip`/`limit`
//! queries, independent of collection size.
//!
//! Unsubscribing is synchronous with respect to delivery: once
//! [`LiveQuery::unsubscribe`] or [`CancelHandle::cancel`] returns, no further
//! event is handed out, including ones that were already queued.

use crate::changes::ChangeEvent;
use crate::document::Document;
use crate::selector::{Query, SortKey};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Item delivered to a live query subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Full result set at `sequence`
    Initial {
        sequence: u64,
        documents: Vec<Document>,
    },
    /// Changes to the result set caused by the event at `sequence`
    Delta {
        sequence: u64,
        changes: Vec<ResultChange>,
    },
}

impl LiveEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            LiveEvent::Initial { sequence, .. } | LiveEvent::Delta { sequence, .. } => *sequence,
        }
    }
}

/// A single change to a result set
#[derive(Debug, Clone, PartialEq)]
pub enum ResultChange {
    Added(Document),
    Updated(Document),
    /// Last snapshot of a document that left the result set
    Removed(Document),
}

impl ResultChange {
    pub fn document(&self) -> &Document {
        match self {
            ResultChange::Added(d) | ResultChange::Updated(d) | ResultChange::Removed(d) => d,
        }
    }
}

struct Subscriber {
    query: Query,
    matching: BTreeMap<SortKey, Document>,
    keys: HashMap<String, SortKey>,
    sender: mpsc::UnboundedSender<LiveEvent>,
    closed: Arc<AtomicBool>,
}

impl Subscriber {
    fn window(&self) -> impl Iterator<Item = &Document> {
        self.matching
            .values()
            .skip(self.query.skip)
            .take(self.query.limit.unwrap_or(usize::MAX))
    }

    /// Update membership for one changed document
    fn apply(&mut self, event: &ChangeEvent) -> Vec<ResultChange> {
        let doc = &event.document;
        let id = doc.id.as_str();

        let old_window: Option<Vec<Document>> = if self.query.is_windowed() {
            Some(self.window().cloned().collect())
        } else {
            None
        };

        let previous = self.keys.remove(id).and_then(|k| self.matching.remove(&k));
        let now_matches = !doc.deleted && self.query.selector.matches(doc);
        if now_matches {
            let key = self.query.sort_key(doc);
            self.keys.insert(id.to_string(), key.clone());
            self.matching.insert(key, doc.clone());
        }

        let old_window = match old_window {
            None => {
                return match (previous.is_some(), now_matches) {
                    (false, true) => vec![ResultChange::Added(doc.clone())],
                    (true, true) => vec![ResultChange::Updated(doc.clone())],
                    (true, false) => vec![ResultChange::Removed(doc.clone())],
                    (false, false) => Vec::new(),
                };
            }
            Some(w) => w,
        };

        let new_window: Vec<&Document> = self.window().collect();
        let old_ids: HashSet<&str> = old_window.iter().map(|d| d.id.as_str()).collect();
        let new_ids: HashSet<&str> = new_window.iter().map(|d| d.id.as_str()).collect();

        let mut changes = Vec::new();
        for old in &old_window {
            if !new_ids.contains(old.id.as_str()) {
                let last = if old.id.as_str() == id { doc } else { old };
                changes.push(ResultChange::Removed(last.clone()));
            }
        }
        for new in &new_window {
            if !old_ids.contains(new.id.as_str()) {
                changes.push(ResultChange::Added((*new).clone()));
            } else if new.id.as_str() == id {
                changes.push(ResultChange::Updated((*new).clone()));
            }
        }
        changes
    }
}

/// Registry of live subscribers of one collection
#[derive(Default)]
pub struct LiveQueryRegistry {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl LiveQueryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscriber whose initial result set is `matching`
    /// (all documents matching the selector at `sequence`).
    ///
    /// Callers must hold the collection's writer lock so that no event lands
    /// between the snapshot and the registration.
    pub(crate) fn register(
        self: &Arc<Self>,
        query: Query,
        matching: Vec<Document>,
        sequence: u64,
    ) -> LiveQuery {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let mut sub = Subscriber {
            query: query.clone(),
            matching: BTreeMap::new(),
            keys: HashMap::new(),
            sender,
            closed: closed.clone(),
        };
        for doc in matching {
            let key = query.sort_key(&doc);
            sub.keys.insert(doc.id.as_str().to_string(), key.clone());
            sub.matching.insert(key, doc);
        }
        let documents: Vec<Document> = sub.window().cloned().collect();
        // The receiver is alive; this cannot fail
        let _ = sub.sender.send(LiveEvent::Initial {
            sequence,
            documents,
        });

        self.subscribers.lock().insert(id, sub);
        debug!(subscription = id, "Live query registered");

        LiveQuery {
            id,
            receiver,
            closed,
            registry: Arc::downgrade(self),
            query,
            results: Vec::new(),
            sequence,
        }
    }

    /// Fan a change event out to every subscriber, in sequence order.
    ///
    /// Called with the collection's writer lock held.
    pub(crate) fn dispatch(&self, event: &ChangeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, sub| {
            if sub.closed.load(Ordering::SeqCst) {
                return false;
            }
            let changes = sub.apply(event);
            if changes.is_empty() {
                return true;
            }
            let delivered = sub
                .sender
                .send(LiveEvent::Delta {
                    sequence: event.sequence,
                    changes,
                })
                .is_ok();
            if !delivered {
                debug!(subscription = *id, "Live query receiver gone, dropping");
            }
            delivered
        });
    }

    fn remove(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    /// Number of active subscribers
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle that cancels a live query from anywhere
#[derive(Clone)]
pub struct CancelHandle {
    id: u64,
    closed: Arc<AtomicBool>,
    registry: Weak<LiveQueryRegistry>,
}

impl CancelHandle {
    /// Stop delivery. No event is observed after this returns.
    pub fn cancel(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(self.id);
            }
            debug!(subscription = self.id, "Live query cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A subscription to a continuously updated result set
pub struct LiveQuery {
    id: u64,
    receiver: mpsc::UnboundedReceiver<LiveEvent>,
    closed: Arc<AtomicBool>,
    registry: Weak<LiveQueryRegistry>,
    query: Query,
    results: Vec<Document>,
    sequence: u64,
}

impl LiveQuery {
    /// Wait for the next event; `None` once unsubscribed or the collection is gone
    pub async fn next(&mut self) -> Option<LiveEvent> {
        if self.is_cancelled() {
            return None;
        }
        let event = self.receiver.recv().await?;
        self.accept(event)
    }

    /// Next queued event without waiting
    pub fn try_next(&mut self) -> Option<LiveEvent> {
        if self.is_cancelled() {
            return None;
        }
        let event = self.receiver.try_recv().ok()?;
        self.accept(event)
    }

    fn accept(&mut self, event: LiveEvent) -> Option<LiveEvent> {
        // Anything still in flight when cancel returned is discarded
        if self.is_cancelled() {
            return None;
        }
        self.apply(&event);
        Some(event)
    }

    fn apply(&mut self, event: &LiveEvent) {
        self.sequence = event.sequence();
        match event {
            LiveEvent::Initial { documents, .. } => self.results = documents.clone(),
            LiveEvent::Delta { changes, .. } => {
                for change in changes {
                    let doc = change.document();
                    self.results.retain(|d| d.id != doc.id);
                    if !matches!(change, ResultChange::Removed(_)) {
                        let key = self.query.sort_key(doc);
                        let pos = self
                            .results
                            .partition_point(|d| self.query.sort_key(d) < key);
                        self.results.insert(pos, doc.clone());
                    }
                }
            }
        }
    }

    /// Current result set as of [`LiveQuery::sequence`]
    pub fn results(&self) -> &[Document] {
        &self.results
    }

    /// Sequence number of the last event applied to [`LiveQuery::results`]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            closed: self.closed.clone(),
            registry: self.registry.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop delivery and release the cached result set
    pub fn unsubscribe(&mut self) {
        self.cancel_handle().cancel();
        self.receiver.close();
        self.results = Vec::new();
    }

    /// Drive the subscription on a background task, calling `callback` with
    /// every event and the updated result set.
    ///
    /// A panicking callback only drops this subscriber.
    pub fn for_each<F>(mut self, mut callback: F) -> CancelHandle
    where
        F: FnMut(&LiveEvent, &[Document]) + Send + 'static,
    {
        let handle = self.cancel_handle();
        tokio::spawn(async move {
            while let Some(event) = self.next().await {
                let results = self.results();
                if catch_unwind(AssertUnwindSafe(|| callback(&event, results))).is_err() {
                    error!(subscription = self.id, "Live query callback panicked, unsubscribing");
                    self.unsubscribe();
                    break;
                }
            }
        });
        handle
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.cancel_handle().cancel();
    }
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .field("results", &self.results.len())
            .finish()
    }
}
