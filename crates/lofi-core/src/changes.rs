//! Change stream - append-only log of collection mutations
//!
//! Every successful mutation of a collection appends exactly one
//! [`ChangeEvent`] whose sequence number is one greater than the previous
//! one. Readers either replay from a cursor with [`ChangeStream::since`] or
//! follow live events with [`ChangeStream::subscribe`]. The live channel may
//! lag under load; consumers that must not miss events use it only as a
//! wake-up signal and re-read from their own persisted cursor.

use crate::document::Document;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the live notification channel
const LIVE_CHANNEL_CAPACITY: usize = 4096;

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Where a mutation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    /// Written by this instance
    Local,
    /// Applied from a replication remote
    Remote,
}

/// An immutable entry of the change stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub sequence: u64,
    pub collection: String,
    pub kind: ChangeKind,
    pub origin: ChangeOrigin,
    /// Snapshot after the mutation
    pub document: Document,
    /// Snapshot before the mutation
    pub previous: Option<Document>,
}

/// Append-only per-collection log
pub struct ChangeStream {
    collection: String,
    events: RwLock<Vec<Arc<ChangeEvent>>>,
    sender: broadcast::Sender<Arc<ChangeEvent>>,
}

impl ChangeStream {
    pub fn new(collection: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            collection: collection.into(),
            events: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Append a new event. Callers serialize appends per collection.
    pub(crate) fn append(
        &self,
        kind: ChangeKind,
        origin: ChangeOrigin,
        document: Document,
        previous: Option<Document>,
    ) -> Arc<ChangeEvent> {
        let mut events = self.events.write();
        let sequence = events.last().map_or(1, |e| e.sequence + 1);
        let event = Arc::new(ChangeEvent {
            sequence,
            collection: self.collection.clone(),
            kind,
            origin,
            document,
            previous,
        });
        events.push(event.clone());
        drop(events);

        // No receivers is fine
        let _ = self.sender.send(event.clone());
        event
    }

    /// Replace the log with persisted events (at open, before any append)
    pub(crate) fn restore(&self, mut restored: Vec<ChangeEvent>) -> Result<()> {
        restored.sort_by_key(|e| e.sequence);
        for (i, pair) in restored.windows(2).enumerate() {
            if pair[1].sequence != pair[0].sequence + 1 {
                return Err(Error::Serialization(format!(
                    "change log of {} has a gap after sequence {} (entry {})",
                    self.collection, pair[0].sequence, i
                )));
            }
        }
        *self.events.write() = restored.into_iter().map(Arc::new).collect();
        Ok(())
    }

    /// Sequence number of the newest event, 0 when empty
    pub fn last_sequence(&self) -> u64 {
        self.events.read().last().map_or(0, |e| e.sequence)
    }

    /// All events with `sequence > cursor`, oldest first
    pub fn since(&self, cursor: u64) -> Vec<Arc<ChangeEvent>> {
        self.since_limited(cursor, usize::MAX)
    }

    /// At most `limit` events with `sequence > cursor`
    pub fn since_limited(&self, cursor: u64, limit: usize) -> Vec<Arc<ChangeEvent>> {
        let events = self.events.read();
        let first = match events.first() {
            Some(e) => e.sequence,
            None => return Vec::new(),
        };
        // Sequences are contiguous, so the position is arithmetic
        let start = cursor.saturating_add(1).saturating_sub(first) as usize;
        events.iter().skip(start).take(limit).cloned().collect()
    }

    /// Drop events with `sequence <= through`, always keeping the newest
    /// one so appends continue the sequence. Returns how many were dropped.
    pub fn compact(&self, through: u64) -> usize {
        let mut events = self.events.write();
        let droppable = events.len().saturating_sub(1);
        let count = events
            .iter()
            .take(droppable)
            .take_while(|e| e.sequence <= through)
            .count();
        events.drain(..count);
        count
    }

    /// Follow events appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeEvent>> {
        self.sender.subscribe()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;
    use crate::value::Value;
    use serde_json::json;

    fn doc(id: &str, name: &str) -> Document {
        Document::next_version(
            DocumentId::new(id).unwrap(),
            Value::from(json!({"id": id, "name": name})),
            false,
            None,
        )
    }

    #[test]
    fn test_sequences_are_contiguous() {
        let stream = ChangeStream::new("todos");
        for i in 0..5 {
            let e = stream.append(ChangeKind::Insert, ChangeOrigin::Local, doc(&i.to_string(), "x"), None);
            assert_eq!(e.sequence, i as u64 + 1);
        }
        assert_eq!(stream.last_sequence(), 5);
    }

    #[test]
    fn test_replay_from_cursor() {
        let stream = ChangeStream::new("todos");
        for i in 0..10 {
            stream.append(ChangeKind::Insert, ChangeOrigin::Local, doc(&i.to_string(), "x"), None);
        }
        let replay = stream.since(7);
        assert_eq!(replay.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![8, 9, 10]);
        assert_eq!(stream.since(0).len(), 10);
        assert!(stream.since(10).is_empty());
        assert_eq!(stream.since_limited(2, 3).len(), 3);
    }

    #[test]
    fn test_compact_drops_read_events() {
        let stream = ChangeStream::new("todos");
        for i in 0..5 {
            stream.append(ChangeKind::Insert, ChangeOrigin::Local, doc(&i.to_string(), "x"), None);
        }
        assert_eq!(stream.compact(3), 3);
        assert_eq!(stream.since(0).iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(stream.since(4).len(), 1);

        // The newest event is never dropped
        assert_eq!(stream.compact(100), 1);
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.last_sequence(), 5);
        let next = stream.append(ChangeKind::Insert, ChangeOrigin::Local, doc("6", "x"), None);
        assert_eq!(next.sequence, 6);
    }

    #[tokio::test]
    async fn test_live_subscription_sees_new_events() {
        let stream = ChangeStream::new("todos");
        stream.append(ChangeKind::Insert, ChangeOrigin::Local, doc("old", "x"), None);

        let mut rx = stream.subscribe();
        stream.append(ChangeKind::Insert, ChangeOrigin::Remote, doc("new", "y"), None);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.sequence, 2);
        assert_eq!(event.origin, ChangeOrigin::Remote);
    }

    #[test]
    fn test_restore_rejects_gaps() {
        let stream = ChangeStream::new("todos");
        let mk = |seq| ChangeEvent {
            sequence: seq,
            collection: "todos".into(),
            kind: ChangeKind::Insert,
            origin: ChangeOrigin::Local,
            document: doc("a", "b"),
            previous: None,
        };
        assert!(stream.restore(vec![mk(1), mk(3)]).is_err());
        stream.restore(vec![mk(2), mk(1)]).unwrap();
        assert_eq!(stream.last_sequence(), 2);
        let next = stream.append(ChangeKind::Update, ChangeOrigin::Local, doc("a", "c"), None);
        assert_eq!(next.sequence, 3);
    }
}
