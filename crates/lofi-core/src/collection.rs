//! Collection - the document store of one schema
//!
//! Writes are serialized per collection by a writer lock; the document map
//! itself sits behind a read/write lock that writers only hold for the
//! instant of the swap, so readers always get a point-in-time snapshot
//! without waiting on validation or fan-out.
//!
//! Inside the writer lock every successful mutation:
//! 1. replaces the document snapshot,
//! 2. appends exactly one change event,
//! 3. dispatches the event to live queries.

use crate::changes::{ChangeEvent, ChangeKind, ChangeOrigin, ChangeStream};
use crate::conflict::{ConflictHandler, Resolution};
use crate::document::{now_ms, Document, DocumentId, Revision};
use crate::error::{Error, Result};
use crate::live::{CancelHandle, LiveEvent, LiveQuery, LiveQueryRegistry};
use crate::local::LocalDocuments;
use crate::schema::CollectionSchema;
use crate::selector::{Query, Selector};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Result of applying a remote document
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The remote version was written
    Applied(Arc<ChangeEvent>),
    /// The local copy already has this exact revision
    Unchanged,
    /// The conflict policy kept the local copy (returned)
    KeptLocal(Document),
}

/// A schema-bound collection of documents
pub struct Collection {
    schema: CollectionSchema,
    documents: RwLock<BTreeMap<String, Document>>,
    writer: Mutex<()>,
    changes: ChangeStream,
    live: Arc<LiveQueryRegistry>,
    locals: LocalDocuments,
    closed: Arc<AtomicBool>,
    opened_at: Instant,
}

impl Collection {
    pub(crate) fn new(schema: CollectionSchema, closed: Arc<AtomicBool>) -> Result<Self> {
        schema.check()?;
        let name = schema.name.clone();
        Ok(Self {
            changes: ChangeStream::new(name.clone()),
            locals: LocalDocuments::new(name),
            schema,
            documents: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(()),
            live: LiveQueryRegistry::new(),
            closed,
            opened_at: Instant::now(),
        })
    }

    /// Standalone collection, not attached to a database
    pub fn standalone(schema: CollectionSchema) -> Result<Self> {
        Self::new(schema, Arc::new(AtomicBool::new(false)))
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    pub fn changes(&self) -> &ChangeStream {
        &self.changes
    }

    /// Local documents namespaced to this collection
    pub fn locals(&self) -> &LocalDocuments {
        &self.locals
    }

    /// Time since this collection was opened in this process
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Swap in a new snapshot, append its event and fan it out.
    /// Must be called with the writer lock held.
    fn commit(
        &self,
        kind: ChangeKind,
        origin: ChangeOrigin,
        doc: Document,
        previous: Option<Document>,
    ) -> Arc<ChangeEvent> {
        self.documents
            .write()
            .insert(doc.id.as_str().to_string(), doc.clone());
        let event = self.changes.append(kind, origin, doc, previous);
        self.live.dispatch(&event);
        trace!(
            collection = %self.schema.name,
            sequence = event.sequence,
            id = %event.document.id,
            kind = ?kind,
            "Committed change"
        );
        event
    }

    fn check_expected(id: &DocumentId, current: Option<&Document>, expected: Option<&Revision>) -> Result<()> {
        match (expected, current) {
            (None, _) => Ok(()),
            (Some(exp), Some(cur)) if &cur.revision == exp => Ok(()),
            (Some(exp), cur) => Err(Error::Conflict {
                id: id.to_string(),
                expected: exp.to_string(),
                actual: cur.map_or_else(|| "<none>".to_string(), |c| c.revision.to_string()),
            }),
        }
    }

    /// Insert a new document; fails if a live document with the key exists.
    /// Inserting over a tombstone revives it.
    pub fn insert(&self, data: impl Into<Value>) -> Result<Document> {
        self.ensure_open()?;
        let data = data.into();
        let id = self.schema.validate(&data)?;

        let _guard = self.writer.lock();
        let current = self.get(id.as_str());
        if matches!(&current, Some(c) if !c.deleted) {
            return Err(Error::DocumentExists(id.to_string()));
        }
        let doc = Document::next_version(id, data, false, current.as_ref().map(|c| &c.revision));
        self.commit(ChangeKind::Insert, ChangeOrigin::Local, doc.clone(), current);
        Ok(doc)
    }

    /// Insert or update by primary key, assigning the next revision.
    ///
    /// When `expected` is given the write only succeeds if it is the stored
    /// revision.
    pub fn put(&self, data: impl Into<Value>, expected: Option<&Revision>) -> Result<Document> {
        self.ensure_open()?;
        let data = data.into();
        let id = self.schema.validate(&data)?;

        let _guard = self.writer.lock();
        let current = self.get(id.as_str());
        Self::check_expected(&id, current.as_ref(), expected)?;

        let kind = match &current {
            Some(c) if !c.deleted => ChangeKind::Update,
            _ => ChangeKind::Insert,
        };
        let doc = Document::next_version(id, data, false, current.as_ref().map(|c| &c.revision));
        self.commit(kind, ChangeOrigin::Local, doc.clone(), current);
        Ok(doc)
    }

    /// `put` without a revision check
    pub fn upsert(&self, data: impl Into<Value>) -> Result<Document> {
        self.put(data, None)
    }

    /// Merge top-level fields into a live document
    pub fn patch(&self, id: &str, changes: impl Into<Value>) -> Result<Document> {
        self.ensure_open()?;
        let changes = changes.into();
        let changes = changes.as_object().ok_or_else(|| {
            Error::validation(&self.schema.name, "patch must be an object")
        })?;

        let _guard = self.writer.lock();
        let current = match self.get(id) {
            Some(c) if !c.deleted => c,
            _ => return Err(Error::DocumentNotFound(id.to_string())),
        };

        let mut data = current.data.clone();
        if let Some(fields) = data.as_object_mut() {
            for (key, value) in changes {
                if *key == self.schema.primary_key && Some(value) != fields.get(key) {
                    return Err(Error::validation(&self.schema.name, "primary key is immutable"));
                }
                fields.insert(key.clone(), value.clone());
            }
        }
        self.schema.validate(&data)?;

        let doc = Document::next_version(current.id.clone(), data, false, Some(&current.revision));
        self.commit(ChangeKind::Update, ChangeOrigin::Local, doc.clone(), Some(current));
        Ok(doc)
    }

    /// Mark a document deleted. The tombstone keeps its data and history.
    pub fn soft_delete(&self, id: &str, expected: Option<&Revision>) -> Result<Document> {
        self.ensure_open()?;
        let _guard = self.writer.lock();
        let current = match self.get(id) {
            Some(c) if !c.deleted => c,
            _ => return Err(Error::DocumentNotFound(id.to_string())),
        };
        Self::check_expected(&current.id, Some(&current), expected)?;

        let doc = Document::next_version(
            current.id.clone(),
            current.data.clone(),
            true,
            Some(&current.revision),
        );
        self.commit(ChangeKind::Delete, ChangeOrigin::Local, doc.clone(), Some(current));
        Ok(doc)
    }

    /// Snapshot of a document, tombstones included
    pub fn get(&self, id: &str) -> Option<Document> {
        self.documents.read().get(id).cloned()
    }

    /// Snapshot of a live (non-deleted) document
    pub fn find_one(&self, id: &str) -> Option<Document> {
        self.get(id).filter(|d| !d.deleted)
    }

    /// Point-in-time result of a query
    pub fn find(&self, query: &Query) -> Vec<Document> {
        let mut matching: Vec<Document> = self
            .documents
            .read()
            .values()
            .filter(|d| !d.deleted && query.selector.matches(d))
            .cloned()
            .collect();

        if !query.sort.is_empty() {
            matching.sort_by_cached_key(|d| query.sort_key(d));
        }
        matching
            .into_iter()
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn count(&self, selector: &Selector) -> usize {
        self.documents
            .read()
            .values()
            .filter(|d| !d.deleted && selector.matches(d))
            .count()
    }

    /// Number of live documents
    pub fn len(&self) -> usize {
        self.count(&Selector::All)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored document, tombstones included
    pub fn all_documents(&self) -> Vec<Document> {
        self.documents.read().values().cloned().collect()
    }

    /// Patch every live document matching `selector`
    pub fn patch_where(&self, selector: &Selector, changes: impl Into<Value>) -> Result<Vec<Document>> {
        let changes = changes.into();
        let ids: Vec<String> = self
            .find(&Query::new(selector.clone()))
            .into_iter()
            .map(|d| d.id.as_str().to_string())
            .collect();
        ids.iter().map(|id| self.patch(id, changes.clone())).collect()
    }

    /// Soft-delete every live document matching `selector`
    pub fn remove_where(&self, selector: &Selector) -> Result<usize> {
        let ids: Vec<String> = self
            .find(&Query::new(selector.clone()))
            .into_iter()
            .map(|d| d.id.as_str().to_string())
            .collect();
        let mut removed = 0;
        for id in ids {
            match self.soft_delete(&id, None) {
                Ok(_) => removed += 1,
                // Deleted concurrently
                Err(Error::DocumentNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Write a document received from a replication remote, keeping its
    /// revision, if the conflict handler prefers it over the local copy.
    pub fn apply_remote(&self, remote: Document, handler: &dyn ConflictHandler) -> Result<ApplyOutcome> {
        self.ensure_open()?;
        if remote.deleted {
            let pk = remote.data.get_path(&self.schema.primary_key).and_then(Value::as_str);
            if pk.map_or(false, |pk| pk != remote.id.as_str()) {
                return Err(Error::validation(&self.schema.name, "tombstone key mismatch"));
            }
        } else {
            let id = self.schema.validate(&remote.data)?;
            if id != remote.id {
                return Err(Error::validation(
                    &self.schema.name,
                    format!("document id {} does not match primary key {}", remote.id, id),
                ));
            }
        }

        let _guard = self.writer.lock();
        let current = self.get(remote.id.as_str());
        if let Some(local) = &current {
            if local.revision == remote.revision {
                return Ok(ApplyOutcome::Unchanged);
            }
            if handler.resolve(local, &remote) == Resolution::KeepLocal {
                debug!(
                    collection = %self.schema.name,
                    id = %remote.id,
                    local = %local.revision,
                    remote = %remote.revision,
                    "Kept local version over remote"
                );
                return Ok(ApplyOutcome::KeptLocal(local.clone()));
            }
        }

        let kind = match (&current, remote.deleted) {
            (_, true) => ChangeKind::Delete,
            (Some(c), false) if !c.deleted => ChangeKind::Update,
            _ => ChangeKind::Insert,
        };
        let event = self.commit(kind, ChangeOrigin::Remote, remote, current);
        Ok(ApplyOutcome::Applied(event))
    }

    /// Re-issue the current local version on top of a remote `master`, so the
    /// next push carries `master` as its assumed state.
    pub fn rebase_on(&self, master: &Document) -> Result<Document> {
        self.ensure_open()?;
        let _guard = self.writer.lock();
        let current = self
            .get(master.id.as_str())
            .ok_or_else(|| Error::DocumentNotFound(master.id.to_string()))?;

        let base = std::cmp::max(&current.revision, &master.revision);
        let doc = Document::next_version(
            current.id.clone(),
            current.data.clone(),
            current.deleted,
            Some(base),
        );
        let kind = if doc.deleted { ChangeKind::Delete } else { ChangeKind::Update };
        self.commit(kind, ChangeOrigin::Local, doc.clone(), Some(master.clone()));
        Ok(doc)
    }

    /// Subscribe to a live result set
    pub fn subscribe(&self, query: Query) -> LiveQuery {
        // Holding the writer lock pins the snapshot to the current sequence
        let _guard = self.writer.lock();
        let matching: Vec<Document> = self
            .documents
            .read()
            .values()
            .filter(|d| !d.deleted && query.selector.matches(d))
            .cloned()
            .collect();
        let sequence = self.changes.last_sequence();
        self.live.register(query, matching, sequence)
    }

    /// Subscribe with a callback driven on a background task.
    /// Must be called inside a tokio runtime.
    pub fn subscribe_fn<F>(&self, query: Query, callback: F) -> CancelHandle
    where
        F: FnMut(&LiveEvent, &[Document]) + Send + 'static,
    {
        self.subscribe(query).for_each(callback)
    }

    /// Number of active live queries
    pub fn live_query_count(&self) -> usize {
        self.live.len()
    }

    /// Permanently drop tombstones deleted at least `min_age` ago.
    /// Returns the purged keys.
    pub fn cleanup(&self, min_age: Duration) -> Vec<DocumentId> {
        let _guard = self.writer.lock();
        let cutoff = now_ms().saturating_sub(min_age.as_millis() as u64);
        let mut purged = Vec::new();
        self.documents.write().retain(|_, doc| {
            let expired = doc.deleted && doc.updated_at <= cutoff;
            if expired {
                purged.push(doc.id.clone());
            }
            !expired
        });
        if !purged.is_empty() {
            info!(collection = %self.schema.name, purged = purged.len(), "Purged tombstones");
        }
        purged
    }

    /// Load persisted state into an empty collection
    pub fn restore(&self, documents: Vec<Document>, events: Vec<ChangeEvent>) -> Result<()> {
        let _guard = self.writer.lock();
        if !self.changes.is_empty() || !self.documents.read().is_empty() {
            return Err(Error::CollectionExists(format!(
                "{} already holds data, refusing to restore",
                self.schema.name
            )));
        }
        self.changes.restore(events)?;
        let mut map = self.documents.write();
        for doc in documents {
            map.insert(doc.id.as_str().to_string(), doc);
        }
        debug!(
            collection = %self.schema.name,
            documents = map.len(),
            sequence = self.changes.last_sequence(),
            "Restored collection"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.schema.name)
            .field("documents", &self.documents.read().len())
            .field("sequence", &self.changes.last_sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::LastWriteWins;
    use crate::live::ResultChange;
    use crate::schema::FieldDescriptor;
    use crate::selector::SortOrder;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn people() -> Collection {
        Collection::standalone(
            CollectionSchema::new("people")
                .field(FieldDescriptor::string("id").required())
                .field(FieldDescriptor::string("name").required())
                .field(FieldDescriptor::integer("age")),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_get_and_duplicate() {
        let c = people();
        let doc = c.insert(json!({"id": "1", "name": "a"})).unwrap();
        assert_eq!(doc.revision.height(), 1);
        assert_eq!(c.get("1").unwrap(), doc);
        assert!(matches!(
            c.insert(json!({"id": "1", "name": "b"})),
            Err(Error::DocumentExists(_))
        ));
    }

    #[test]
    fn test_put_rejects_stale_revision() {
        let c = people();
        let v1 = c.insert(json!({"id": "1", "name": "a"})).unwrap();
        let v2 = c.put(json!({"id": "1", "name": "b"}), Some(&v1.revision)).unwrap();
        assert!(v2.revision > v1.revision);

        let err = c.put(json!({"id": "1", "name": "c"}), Some(&v1.revision)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(c.get("1").unwrap().get("name"), Some(&Value::from("b")));
        assert_eq!(c.changes().last_sequence(), 2);
    }

    #[test]
    fn test_validation_happens_before_change_stream() {
        let c = people();
        assert!(c.insert(json!({"id": "1"})).is_err());
        assert!(c.insert(json!({"id": "x".repeat(101), "name": "a"})).is_err());
        assert!(c.insert(json!({"id": "1", "name": "a", "age": "old"})).is_err());
        assert_eq!(c.changes().last_sequence(), 0);
        assert!(c.get("1").is_none());
    }

    #[test]
    fn test_soft_delete_leaves_tombstone() {
        let c = people();
        c.insert(json!({"id": "1", "name": "a"})).unwrap();
        let tomb = c.soft_delete("1", None).unwrap();
        assert!(tomb.deleted);

        let got = c.get("1").unwrap();
        assert!(got.is_deleted());
        assert!(c.find_one("1").is_none());
        assert!(c.find(&Query::all()).is_empty());
        assert!(matches!(c.soft_delete("1", None), Err(Error::DocumentNotFound(_))));

        // Re-inserting revives the document on top of the tombstone
        let revived = c.insert(json!({"id": "1", "name": "again"})).unwrap();
        assert!(revived.revision > tomb.revision);
    }

    #[test]
    fn test_patch_merges_and_protects_primary_key() {
        let c = people();
        c.insert(json!({"id": "1", "name": "a", "age": 3})).unwrap();
        let patched = c.patch("1", json!({"name": "b"})).unwrap();
        assert_eq!(patched.get("name"), Some(&Value::from("b")));
        assert_eq!(patched.get("age"), Some(&Value::from(3i64)));

        assert!(c.patch("1", json!({"id": "2"})).is_err());
        assert!(matches!(c.patch("9", json!({"name": "x"})), Err(Error::DocumentNotFound(_))));
    }

    #[test]
    fn test_find_sort_and_window() {
        let c = people();
        for (id, age) in [("a", 30), ("b", 10), ("c", 20), ("d", 40)] {
            c.insert(json!({"id": id, "name": id, "age": age})).unwrap();
        }
        let query = Query::new(Selector::Gte("age".into(), Value::from(15i64)))
            .sort_by("age", SortOrder::Desc)
            .skip(1)
            .limit(2);
        let ids: Vec<String> = c.find(&query).iter().map(|d| d.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(c.count(&Selector::All), 4);
    }

    #[test]
    fn test_bulk_patch_and_remove() {
        let c = people();
        for id in ["1", "2", "3"] {
            c.insert(json!({"id": id, "name": "x"})).unwrap();
        }
        let patched = c.patch_where(&Selector::eq("name", "x"), json!({"name": "y"})).unwrap();
        assert_eq!(patched.len(), 3);
        assert_eq!(c.remove_where(&Selector::eq("id", "2")).unwrap(), 1);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_apply_remote_is_idempotent_and_lww() {
        let source = people();
        let replica = people();
        let v1 = source.insert(json!({"id": "1", "name": "a"})).unwrap();
        let v2 = source.patch("1", json!({"name": "b"})).unwrap();

        assert!(matches!(replica.apply_remote(v2.clone(), &LastWriteWins).unwrap(), ApplyOutcome::Applied(_)));
        assert_eq!(replica.apply_remote(v2.clone(), &LastWriteWins).unwrap(), ApplyOutcome::Unchanged);
        // An older revision arriving late does not win
        assert!(matches!(replica.apply_remote(v1, &LastWriteWins).unwrap(), ApplyOutcome::KeptLocal(_)));

        assert_eq!(replica.get("1").unwrap(), v2);
        assert_eq!(replica.changes().last_sequence(), 1);
        assert_eq!(replica.changes().since(0)[0].origin, ChangeOrigin::Remote);
    }

    #[test]
    fn test_replicas_converge_in_any_order() {
        let a = people();
        let b = people();
        let base = a.insert(json!({"id": "1", "name": "base"})).unwrap();
        b.apply_remote(base, &LastWriteWins).unwrap();

        let from_a = a.patch("1", json!({"name": "from-a"})).unwrap();
        let from_b = b.patch("1", json!({"name": "from-b"})).unwrap();

        a.apply_remote(from_b, &LastWriteWins).unwrap();
        b.apply_remote(from_a, &LastWriteWins).unwrap();

        assert_eq!(a.get("1").unwrap().revision, b.get("1").unwrap().revision);
        assert_eq!(a.get("1").unwrap().data, b.get("1").unwrap().data);
    }

    #[test]
    fn test_rebase_on_master() {
        let c = people();
        let local = c.insert(json!({"id": "1", "name": "mine"})).unwrap();
        let master = {
            let other = people();
            other.insert(json!({"id": "1", "name": "x"})).unwrap();
            other.patch("1", json!({"name": "theirs"})).unwrap()
        };
        let rebased = c.rebase_on(&master).unwrap();
        assert!(rebased.revision > master.revision);
        assert!(rebased.revision > local.revision);
        assert_eq!(rebased.get("name"), Some(&Value::from("mine")));

        let event = c.changes().since(1).pop().unwrap();
        assert_eq!(event.previous.as_ref().unwrap().revision, master.revision);
    }

    #[tokio::test]
    async fn test_subscription_example() {
        let c = people();
        let mut live = c.subscribe(Query::all());
        assert_eq!(live.next().await.unwrap(), LiveEvent::Initial { sequence: 0, documents: vec![] });

        c.insert(json!({"id": "1", "name": "a"})).unwrap();
        match live.next().await.unwrap() {
            LiveEvent::Delta { sequence, changes } => {
                assert_eq!(sequence, 1);
                assert!(matches!(&changes[..], [ResultChange::Added(d)] if d.get("name") == Some(&Value::from("a"))));
            }
            other => panic!("unexpected {:?}", other),
        }

        c.patch("1", json!({"name": "b"})).unwrap();
        match live.next().await.unwrap() {
            LiveEvent::Delta { changes, .. } => {
                assert!(matches!(&changes[..], [ResultChange::Updated(d)] if d.get("name") == Some(&Value::from("b"))));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(live.results().len(), 1);

        c.soft_delete("1", None).unwrap();
        match live.next().await.unwrap() {
            LiveEvent::Delta { changes, .. } => {
                assert!(matches!(&changes[..], [ResultChange::Removed(d)] if d.id.as_str() == "1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(live.results().is_empty());
        assert!(c.get("1").unwrap().deleted);
    }

    #[tokio::test]
    async fn test_live_results_match_find_at_every_sequence() {
        let c = people();
        let query = Query::new(Selector::Gte("age".into(), Value::from(18i64)))
            .sort_by("age", SortOrder::Asc)
            .limit(3);
        let mut live = c.subscribe(query.clone());
        live.next().await.unwrap();

        let ops: Vec<Box<dyn Fn(&Collection)>> = vec![
            Box::new(|c: &Collection| { c.insert(json!({"id": "a", "name": "a", "age": 20})).unwrap(); }),
            Box::new(|c: &Collection| { c.insert(json!({"id": "b", "name": "b", "age": 15})).unwrap(); }),
            Box::new(|c: &Collection| { c.insert(json!({"id": "c", "name": "c", "age": 30})).unwrap(); }),
            Box::new(|c: &Collection| { c.insert(json!({"id": "d", "name": "d", "age": 25})).unwrap(); }),
            Box::new(|c: &Collection| { c.patch("b", json!({"age": 19})).unwrap(); }),
            Box::new(|c: &Collection| { c.soft_delete("a", None).unwrap(); }),
            Box::new(|c: &Collection| { c.patch("c", json!({"age": 1})).unwrap(); }),
            Box::new(|c: &Collection| { c.insert(json!({"id": "e", "name": "e", "age": 18})).unwrap(); }),
        ];

        for op in ops {
            op(&c);
            // Changes outside the window may produce no delta
            while let Some(_event) = live.try_next() {}
            assert_eq!(live.results(), c.find(&query).as_slice());
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_discards_queued_events() {
        let c = people();
        let mut live = c.subscribe(Query::all());
        let cancel = live.cancel_handle();
        live.next().await.unwrap();

        c.insert(json!({"id": "1", "name": "a"})).unwrap();
        c.insert(json!({"id": "2", "name": "b"})).unwrap();
        assert_eq!(c.live_query_count(), 1);

        cancel.cancel();
        assert_eq!(c.live_query_count(), 0);
        assert!(live.next().await.is_none());

        c.insert(json!({"id": "3", "name": "c"})).unwrap();
        assert!(live.try_next().is_none());
    }

    #[tokio::test]
    async fn test_dropping_live_query_releases_subscriber() {
        let c = people();
        {
            let _live = c.subscribe(Query::all());
            assert_eq!(c.live_query_count(), 1);
        }
        assert_eq!(c.live_query_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_isolated() {
        let c = Arc::new(people());
        let seen = Arc::new(AtomicUsize::new(0));

        let bad = c.subscribe_fn(Query::all(), |event, _| {
            if matches!(event, LiveEvent::Delta { .. }) {
                panic!("subscriber bug");
            }
        });
        let counter = seen.clone();
        let good = c.subscribe(Query::all()).for_each(move |_, results| {
            counter.store(results.len(), Ordering::SeqCst);
        });

        c.insert(json!({"id": "1", "name": "a"})).unwrap();
        c.insert(json!({"id": "2", "name": "b"})).unwrap();

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 2 && bad.is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(bad.is_cancelled());
        assert!(!good.is_cancelled());
    }

    #[test]
    fn test_cleanup_purges_old_tombstones_only() {
        let c = people();
        c.insert(json!({"id": "1", "name": "a"})).unwrap();
        c.insert(json!({"id": "2", "name": "b"})).unwrap();
        c.soft_delete("1", None).unwrap();

        assert!(c.cleanup(Duration::from_secs(3600)).is_empty());
        let purged = c.cleanup(Duration::ZERO);
        assert_eq!(purged, vec![DocumentId::new("1").unwrap()]);
        assert!(c.get("1").is_none());
        assert!(c.get("2").is_some());
    }

    #[test]
    fn test_closed_collection_rejects_writes() {
        let closed = Arc::new(AtomicBool::new(false));
        let c = Collection::new(CollectionSchema::new("x"), closed.clone()).unwrap();
        closed.store(true, Ordering::SeqCst);
        assert!(matches!(c.insert(json!({"id": "1"})), Err(Error::Closed)));
    }
}
