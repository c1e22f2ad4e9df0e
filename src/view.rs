//! Multi-key secondary index over a document store.
//!
//! An index function maps each document to any number of `(key, value)`
//! rows. For clean reindexing the view keeps, per document, a reverse
//! row listing every encoded key it last emitted; updating a document
//! costs one reverse-row read plus O(emits) writes.
//!
//! Views are lazy: every query first drains the source's change feed
//! from the last recorded sequence id. The `{revision, seq}` state
//! record lives in the keyspace metadata; bumping the configured
//! revision truncates and rebuilds the view.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;
use crate::db::{ClassId, Db, FLUSH_THRESHOLD, KeySpaceId, Observable, ObserverHandle, make_key};
use crate::docstore::{DocStore, Document};
use crate::error::{Result, SepalError};
use crate::incremental::SeqId;
use crate::kv::{IterRange, SnapshotMode, WriteBatch};

/// Index callback: emit any number of rows for a document.
pub type IndexFn = Box<dyn Fn(&Document, &mut Emit<'_>) + Send + Sync>;

/// Persisted state of a lazily updated component.
#[derive(Debug, Serialize, Deserialize, Default)]
struct UpdatableState {
    revision: u64,
    seq: SeqId,
}

/// Shared plumbing of every lazily updated derived component: the
/// keyspace, its soft lock, the configured revision and the last
/// sequence id drained from the source.
pub(crate) struct UpdatableCore {
    db: Db,
    kid: KeySpaceId,
    revision: u64,
    last_seq: AtomicU64,
    update_lock: Mutex<()>,
}

impl UpdatableCore {
    /// Allocate and soft-lock the keyspace, then resume from the stored
    /// state. A revision mismatch truncates the keyspace and restarts
    /// from sequence 0.
    pub(crate) fn open(db: &Db, class: ClassId, name: &str, revision: u64) -> Result<UpdatableCore> {
        let kid = db.alloc_keyspace_raw(class, name)?;
        if !db.keyspace_lock(kid, true) {
            return Err(SepalError::KeyspaceLocked(kid));
        }
        let mut seq = 0;
        match db.keyspace_metadata(kid)? {
            Some(meta) => {
                let state: UpdatableState =
                    serde_json::from_value(meta).unwrap_or_default();
                if state.revision == revision {
                    seq = state.seq;
                } else {
                    log::debug!("keyspace {kid} ({name:?}) revision changed, rebuilding");
                    db.clear_keyspace(kid)?;
                }
            }
            None => {}
        }
        Ok(UpdatableCore {
            db: db.clone(),
            kid,
            revision,
            last_seq: AtomicU64::new(seq),
            update_lock: Mutex::new(()),
        })
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn kid(&self) -> KeySpaceId {
        self.kid
    }

    pub(crate) fn last_seq(&self) -> SeqId {
        self.last_seq.load(Ordering::SeqCst)
    }

    pub(crate) fn store_state(&self, batch: &mut WriteBatch, seq: SeqId) -> Result<()> {
        let state = UpdatableState { revision: self.revision, seq };
        let meta = serde_json::to_value(&state)
            .map_err(|e| SepalError::decode(format!("state record: {e}")))?;
        self.db.put_keyspace_metadata_batch(batch, self.kid, &meta);
        Ok(())
    }

    /// Drain the source's change feed through `index_one`, flushing the
    /// batch in bounded chunks and persisting the new state at the end.
    pub(crate) fn update_with(
        &self,
        source: &DocStore,
        mut index_one: impl FnMut(&mut WriteBatch, &Document) -> Result<()>,
    ) -> Result<()> {
        let _guard = self.update_lock.lock();
        let mut last = self.last_seq();
        if last >= source.seq() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for change in source.scan_changes(last)? {
            let change = change?;
            index_one(&mut batch, &change.to_document())?;
            last = change.seq;
            if batch.approximate_size() > FLUSH_THRESHOLD {
                self.db.commit_batch(&mut batch)?;
            }
        }
        self.store_state(&mut batch, last)?;
        self.db.commit_batch(&mut batch)?;
        self.last_seq.store(last, Ordering::SeqCst);
        Ok(())
    }

    /// Forget everything and reindex from sequence 0.
    pub(crate) fn reset(&self) -> Result<()> {
        let _guard = self.update_lock.lock();
        self.db.clear_keyspace(self.kid)?;
        self.last_seq.store(0, Ordering::SeqCst);
        let mut batch = WriteBatch::new();
        self.store_state(&mut batch, 0)?;
        self.db.commit_batch(&mut batch)
    }
}

impl Drop for UpdatableCore {
    fn drop(&mut self) {
        self.db.keyspace_lock(self.kid, false);
    }
}

/// Collects rows emitted for one document.
pub struct Emit<'a> {
    kid: KeySpaceId,
    doc_id: &'a str,
    batch: &'a mut WriteBatch,
    /// Reverse-row payload being built: length-prefixed encoded keys.
    reverse: Vec<u8>,
    keys: Vec<Value>,
}

impl Emit<'_> {
    /// Add one `(key, value)` row for the current document.
    pub fn emit(&mut self, key: &Value, value: &Value) {
        let mut enc = Vec::new();
        codec::encode_key(key, &mut enc);

        let mut row = Vec::with_capacity(1 + enc.len() + 1 + self.doc_id.len());
        row.push(self.kid);
        row.extend_from_slice(&enc);
        codec::append_doc_id(&mut row, self.doc_id);
        let mut val = Vec::new();
        codec::encode_value(value, &mut val);
        self.batch.put(row, val);

        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, enc.len() as u32);
        self.reverse.extend_from_slice(&len);
        self.reverse.extend_from_slice(&enc);
        self.keys.push(key.clone());
    }
}

fn parse_reverse_row(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut segments = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        if pos + 4 > payload.len() {
            return Err(SepalError::decode("truncated reverse row"));
        }
        let len = BigEndian::read_u32(&payload[pos..pos + 4]) as usize;
        pos += 4;
        if pos + len > payload.len() {
            return Err(SepalError::decode("truncated reverse row segment"));
        }
        segments.push(payload[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(segments)
}

/// A multi-key index kept up to date from a document store.
pub struct View {
    core: UpdatableCore,
    source: Arc<DocStore>,
    index_fn: IndexFn,
    observers: Arc<Observable<Vec<Value>>>,
}

/// One result row of a view query.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    pub key: Value,
    pub doc_id: String,
    pub value: Value,
}

impl View {
    /// Open (or create) a view. `revision` identifies the index
    /// function's version: changing the function must come with a new
    /// revision so stale rows are rebuilt.
    pub fn new(
        db: &Db,
        name: &str,
        revision: u64,
        source: Arc<DocStore>,
        index_fn: IndexFn,
    ) -> Result<View> {
        let core = UpdatableCore::open(db, crate::db::KeySpaceClass::View.id(), name, revision)?;
        let observers = db.observable::<Vec<Value>>(core.kid());
        Ok(View { core, source, index_fn, observers })
    }

    pub fn db(&self) -> &Db {
        self.core.db()
    }

    fn reverse_key(&self, doc_id: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(2 + doc_id.len());
        k.push(self.core.kid());
        k.push(0);
        k.extend_from_slice(doc_id.as_bytes());
        k
    }

    /// Reindex one document inside `batch`: drop the rows listed in the
    /// reverse row, re-run the index function, rewrite the reverse row
    /// and broadcast the union of affected keys.
    fn index_doc(&self, batch: &mut WriteBatch, doc: &Document) -> Result<()> {
        let kid = self.core.kid();
        let reverse_key = self.reverse_key(&doc.id);

        let previous = self.core.db().get(&reverse_key)?;
        let mut affected: Vec<Value> = Vec::new();
        let had_previous = previous.is_some();
        if let Some(payload) = &previous {
            for segment in parse_reverse_row(payload)? {
                let mut row = make_key(kid, &segment);
                codec::append_doc_id(&mut row, &doc.id);
                batch.delete(row);
                let (key, _) = codec::decode_key(&segment)?;
                affected.push(key);
            }
        }

        let mut emitted = false;
        if !doc.deleted {
            let mut emit = Emit {
                kid,
                doc_id: &doc.id,
                batch: &mut *batch,
                reverse: Vec::new(),
                keys: Vec::new(),
            };
            (self.index_fn)(doc, &mut emit);
            emitted = !emit.keys.is_empty();
            let reverse = emit.reverse;
            let mut keys = emit.keys;
            if emitted {
                batch.put(reverse_key.clone(), reverse);
            }
            affected.append(&mut keys);
        }
        if !emitted && had_previous {
            batch.delete(reverse_key);
        }

        if !self.observers.is_empty() && !affected.is_empty() {
            affected.dedup();
            self.observers.broadcast(batch, &affected);
        }
        Ok(())
    }

    /// Bring the view up to date with its source.
    pub fn update(&self) -> Result<()> {
        self.core.update_with(&self.source, |batch, doc| self.index_doc(batch, doc))
    }

    /// Drop all rows and reindex the whole source.
    pub fn rebuild(&self) -> Result<()> {
        self.core.reset()?;
        self.update()
    }

    /// Remove a purged document's rows. Purges are not part of the
    /// change feed, so the caller propagates them explicitly.
    pub fn purge_doc(&self, doc_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        let doc = Document { id: doc_id.to_string(), deleted: true, ..Document::default() };
        self.index_doc(&mut batch, &doc)?;
        self.core.db().commit_batch(&mut batch)
    }

    // ── queries ─────────────────────────────────────────────────────

    fn snapshot_iter(&self, range: IterRange) -> Result<ViewIterator> {
        let snap = self.core.db().snapshot(SnapshotMode::WriteError);
        Ok(ViewIterator { raw: snap.iter(range)?, filter: None })
    }

    /// Encoded key with the keyspace byte, before any doc-id part.
    fn key_base(&self, key: &Value) -> Vec<u8> {
        let mut base = vec![self.core.kid()];
        codec::encode_key(key, &mut base);
        base
    }

    /// Bounds that cover exactly the rows of one key: every row carries
    /// the `DOC` tag between the encoded key and the doc id, so
    /// `base 0x40 ..= base 0x41` is precise even for array keys.
    fn exact_bounds(&self, key: &Value) -> (Vec<u8>, Vec<u8>) {
        let base = self.key_base(key);
        let mut begin = base.clone();
        begin.push(codec::tag::DOC);
        let mut end = base;
        end.push(codec::tag::DOC + 1);
        (begin, end)
    }

    /// All rows with exactly this key, in doc-id order.
    pub fn find(&self, key: &Value) -> Result<ViewIterator> {
        self.find_dir(key, false)
    }

    /// All rows with exactly this key, choosing the direction.
    pub fn find_dir(&self, key: &Value, backward: bool) -> Result<ViewIterator> {
        self.update()?;
        let (begin, end) = self.exact_bounds(key);
        let range = if backward {
            IterRange::new(end, begin).exclude_begin()
        } else {
            IterRange::new(begin, end).exclude_end()
        };
        self.snapshot_iter(range)
    }

    /// Rows for `key` starting after `from_doc` (exclusive), for paging.
    pub fn find_from(&self, key: &Value, from_doc: &str, backward: bool) -> Result<ViewIterator> {
        self.update()?;
        let (begin, end) = self.exact_bounds(key);
        let mut start = self.key_base(key);
        codec::append_doc_id(&mut start, from_doc);
        let range = if backward {
            IterRange::new(start, begin).exclude_begin()
        } else {
            IterRange::new(start, end).exclude_begin().exclude_end()
        };
        self.snapshot_iter(range)
    }

    /// Rows between two keys. Backward when `from > to` in key order;
    /// the greater endpoint is the upper bound and `include_upper`
    /// governs its inclusion.
    pub fn range(&self, from: &Value, to: &Value, include_upper: bool) -> Result<ViewIterator> {
        self.update()?;
        let from_base = self.key_base(from);
        let to_base = self.key_base(to);
        let backward = from_base > to_base;
        let past_rows = |mut base: Vec<u8>| {
            base.push(codec::tag::DOC + 1);
            base
        };
        let at_rows = |mut base: Vec<u8>| {
            base.push(codec::tag::DOC);
            base
        };
        let range = if backward {
            let begin = if include_upper { past_rows(from_base) } else { at_rows(from_base) };
            IterRange::new(begin, to_base).exclude_begin()
        } else {
            let end = if include_upper { past_rows(to_base) } else { to_base };
            IterRange::new(from_base, end).exclude_end()
        };
        self.snapshot_iter(range)
    }

    /// Rows whose key extends `key` (string prefixes and array prefixes).
    pub fn prefix(&self, key: &Value) -> Result<ViewIterator> {
        self.prefix_dir(key, false)
    }

    /// Prefix scan, choosing the direction.
    pub fn prefix_dir(&self, key: &Value, backward: bool) -> Result<ViewIterator> {
        self.update()?;
        let mut begin = vec![self.core.kid()];
        codec::encode_key_prefix(key, &mut begin);
        let mut end = begin.clone();
        codec::upper_bound(&mut end);
        let range = if backward {
            IterRange::new(end, begin).exclude_begin()
        } else {
            IterRange::new(begin, end).exclude_end()
        };
        self.snapshot_iter(range)
    }

    /// Every row of the view.
    pub fn scan(&self, backward: bool) -> Result<ViewIterator> {
        self.update()?;
        let kid = self.core.kid();
        // skip the reverse rows, which sort below every encoded key
        let begin = vec![kid, 1];
        let end = vec![kid + 1];
        let range = if backward {
            IterRange::new(end, begin).exclude_begin()
        } else {
            IterRange::new(begin, end).exclude_end()
        };
        self.snapshot_iter(range)
    }

    /// Scan starting at `(from_key, from_doc)`, the row itself excluded.
    pub fn scan_from(&self, from_key: &Value, from_doc: &str, backward: bool) -> Result<ViewIterator> {
        self.update()?;
        let kid = self.core.kid();
        let mut start = vec![kid];
        codec::encode_key(from_key, &mut start);
        codec::append_doc_id(&mut start, from_doc);
        let range = if backward {
            IterRange::new(start, vec![kid, 1]).exclude_begin()
        } else {
            IterRange::new(start, vec![kid + 1]).exclude_begin().exclude_end()
        };
        self.snapshot_iter(range)
    }

    /// Value of an arbitrary row matching `key`, or `None`.
    pub fn lookup(&self, key: &Value) -> Result<Option<Value>> {
        let mut iter = self.find(key)?;
        match iter.next() {
            Some(row) => Ok(Some(row?.value)),
            None => Ok(None),
        }
    }

    // ── per-document bookkeeping ────────────────────────────────────

    /// The keys this view last emitted for a document.
    pub fn doc_keys(&self, doc_id: &str) -> Result<Vec<Value>> {
        self.update()?;
        match self.core.db().get(&self.reverse_key(doc_id))? {
            Some(payload) => parse_reverse_row(&payload)?
                .iter()
                .map(|seg| codec::decode_key(seg).map(|(v, _)| v))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Whether the document currently has rows in this view.
    pub fn contains_doc(&self, doc_id: &str) -> Result<bool> {
        self.update()?;
        Ok(self.core.db().get(&self.reverse_key(doc_id))?.is_some())
    }

    // ── observers ───────────────────────────────────────────────────

    /// Observe the set of user keys affected by each indexed document.
    /// Runs inside the view's update batch; return `false` to
    /// unsubscribe.
    pub fn add_key_observer(
        &self,
        f: impl FnMut(&mut WriteBatch, &Vec<Value>) -> bool + Send + 'static,
    ) -> ObserverHandle {
        self.observers.add(f)
    }

    pub fn remove_key_observer(&self, h: ObserverHandle) {
        self.observers.remove(h);
    }

    /// Approximate byte size of the view's keyspace.
    pub fn approximate_size(&self) -> Result<u64> {
        self.core.db().keyspace_size(self.core.kid())
    }
}

type ViewRowFilter = Box<dyn FnMut(&ViewRow) -> bool + Send>;

/// Iterator over view rows.
pub struct ViewIterator {
    raw: crate::db::RawIterator,
    filter: Option<ViewRowFilter>,
}

impl ViewIterator {
    /// Keep only rows the predicate accepts.
    pub fn with_filter(mut self, f: impl FnMut(&ViewRow) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(f));
        self
    }

    fn parse(key: &[u8], value: &[u8]) -> Result<ViewRow> {
        let (user_key, doc_id) = codec::split_doc_key(&key[1..])?;
        Ok(ViewRow { key: user_key, doc_id: doc_id.to_string(), value: codec::decode_value(value)? })
    }
}

impl Iterator for ViewIterator {
    type Item = Result<ViewRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = self.raw.next()?;
            match Self::parse(&key, &value) {
                Ok(row) => {
                    if let Some(f) = &mut self.filter {
                        if !f(&row) {
                            continue;
                        }
                    }
                    return Some(Ok(row));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::DocStoreConfig;
    use serde_json::json;

    fn setup() -> (Db, Arc<DocStore>, View) {
        let db = Db::in_memory();
        let store = Arc::new(DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap());
        let view = View::new(
            &db,
            "by-tag",
            1,
            store.clone(),
            Box::new(|doc, emit| {
                if let Some(content) = &doc.content {
                    if let Some(tag) = content.get("tag") {
                        emit.emit(tag, &json!(doc.id));
                    }
                }
            }),
        )
        .unwrap();
        (db, store, view)
    }

    fn rows(iter: ViewIterator) -> Vec<(Value, String)> {
        iter.map(|r| {
            let r = r.unwrap();
            (r.key, r.doc_id)
        })
        .collect()
    }

    #[test]
    fn test_reindex_on_update_and_delete() {
        let (_db, store, view) = setup();
        let mut doc = Document::new("d1", json!({"tag": "X"}));
        assert!(store.put_update(&mut doc).unwrap());
        assert_eq!(rows(view.find(&json!("X")).unwrap()), vec![(json!("X"), "d1".to_string())]);

        doc.content = Some(json!({"tag": "Y"}));
        assert!(store.put_update(&mut doc).unwrap());
        assert!(rows(view.find(&json!("X")).unwrap()).is_empty());
        assert_eq!(rows(view.find(&json!("Y")).unwrap()), vec![(json!("Y"), "d1".to_string())]);

        assert!(store.erase("d1", doc.rev).unwrap());
        assert!(rows(view.find(&json!("X")).unwrap()).is_empty());
        assert!(rows(view.find(&json!("Y")).unwrap()).is_empty());
        assert!(!view.contains_doc("d1").unwrap());
    }

    #[test]
    fn test_reverse_row_matches_forward_rows() {
        let db = Db::in_memory();
        let store = Arc::new(DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap());
        let view = View::new(
            &db,
            "multi",
            1,
            store.clone(),
            Box::new(|doc, emit| {
                if let Some(tags) = doc.content.as_ref().and_then(|c| c.get("tags")).and_then(Value::as_array) {
                    for tag in tags {
                        emit.emit(tag, &json!(1));
                    }
                }
            }),
        )
        .unwrap();

        let mut doc = Document::new("d", json!({"tags": ["a", "b", "c"]}));
        assert!(store.put_update(&mut doc).unwrap());
        assert_eq!(view.doc_keys("d").unwrap(), vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(rows(view.scan(false).unwrap()).len(), 3);

        doc.content = Some(json!({"tags": ["b"]}));
        assert!(store.put_update(&mut doc).unwrap());
        assert_eq!(view.doc_keys("d").unwrap(), vec![json!("b")]);
        let all = rows(view.scan(false).unwrap());
        assert_eq!(all, vec![(json!("b"), "d".to_string())]);
    }

    #[test]
    fn test_multiple_docs_same_key() {
        let (_db, store, view) = setup();
        for id in ["a", "b", "c"] {
            assert!(store.put(&Document::new(id, json!({"tag": "T"}))).unwrap());
        }
        let found = rows(view.find(&json!("T")).unwrap());
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].1, "a");
        assert_eq!(found[2].1, "c");

        let paged = rows(view.find_from(&json!("T"), "a", false).unwrap());
        assert_eq!(paged.iter().map(|(_, d)| d.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
        let back = rows(view.find_dir(&json!("T"), true).unwrap());
        assert_eq!(back[0].1, "c");
    }

    #[test]
    fn test_range_prefix_and_scan() {
        let db = Db::in_memory();
        let store = Arc::new(DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap());
        let view = View::new(
            &db,
            "by-num",
            1,
            store.clone(),
            Box::new(|doc, emit| {
                if let Some(c) = &doc.content {
                    emit.emit(&c["k"], &c["v"]);
                }
            }),
        )
        .unwrap();
        for (id, k) in [("a", json!(1)), ("b", json!(2)), ("c", json!(3)), ("d", json!(-1))] {
            assert!(store.put(&Document::new(id, json!({"k": k, "v": 0}))).unwrap());
        }

        let keys: Vec<Value> = view.scan(false).unwrap().map(|r| r.unwrap().key).collect();
        assert_eq!(keys, vec![json!(-1), json!(1), json!(2), json!(3)]);

        let r = rows(view.range(&json!(1), &json!(3), false).unwrap());
        assert_eq!(r.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), vec![json!(1), json!(2)]);
        let r = rows(view.range(&json!(3), &json!(1), true).unwrap());
        assert_eq!(r.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), vec![json!(3), json!(2), json!(1)]);

        let view2 = View::new(
            &db,
            "by-str",
            1,
            store.clone(),
            Box::new(|doc, emit| {
                emit.emit(&json!(doc.id), &json!(0));
            }),
        )
        .unwrap();
        let p = rows(view2.prefix(&json!("a")).unwrap());
        assert_eq!(p.len(), 1);
        let all = rows(view2.scan(true).unwrap());
        assert_eq!(all.first().map(|(k, _)| k.clone()), Some(json!("d")));
    }

    #[test]
    fn test_revision_bump_truncates() {
        let (db, store, view) = setup();
        assert!(store.put(&Document::new("d", json!({"tag": "X"}))).unwrap());
        assert!(view.lookup(&json!("X")).unwrap().is_some());
        drop(view);

        // same revision resumes without reindexing from scratch
        let view = View::new(&db, "by-tag", 1, store.clone(), Box::new(|_, _| {})).unwrap();
        assert!(view.lookup(&json!("X")).unwrap().is_some());
        drop(view);

        // a new revision rebuilds with the new index function
        let view = View::new(
            &db,
            "by-tag",
            2,
            store.clone(),
            Box::new(|doc, emit| {
                emit.emit(&json!("all"), &json!(doc.id));
            }),
        )
        .unwrap();
        assert!(view.lookup(&json!("X")).unwrap().is_none());
        assert!(view.lookup(&json!("all")).unwrap().is_some());
    }

    #[test]
    fn test_key_observer_sees_affected_keys() {
        let (_db, store, view) = setup();
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        view.add_key_observer(move |_, keys| {
            sink.lock().extend(keys.iter().cloned());
            true
        });

        let mut doc = Document::new("d", json!({"tag": "A"}));
        assert!(store.put_update(&mut doc).unwrap());
        view.update().unwrap();
        doc.content = Some(json!({"tag": "B"}));
        assert!(store.put_update(&mut doc).unwrap());
        view.update().unwrap();

        let keys = seen.lock().clone();
        assert_eq!(keys, vec![json!("A"), json!("A"), json!("B")]);
    }

    #[test]
    fn test_purge_doc_drops_rows() {
        let (_db, store, view) = setup();
        assert!(store.put(&Document::new("d", json!({"tag": "X"}))).unwrap());
        view.update().unwrap();
        store.purge("d").unwrap();
        // the purge is invisible to the change feed; propagate manually
        assert!(view.lookup(&json!("X")).unwrap().is_some());
        view.purge_doc("d").unwrap();
        assert!(view.lookup(&json!("X")).unwrap().is_none());
    }
}
