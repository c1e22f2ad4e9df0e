//! Document store with revision chains and a tombstone graveyard.
//!
//! Documents are JSON values wrapped in an envelope carrying a revision
//! chain (newest first) for optimistic concurrency and replication. The
//! header row keeps only `((seq << 1) | deleted)` plus the chain; the
//! payload itself lives in the incremental store under the sequence id,
//! which doubles as the change feed consumed by every derived component.
//!
//! A conflict is normal control flow: `put` returns `Ok(false)` and
//! nothing is written.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use serde_json::{Value, json};

use crate::codec;
use crate::db::{Db, KeySpaceClass, KeySpaceId, Observable, ObserverHandle, make_key, with_buffer};
use crate::error::{Result, SepalError};
use crate::incremental::{IncrementalStore, SeqId};
use crate::kv::{IterRange, SnapshotMode, WriteBatch};

/// 64-bit non-cryptographic content hash identifying a document version.
pub type DocRevision = u64;
/// Milliseconds since the epoch unless a custom timestamp fn is set.
pub type Timestamp = u64;

/// Hard cap on the revision history length.
pub const MAX_REV_HISTORY: usize = 1000;

// payload layout in the incremental store: [id, timestamp, content]
const IDX_ID: usize = 0;
const IDX_TIMESTAMP: usize = 1;
const IDX_CONTENT: usize = 2;

/// A document ready to be read or modified.
///
/// `rev` must carry the currently stored revision when updating (0 for a
/// brand new document); an absent document reads back as `deleted` with
/// revision 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub id: String,
    pub content: Option<Value>,
    pub timestamp: Timestamp,
    pub deleted: bool,
    pub rev: DocRevision,
}

impl Document {
    pub fn new(id: impl Into<String>, content: Value) -> Document {
        Document { id: id.into(), content: Some(content), ..Document::default() }
    }

    /// True when the document carries content (exists and is not a
    /// tombstone).
    pub fn valid(&self) -> bool {
        self.content.is_some()
    }
}

/// A document in replication form, carrying its whole revision chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentRepl {
    pub id: String,
    pub content: Option<Value>,
    pub timestamp: Timestamp,
    pub deleted: bool,
    pub revisions: Vec<DocRevision>,
}

/// Existence state of a document id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStatus {
    NotExists,
    Exists,
    Deleted,
}

type TimestampFn = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Document store options.
#[derive(Clone)]
pub struct DocStoreConfig {
    /// Revisions kept per document (default 100, capped at
    /// [`MAX_REV_HISTORY`]). Longer chains let replication reconnect
    /// after more missed updates.
    pub rev_history_length: usize,
    /// Keep tombstones in a separate graveyard keyspace. When disabled,
    /// tombstones stay inline and scans filter on the deleted bit.
    pub graveyard: bool,
    /// Timestamp source; defaults to milliseconds since the epoch.
    pub timestamp_fn: Option<TimestampFn>,
}

impl Default for DocStoreConfig {
    fn default() -> Self {
        DocStoreConfig { rev_history_length: 100, graveyard: false, timestamp_fn: None }
    }
}

/// Deterministic, non-cryptographic revision hash of document content.
/// Zero is reserved for "no revision" and maps to 1.
pub(crate) fn revision_hash(content: Option<&Value>) -> DocRevision {
    let bytes = match content {
        Some(v) => serde_json::to_vec(v).unwrap_or_default(),
        None => Vec::new(),
    };
    let h = xxhash_rust::xxh3::xxh3_64(&bytes);
    if h == 0 { 1 } else { h }
}

/// Parsed document header row.
#[derive(Debug, Clone)]
struct DocHeader {
    seq: SeqId,
    deleted: bool,
    revisions: Vec<DocRevision>,
}

impl DocHeader {
    fn parse(bytes: &[u8]) -> Result<DocHeader> {
        if bytes.len() < 8 || bytes.len() % 8 != 0 {
            return Err(SepalError::decode("malformed document header"));
        }
        let seq_del = BigEndian::read_u64(&bytes[..8]);
        let revisions = bytes[8..].chunks_exact(8).map(BigEndian::read_u64).collect();
        Ok(DocHeader { seq: seq_del >> 1, deleted: seq_del & 1 != 0, revisions })
    }

    fn top_rev(&self) -> DocRevision {
        self.revisions.first().copied().unwrap_or(0)
    }

    fn write(buf: &mut Vec<u8>, seq: SeqId, deleted: bool, revisions: &[DocRevision]) {
        let mut word = [0u8; 8];
        BigEndian::write_u64(&mut word, (seq << 1) | u64::from(deleted));
        buf.extend_from_slice(&word);
        for &rev in revisions {
            BigEndian::write_u64(&mut word, rev);
            buf.extend_from_slice(&word);
        }
    }
}

/// The document store.
pub struct DocStore {
    db: Db,
    kid: KeySpaceId,
    gkid: KeySpaceId,
    inc: IncrementalStore,
    rev_history: usize,
    timestamp_fn: TimestampFn,
    observers: Arc<Observable<Document>>,
}

impl DocStore {
    /// Open (or create) the document store registered under `name`.
    pub fn open(db: &Db, name: &str, config: DocStoreConfig) -> Result<DocStore> {
        let kid = db.alloc_keyspace(KeySpaceClass::Document, name)?;
        let gkid = if config.graveyard {
            db.alloc_keyspace(KeySpaceClass::Graveyard, name)?
        } else {
            kid
        };
        let inc = IncrementalStore::open(db, name)?;
        let observers = db.observable::<Document>(kid);
        let timestamp_fn = config
            .timestamp_fn
            .unwrap_or_else(|| Arc::new(|| chrono::Utc::now().timestamp_millis().max(0) as Timestamp));
        Ok(DocStore {
            db: db.clone(),
            kid,
            gkid,
            inc,
            rev_history: config.rev_history_length.clamp(1, MAX_REV_HISTORY),
            timestamp_fn,
            observers,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The incremental store backing this document store.
    pub fn incremental(&self) -> &IncrementalStore {
        &self.inc
    }

    /// Last assigned sequence id.
    pub fn seq(&self) -> SeqId {
        self.inc.seq()
    }

    fn find_header(&self, db: &Db, id: &str) -> Result<Option<DocHeader>> {
        if let Some(bytes) = db.get(&make_key(self.kid, id.as_bytes()))? {
            return Ok(Some(DocHeader::parse(&bytes)?));
        }
        if self.gkid != self.kid {
            if let Some(bytes) = db.get(&make_key(self.gkid, id.as_bytes()))? {
                return Ok(Some(DocHeader::parse(&bytes)?));
            }
        }
        Ok(None)
    }

    fn payload(id: &str, timestamp: Timestamp, content: Option<&Value>) -> Value {
        json!([id, timestamp, content.cloned().unwrap_or(Value::Null)])
    }

    fn write_doc(
        &self,
        batch: &mut crate::incremental::IncrementalBatch<'_>,
        id: &str,
        content: Option<&Value>,
        deleted: bool,
        new_revisions: Vec<DocRevision>,
        previous: Option<&DocHeader>,
    ) -> Result<()> {
        let timestamp = (self.timestamp_fn)();
        let seq = self.inc.put_batch(batch, &Self::payload(id, timestamp, content));

        with_buffer(|buf| {
            DocHeader::write(buf, seq, deleted, &new_revisions);
            let target = if deleted { self.gkid } else { self.kid };
            batch.batch().put(make_key(target, id.as_bytes()), buf.clone());
        });

        if let Some(prev) = previous {
            if self.gkid != self.kid && prev.deleted != deleted {
                let other = if prev.deleted { self.gkid } else { self.kid };
                batch.batch().delete(make_key(other, id.as_bytes()));
            }
            // exactly one payload per live document
            self.inc.erase_batch(batch.batch(), prev.seq);
        }

        if !self.observers.is_empty() {
            let doc = Document {
                id: id.to_string(),
                content: content.cloned(),
                timestamp,
                deleted,
                rev: new_revisions.first().copied().unwrap_or(0),
            };
            self.observers.broadcast(batch.batch(), &doc);
        }
        Ok(())
    }

    /// Store a document. `doc.rev` must match the currently stored top
    /// revision (0 for a new document); on mismatch nothing is written
    /// and `Ok(false)` is returned.
    pub fn put(&self, doc: &Document) -> Result<bool> {
        self.put_impl(doc).map(|r| r.is_some())
    }

    /// Like [`DocStore::put`] but updates `doc.rev` to the newly
    /// assigned revision on success.
    pub fn put_update(&self, doc: &mut Document) -> Result<bool> {
        match self.put_impl(doc)? {
            Some(rev) => {
                doc.rev = rev;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn put_impl(&self, doc: &Document) -> Result<Option<DocRevision>> {
        // the batch holds the store's exclusive lock, so the header read
        // and the conflict check stay atomic with the write
        let mut batch = self.inc.create_batch();
        let header = self.find_header(&self.db, &doc.id)?;
        let new_rev = revision_hash(doc.content.as_ref());
        let mut revisions = Vec::with_capacity(self.rev_history);
        revisions.push(new_rev);
        match &header {
            Some(h) if !h.revisions.is_empty() => {
                if h.top_rev() != doc.rev {
                    return Ok(None);
                }
                let keep = (self.rev_history - 1).min(h.revisions.len());
                revisions.extend_from_slice(&h.revisions[..keep]);
            }
            _ => {
                if doc.rev != 0 {
                    return Ok(None);
                }
            }
        }
        self.write_doc(&mut batch, &doc.id, doc.content.as_ref(), doc.deleted, revisions, header.as_ref())?;
        batch.commit()?;
        Ok(Some(new_rev))
    }

    /// Store a replicated document, splicing its revision chain onto the
    /// local one. The chains connect when the local top revision appears
    /// anywhere in the incoming chain; a connection at the top is a
    /// no-op, a missing connection is a conflict.
    pub fn replicate_put(&self, doc: &DocumentRepl) -> Result<bool> {
        let mut batch = self.inc.create_batch();
        let header = self.find_header(&self.db, &doc.id)?;
        if let Some(h) = &header {
            if !h.revisions.is_empty() {
                let current = h.top_rev();
                match doc.revisions.iter().position(|&r| r == current) {
                    None => return Ok(false),
                    Some(0) => return Ok(true),
                    Some(_) => {}
                }
            }
        }
        let mut revisions = doc.revisions.clone();
        revisions.truncate(self.rev_history);
        self.write_doc(&mut batch, &doc.id, doc.content.as_ref(), doc.deleted, revisions, header.as_ref())?;
        batch.commit()?;
        Ok(true)
    }

    /// Tombstone a document: equivalent to a `put` of a deleted document
    /// without content, keeping the revision chain replicable.
    pub fn erase(&self, id: &str, rev: DocRevision) -> Result<bool> {
        self.put(&Document { id: id.to_string(), content: None, timestamp: 0, deleted: true, rev })
    }

    /// Physically remove a document and its payload, without a
    /// tombstone. Cannot be replicated and is not propagated to derived
    /// components. Returns `false` when the document does not exist.
    pub fn purge(&self, id: &str) -> Result<bool> {
        self.purge_impl(id, None)
    }

    /// Like [`DocStore::purge`], but only when `rev` matches the stored
    /// top revision.
    pub fn purge_rev(&self, id: &str, rev: DocRevision) -> Result<bool> {
        self.purge_impl(id, Some(rev))
    }

    fn purge_impl(&self, id: &str, rev: Option<DocRevision>) -> Result<bool> {
        let mut batch = self.inc.create_batch();
        let Some(header) = self.find_header(&self.db, id)? else {
            return Ok(false);
        };
        if header.revisions.is_empty() {
            return Ok(false);
        }
        if let Some(expected) = rev {
            if header.top_rev() != expected {
                return Ok(false);
            }
        }
        let kid = if header.deleted { self.gkid } else { self.kid };
        batch.batch().delete(make_key(kid, id.as_bytes()));
        self.inc.erase_batch(batch.batch(), header.seq);
        batch.commit()?;
        Ok(true)
    }

    // ── reads ───────────────────────────────────────────────────────

    /// Fetch a document for modification. A missing document comes back
    /// deleted with revision 0, ready to be stored with `rev: 0`.
    pub fn get(&self, id: &str) -> Result<Document> {
        let snap = self.db.snapshot(SnapshotMode::WriteError);
        let Some(header) = self.find_header(&snap, id)? else {
            return Ok(Document { id: id.to_string(), deleted: true, ..Document::default() });
        };
        let (content, timestamp) = self.load_payload(&snap, header.seq, header.deleted)?;
        Ok(Document {
            id: id.to_string(),
            content,
            timestamp,
            deleted: header.deleted,
            rev: header.top_rev(),
        })
    }

    /// Fetch a document in replication form, with its whole chain.
    pub fn replicate_get(&self, id: &str) -> Result<DocumentRepl> {
        let snap = self.db.snapshot(SnapshotMode::WriteError);
        let Some(header) = self.find_header(&snap, id)? else {
            return Ok(DocumentRepl { id: id.to_string(), deleted: true, ..DocumentRepl::default() });
        };
        let (content, timestamp) = self.load_payload(&snap, header.seq, header.deleted)?;
        Ok(DocumentRepl {
            id: id.to_string(),
            content,
            timestamp,
            deleted: header.deleted,
            revisions: header.revisions,
        })
    }

    fn load_payload(&self, db: &Db, seq: SeqId, deleted: bool) -> Result<(Option<Value>, Timestamp)> {
        let Some(payload) = self.inc.get_at(db, seq)? else {
            return Err(SepalError::decode(format!("document payload {seq} is missing")));
        };
        let timestamp = payload
            .get(IDX_TIMESTAMP)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let content = if deleted { None } else { payload.get(IDX_CONTENT).cloned() };
        Ok((content, timestamp))
    }

    /// Current top revision of a document, 0 when it does not exist.
    pub fn revision(&self, id: &str) -> Result<DocRevision> {
        Ok(self.find_header(&self.db, id)?.map(|h| h.top_rev()).unwrap_or(0))
    }

    /// The stored revision chain, newest first.
    pub fn revisions(&self, id: &str) -> Result<Vec<DocRevision>> {
        Ok(self.find_header(&self.db, id)?.map(|h| h.revisions).unwrap_or_default())
    }

    /// Existence state, cheaper than fetching the whole document.
    pub fn status(&self, id: &str) -> Result<DocStatus> {
        Ok(match self.find_header(&self.db, id)? {
            None => DocStatus::NotExists,
            Some(h) if h.revisions.is_empty() => DocStatus::NotExists,
            Some(h) if h.deleted => DocStatus::Deleted,
            Some(_) => DocStatus::Exists,
        })
    }

    // ── scans ───────────────────────────────────────────────────────

    /// Iterate live documents in id order.
    pub fn scan(&self, backward: bool) -> Result<DocIterator> {
        self.scan_prefix("", backward)
    }

    /// Iterate live documents whose id starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str, backward: bool) -> Result<DocIterator> {
        let snap = self.db.snapshot(SnapshotMode::WriteError);
        let begin = make_key(self.kid, prefix.as_bytes());
        let mut end = begin.clone();
        codec::upper_bound(&mut end);
        let range = if backward {
            IterRange::new(end, begin).exclude_begin()
        } else {
            IterRange::new(begin, end).exclude_end()
        };
        self.live_iterator(snap, range)
    }

    /// Iterate live documents between two ids. When `from > to` the
    /// scan runs backward; `include_upper` controls whether the greater
    /// endpoint is part of the result.
    pub fn range(&self, from: &str, to: &str, include_upper: bool) -> Result<DocIterator> {
        let snap = self.db.snapshot(SnapshotMode::WriteError);
        let backward = from > to;
        // the greater endpoint is the upper bound; stretching it past
        // the exact id pulls that id into the range
        let stretch = |id: &str| {
            let mut k = make_key(self.kid, id.as_bytes());
            k.push(0);
            k
        };
        let range = if backward {
            let begin = if include_upper { stretch(from) } else { make_key(self.kid, from.as_bytes()) };
            let mut r = IterRange::new(begin, make_key(self.kid, to.as_bytes()));
            if !include_upper {
                r = r.exclude_begin();
            }
            r
        } else {
            let end = if include_upper { stretch(to) } else { make_key(self.kid, to.as_bytes()) };
            IterRange::new(make_key(self.kid, from.as_bytes()), end).exclude_end()
        };
        self.live_iterator(snap, range)
    }

    fn live_iterator(&self, snap: Db, range: IterRange) -> Result<DocIterator> {
        let mut raw = snap.iter(range)?;
        if self.kid == self.gkid {
            raw.add_filter(|_, value| {
                DocHeader::parse(value).map(|h| !h.deleted).unwrap_or(true)
            });
        }
        Ok(DocIterator { store: self.reader(snap), raw, filter: None })
    }

    /// Iterate tombstoned documents.
    pub fn scan_deleted(&self) -> Result<DocIterator> {
        self.scan_deleted_prefix("")
    }

    /// Iterate tombstoned documents whose id starts with `prefix`.
    pub fn scan_deleted_prefix(&self, prefix: &str) -> Result<DocIterator> {
        let snap = self.db.snapshot(SnapshotMode::WriteError);
        let begin = make_key(self.gkid, prefix.as_bytes());
        let mut end = begin.clone();
        codec::upper_bound(&mut end);
        let mut raw = snap.iter(IterRange::new(begin, end).exclude_end())?;
        if self.kid == self.gkid {
            raw.add_filter(|_, value| {
                DocHeader::parse(value).map(|h| h.deleted).unwrap_or(false)
            });
        }
        Ok(DocIterator { store: self.reader(snap), raw, filter: None })
    }

    /// Iterate all changes with sequence ids greater than `from`, in
    /// chronological order, live and deleted alike. Each change joins
    /// back to the current header for the deleted flag and revision.
    pub fn scan_changes(&self, from: SeqId) -> Result<ChangesIterator> {
        let snap = self.db.snapshot(SnapshotMode::WriteError);
        let inner = self.inc.scan_from_at(&snap, from)?;
        Ok(ChangesIterator { store: self.reader(snap), inner })
    }

    fn reader(&self, snap: Db) -> DocReader {
        DocReader { db: snap, kid: self.kid, gkid: self.gkid, inc_kid: self.inc.keyspace() }
    }

    // ── observers ───────────────────────────────────────────────────

    /// Register an observer fired on every accepted write, inside the
    /// write's batch. Return `false` from the callback to unsubscribe.
    pub fn add_observer(
        &self,
        f: impl FnMut(&mut WriteBatch, &Document) -> bool + Send + 'static,
    ) -> ObserverHandle {
        self.observers.add(f)
    }

    pub fn remove_observer(&self, h: ObserverHandle) {
        self.observers.remove(h);
    }

    /// Wake threads blocked in the incremental store's change wait.
    pub fn cancel_listen(&self) {
        self.inc.cancel_listen();
    }
}

/// Read-side state shared by the iterators: a snapshot plus the
/// keyspace ids needed to join headers and payloads.
struct DocReader {
    db: Db,
    kid: KeySpaceId,
    gkid: KeySpaceId,
    inc_kid: KeySpaceId,
}

impl DocReader {
    fn header(&self, id: &str) -> Result<Option<DocHeader>> {
        if let Some(bytes) = self.db.get(&make_key(self.kid, id.as_bytes()))? {
            return Ok(Some(DocHeader::parse(&bytes)?));
        }
        if self.gkid != self.kid {
            if let Some(bytes) = self.db.get(&make_key(self.gkid, id.as_bytes()))? {
                return Ok(Some(DocHeader::parse(&bytes)?));
            }
        }
        Ok(None)
    }

    fn payload(&self, seq: SeqId) -> Result<Option<Value>> {
        let mut key = Vec::with_capacity(9);
        key.push(self.inc_kid);
        codec::push_seq(&mut key, seq);
        match self.db.get(&key)? {
            Some(bytes) => Ok(Some(codec::decode_value(&bytes)?)),
            None => Ok(None),
        }
    }
}

type DocFilter = Box<dyn FnMut(&Document) -> bool + Send>;

/// Iterator over documents.
pub struct DocIterator {
    store: DocReader,
    raw: crate::db::RawIterator,
    filter: Option<DocFilter>,
}

impl Iterator for DocIterator {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = self.raw.next()?;
            match self.build(&key, &value) {
                Ok(doc) => {
                    if let Some(f) = &mut self.filter {
                        if !f(&doc) {
                            continue;
                        }
                    }
                    return Some(Ok(doc));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl DocIterator {
    /// Keep only documents the predicate accepts.
    pub fn with_filter(mut self, f: impl FnMut(&Document) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(f));
        self
    }

    fn build(&self, key: &[u8], value: &[u8]) -> Result<Document> {
        let id = std::str::from_utf8(&key[1..])
            .map_err(|_| SepalError::decode("document id is not utf-8"))?
            .to_string();
        let header = DocHeader::parse(value)?;
        let payload = self
            .store
            .payload(header.seq)?
            .ok_or_else(|| SepalError::decode(format!("document payload {} is missing", header.seq)))?;
        let timestamp = payload.get(IDX_TIMESTAMP).and_then(Value::as_u64).unwrap_or(0);
        let content = if header.deleted { None } else { payload.get(IDX_CONTENT).cloned() };
        Ok(Document { id, content, timestamp, deleted: header.deleted, rev: header.top_rev() })
    }
}

/// One entry of the change feed.
#[derive(Debug, Clone)]
pub struct Change {
    pub seq: SeqId,
    pub id: String,
    pub content: Option<Value>,
    pub timestamp: Timestamp,
    pub deleted: bool,
    pub rev: DocRevision,
}

impl Change {
    /// The change as a document, as derived components index it.
    pub fn to_document(&self) -> Document {
        Document {
            id: self.id.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
            deleted: self.deleted,
            rev: self.rev,
        }
    }
}

/// Iterator over the change feed.
pub struct ChangesIterator {
    store: DocReader,
    inner: crate::incremental::IncrementalIterator,
}

impl Iterator for ChangesIterator {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.inner.next()? {
            Ok(e) => e,
            Err(e) => return Some(Err(e)),
        };
        Some(self.build(entry))
    }
}

impl ChangesIterator {
    fn build(&self, (seq, payload): (SeqId, Value)) -> Result<Change> {
        let id = payload
            .get(IDX_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| SepalError::decode("change payload without document id"))?
            .to_string();
        let timestamp = payload.get(IDX_TIMESTAMP).and_then(Value::as_u64).unwrap_or(0);
        let header = self.store.header(&id)?;
        let (deleted, rev) = match &header {
            Some(h) => (h.deleted, h.top_rev()),
            None => (true, 0),
        };
        let content = if deleted { None } else { payload.get(IDX_CONTENT).cloned() };
        Ok(Change { seq, id, content, timestamp, deleted, rev })
    }
}
