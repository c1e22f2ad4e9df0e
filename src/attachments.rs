//! Segmented binary attachments bound to documents.
//!
//! Large blobs are split into segments of bounded size, each stored
//! under its own segment id, so no single row grows past the engine's
//! comfort zone. A metadata row per `(docId, attId)` records the
//! content type, the base64url MD5 of the whole blob and the
//! delta-encoded segment list.
//!
//! Everything lives in one map keyspace, keyed by encoded JSON:
//!
//! ```text
//! null              -> [next_seg_id, last_scanned_seq, revision]
//! true              -> [pending seg ids of in-flight uploads]
//! <seg_id>          -> raw segment bytes
//! [doc_id, att_id]  -> [content_type, hash, delta seg ids]
//! ```
//!
//! Uploads are crash-safe: segments are written immediately, but only a
//! committed upload adds them to the persisted pending list; dropping an
//! uncommitted upload deletes them, and the list is replayed on open so
//! segments orphaned by a crash are collected. Garbage collection runs
//! when the last in-flight upload commits: it replays the document
//! store's change feed and deletes attachments the index function no
//! longer claims.

use std::sync::Arc;

use ahash::AHashSet;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::codec;
use crate::db::{Db, KeySpaceClass};
use crate::docstore::{DocStore, Document};
use crate::error::{Result, SepalError};
use crate::incremental::SeqId;
use crate::jsonmap::JsonMapView;
use crate::kv::{SnapshotMode, WriteBatch};

/// Segment id, allocated from a per-store counter.
pub type SegId = u64;

/// Callback naming the attachment ids a document keeps referencing.
pub type AttachmentIndexFn = Box<dyn Fn(&Document, &mut dyn FnMut(&str)) + Send + Sync>;

/// Attachment store options.
#[derive(Debug, Clone)]
pub struct AttachmentsConfig {
    /// Buffered bytes before a segment is flushed.
    pub min_segment: usize,
    /// Largest single segment.
    pub max_segment: usize,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        AttachmentsConfig { min_segment: 10_000, max_segment: 50_000 }
    }
}

/// Parsed attachment metadata row.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentMeta {
    pub content_type: String,
    /// base64url (unpadded) MD5 of the attachment content.
    pub hash: String,
    pub segments: Vec<SegId>,
}

impl AttachmentMeta {
    fn parse(value: &Value) -> Result<AttachmentMeta> {
        let arr = value
            .as_array()
            .filter(|a| a.len() >= 3)
            .ok_or_else(|| SepalError::decode("malformed attachment metadata"))?;
        let deltas = arr[2]
            .as_array()
            .ok_or_else(|| SepalError::decode("malformed attachment segment list"))?;
        let mut segments = Vec::with_capacity(deltas.len());
        let mut current: SegId = 0;
        for d in deltas {
            current += d.as_u64().unwrap_or(0);
            segments.push(current);
        }
        Ok(AttachmentMeta {
            content_type: arr[0].as_str().unwrap_or_default().to_string(),
            hash: arr[1].as_str().unwrap_or_default().to_string(),
            segments,
        })
    }

    fn compose(&self) -> Value {
        let mut deltas = Vec::with_capacity(self.segments.len());
        let mut previous: SegId = 0;
        for &seg in &self.segments {
            deltas.push(seg - previous);
            previous = seg;
        }
        json!([self.content_type, self.hash, deltas])
    }
}

/// One entry of an attachment listing.
#[derive(Debug, Clone)]
pub struct AttachmentEntry {
    pub doc_id: String,
    pub att_id: String,
    pub meta: AttachmentMeta,
}

struct AttachState {
    next_seg_id: SegId,
    last_scanned_seq: SeqId,
    pending: Vec<SegId>,
    upload_locks: u32,
}

struct AttachInner {
    map: JsonMapView,
    source: Arc<DocStore>,
    index_fn: AttachmentIndexFn,
    config: AttachmentsConfig,
    revision: u64,
    state: Mutex<AttachState>,
}

/// The attachment store.
pub struct Attachments {
    inner: Arc<AttachInner>,
}

impl Attachments {
    /// Open (or create) the attachment store registered under `name`.
    /// `revision` versions the index function; a mismatch rescans the
    /// whole change feed on the next garbage collection.
    pub fn new(
        db: &Db,
        name: &str,
        revision: u64,
        source: Arc<DocStore>,
        index_fn: AttachmentIndexFn,
        config: AttachmentsConfig,
    ) -> Result<Attachments> {
        let map = JsonMapView::open_class(db, KeySpaceClass::Attachments.id(), name)?;
        if !db.keyspace_lock(map.kid(), true) {
            return Err(SepalError::KeyspaceLocked(map.kid()));
        }
        let mut next_seg_id: SegId = 1;
        let mut last_scanned_seq: SeqId = 0;
        let mut pending: Vec<SegId> = Vec::new();
        if let Some(state) = map.lookup(&Value::Null)? {
            next_seg_id = state.get(0).and_then(Value::as_u64).unwrap_or(1);
            last_scanned_seq = state.get(1).and_then(Value::as_u64).unwrap_or(0);
            let stored_revision = state.get(2).and_then(Value::as_u64).unwrap_or(0);
            if stored_revision != revision {
                log::debug!("attachment index {name:?} revision changed, rescanning");
                last_scanned_seq = 0;
            }
            if let Some(list) = map.lookup(&Value::Bool(true))? {
                pending = list
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_u64).collect())
                    .unwrap_or_default();
            }
        }

        let inner = Arc::new(AttachInner {
            map,
            source,
            index_fn,
            config,
            revision,
            state: Mutex::new(AttachState {
                next_seg_id,
                last_scanned_seq,
                pending,
                upload_locks: 0,
            }),
        });
        let store = Attachments { inner };
        store.replay_pending()?;
        Ok(store)
    }

    /// The pending list is authoritative: any listed segment that no
    /// metadata row references was orphaned by a crash and is deleted.
    fn replay_pending(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.pending.is_empty() {
            return Ok(());
        }
        let mut referenced: AHashSet<SegId> = AHashSet::new();
        for entry in self.scan()? {
            referenced.extend(entry?.meta.segments);
        }
        let mut batch = WriteBatch::new();
        let mut dropped = 0u32;
        for &seg in &state.pending {
            if !referenced.contains(&seg) {
                batch.delete(self.inner.map.row_key(&json!(seg)));
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::warn!("attachment store dropped {dropped} orphaned segments");
        }
        state.pending.clear();
        self.write_state(&mut batch, &state);
        self.inner.map.db().commit_batch(&mut batch)
    }

    fn write_state(&self, batch: &mut WriteBatch, state: &AttachState) {
        let mut value = Vec::new();
        codec::encode_value(
            &json!([state.next_seg_id, state.last_scanned_seq, self.inner.revision]),
            &mut value,
        );
        batch.put(self.inner.map.row_key(&Value::Null), value);
        let mut pending = Vec::new();
        codec::encode_value(&json!(state.pending), &mut pending);
        batch.put(self.inner.map.row_key(&Value::Bool(true)), pending);
    }

    fn meta_key(doc_id: &str, att_id: &str) -> Value {
        json!([doc_id, att_id])
    }

    /// Start an upload for `doc_id`. Garbage collection is held off
    /// while any upload is in flight.
    pub fn upload(&self, doc_id: &str) -> Upload {
        self.inner.state.lock().upload_locks += 1;
        Upload {
            inner: self.inner.clone(),
            store: Attachments { inner: self.inner.clone() },
            doc_id: doc_id.to_string(),
            att_id: None,
            content_type: String::new(),
            buffer: Vec::new(),
            md5: md5::Context::new(),
            segments: Vec::new(),
            stored: Vec::new(),
            batch: WriteBatch::new(),
            committed: false,
        }
    }

    /// Open an attachment for reading, over a snapshot.
    pub fn download(&self, doc_id: &str, att_id: &str) -> Result<Option<Download>> {
        let snap = self.inner.map.db().snapshot(SnapshotMode::WriteError);
        let map = self.inner.map.at(&snap);
        let Some(meta) = map.lookup(&Self::meta_key(doc_id, att_id))? else {
            return Ok(None);
        };
        let meta = AttachmentMeta::parse(&meta)?;
        Ok(Some(Download { map, meta, position: 0 }))
    }

    /// Fetch a single segment of an attachment by its index.
    pub fn segment(&self, doc_id: &str, att_id: &str, index: usize) -> Result<Option<Vec<u8>>> {
        let Some(download) = self.download(doc_id, att_id)? else {
            return Ok(None);
        };
        let Some(&seg) = download.meta.segments.get(index) else {
            return Ok(None);
        };
        download.map.db().get(&download.map.row_key(&json!(seg)))
    }

    /// List every attachment, ordered by `(doc_id, att_id)`.
    pub fn scan(&self) -> Result<AttachmentIterator> {
        // metadata keys are the only array-encoded keys in the keyspace:
        // they all start with the array-prefix tag bit
        let kid = self.inner.map.kid();
        let rows = self.inner.map.scan_bytes(
            vec![kid, codec::tag::ARRAY_PREFIX],
            vec![kid, codec::tag::DOC],
        )?;
        Ok(AttachmentIterator { rows })
    }

    /// List the attachments of one document.
    pub fn scan_doc(&self, doc_id: &str) -> Result<AttachmentIterator> {
        // the full encoding (terminator included) pins the exact doc id,
        // so "doc" does not match "doc2"
        let begin = self.inner.map.row_key(&json!([doc_id]));
        let mut end = begin.clone();
        codec::upper_bound(&mut end);
        Ok(AttachmentIterator { rows: self.inner.map.scan_bytes(begin, end)? })
    }

    /// Attachment ids the index function claims for `doc` that have no
    /// stored metadata yet. Callers use this to decide what to upload.
    pub fn missing(&self, doc: &Document) -> Result<Vec<String>> {
        let mut wanted: Vec<String> = Vec::new();
        (self.inner.index_fn)(doc, &mut |att_id| wanted.push(att_id.to_string()));
        let mut out = Vec::new();
        for att_id in wanted {
            if self.inner.map.lookup(&Self::meta_key(&doc.id, &att_id))?.is_none() {
                out.push(att_id);
            }
        }
        Ok(out)
    }

    /// Delete one attachment and its segments.
    pub fn erase(&self, doc_id: &str, att_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.erase_batch(&mut batch, doc_id, att_id)?;
        self.inner.map.db().commit_batch(&mut batch)
    }

    fn erase_batch(&self, batch: &mut WriteBatch, doc_id: &str, att_id: &str) -> Result<()> {
        let key = Self::meta_key(doc_id, att_id);
        if let Some(meta) = self.inner.map.lookup(&key)? {
            for seg in AttachmentMeta::parse(&meta)?.segments {
                batch.delete(self.inner.map.row_key(&json!(seg)));
            }
            batch.delete(self.inner.map.row_key(&key));
        }
        Ok(())
    }

    /// Delete every attachment of a purged document. Purges bypass the
    /// change feed, so the caller propagates them explicitly.
    pub fn purge_doc(&self, doc_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        for entry in self.scan_doc(doc_id)? {
            let entry = entry?;
            for seg in entry.meta.segments {
                batch.delete(self.inner.map.row_key(&json!(seg)));
            }
            batch.delete(self.inner.map.row_key(&Self::meta_key(doc_id, &entry.att_id)));
        }
        self.inner.map.db().commit_batch(&mut batch)
    }

    /// Run garbage collection now, unless uploads are in flight.
    pub fn run_gc(&self) -> Result<bool> {
        let mut state = self.inner.state.lock();
        if state.upload_locks > 0 {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        self.collect_garbage(&mut batch, &mut state)?;
        state.pending.clear();
        self.write_state(&mut batch, &state);
        self.inner.map.db().commit_batch(&mut batch)?;
        Ok(true)
    }

    /// Replay the source's change feed and drop attachments their
    /// documents no longer reference.
    fn collect_garbage(&self, batch: &mut WriteBatch, state: &mut AttachState) -> Result<()> {
        for change in self.inner.source.scan_changes(state.last_scanned_seq)? {
            let change = change?;
            let doc = change.to_document();
            let mut kept: AHashSet<String> = AHashSet::new();
            (self.inner.index_fn)(&doc, &mut |att_id| {
                kept.insert(att_id.to_string());
            });
            for entry in self.scan_doc(&doc.id)? {
                let entry = entry?;
                if !kept.contains(&entry.att_id) {
                    log::debug!("collecting attachment {}/{}", doc.id, entry.att_id);
                    self.erase_batch(batch, &doc.id, &entry.att_id)?;
                }
            }
            state.last_scanned_seq = change.seq;
        }
        Ok(())
    }

    fn alloc_segment(&self) -> SegId {
        let mut state = self.inner.state.lock();
        let seg = state.next_seg_id;
        state.next_seg_id += 1;
        seg
    }

    /// Called when an upload finishes (committed or rolled back); the
    /// last one out runs garbage collection and persists the state.
    fn release_upload(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.upload_locks = state.upload_locks.saturating_sub(1);
        if state.upload_locks > 0 {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        self.collect_garbage(&mut batch, &mut state)?;
        state.pending.clear();
        self.write_state(&mut batch, &state);
        self.inner.map.db().commit_batch(&mut batch)
    }
}

impl Drop for Attachments {
    fn drop(&mut self) {
        // only the store itself and its in-flight uploads share the inner
        if Arc::strong_count(&self.inner) == 1 {
            self.inner.map.db().keyspace_lock(self.inner.map.kid(), false);
        }
    }
}

/// Streaming upload of one or more attachments for a single document.
///
/// `open` starts an attachment, `write` streams its bytes, `close`
/// finishes it (several attachments can be uploaded back to back);
/// `commit` makes everything durable. Dropping an uncommitted upload
/// deletes the segments it wrote.
pub struct Upload {
    inner: Arc<AttachInner>,
    store: Attachments,
    doc_id: String,
    att_id: Option<String>,
    content_type: String,
    buffer: Vec<u8>,
    md5: md5::Context,
    /// Segments of the attachment currently open.
    segments: Vec<SegId>,
    /// Every segment written by this upload, for rollback and the
    /// pending list.
    stored: Vec<SegId>,
    /// Deferred metadata writes, committed with the upload.
    batch: WriteBatch,
    committed: bool,
}

impl Upload {
    /// Start (or restart) an attachment. An attachment left open is
    /// closed first.
    pub fn open(&mut self, att_id: &str, content_type: &str) -> Result<()> {
        if self.att_id.is_some() {
            self.close()?;
        }
        self.att_id = Some(att_id.to_string());
        self.content_type = content_type.to_string();
        self.buffer.clear();
        self.segments.clear();
        self.md5 = md5::Context::new();
        Ok(())
    }

    /// Stream attachment bytes. Full segments are flushed as soon as
    /// the buffer holds at least `min_segment` bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.att_id.is_none() {
            return Ok(());
        }
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.inner.config.min_segment {
            let take = self.buffer.len().min(self.inner.config.max_segment);
            let segment: Vec<u8> = self.buffer.drain(..take).collect();
            self.flush_segment(&segment)?;
        }
        Ok(())
    }

    fn flush_segment(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.md5.consume(data);
        let seg = self.store.alloc_segment();
        let mut batch = WriteBatch::new();
        batch.put(self.inner.map.row_key(&json!(seg)), data.to_vec());
        self.inner.map.db().commit_batch(&mut batch)?;
        self.segments.push(seg);
        self.stored.push(seg);
        Ok(())
    }

    /// Finish the open attachment: flush the tail, replace any previous
    /// attachment under the same id and stage the metadata row. Returns
    /// the base64url MD5 of the content.
    pub fn close(&mut self) -> Result<String> {
        let Some(att_id) = self.att_id.take() else {
            return Ok(String::new());
        };
        let tail: Vec<u8> = self.buffer.drain(..).collect();
        self.flush_segment(&tail)?;

        let digest = std::mem::replace(&mut self.md5, md5::Context::new()).compute();
        let hash = URL_SAFE_NO_PAD.encode(digest.0);

        let key = Attachments::meta_key(&self.doc_id, &att_id);
        if let Some(old) = self.inner.map.lookup(&key)? {
            for seg in AttachmentMeta::parse(&old)?.segments {
                self.batch.delete(self.inner.map.row_key(&json!(seg)));
            }
        }
        let meta = AttachmentMeta {
            content_type: std::mem::take(&mut self.content_type),
            hash: hash.clone(),
            segments: std::mem::take(&mut self.segments),
        };
        let mut value = Vec::new();
        codec::encode_value(&meta.compose(), &mut value);
        self.batch.put(self.inner.map.row_key(&key), value);
        Ok(hash)
    }

    /// Commit every staged attachment. The written segments join the
    /// persisted pending list; when this was the last in-flight upload,
    /// garbage collection runs.
    pub fn commit(mut self) -> Result<()> {
        if self.att_id.is_some() {
            self.close()?;
        }
        {
            let mut state = self.inner.state.lock();
            state.pending.extend(self.stored.drain(..));
            self.store.write_state(&mut self.batch, &state);
        }
        self.inner.map.db().commit_batch(&mut self.batch)?;
        self.committed = true;
        self.store.release_upload()
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        if !self.committed {
            // roll back: the upload's segments never became reachable
            let mut batch = WriteBatch::new();
            for seg in self.stored.drain(..) {
                batch.delete(self.inner.map.row_key(&json!(seg)));
            }
            if let Err(e) = self.inner.map.db().commit_batch(&mut batch) {
                log::warn!("attachment upload rollback failed: {e}");
            }
            if let Err(e) = self.store.release_upload() {
                log::warn!("attachment gc after rollback failed: {e}");
            }
        }
    }
}

/// Sequential reader over an attachment's segments.
pub struct Download {
    map: JsonMapView,
    meta: AttachmentMeta,
    position: usize,
}

impl Download {
    pub fn content_type(&self) -> &str {
        &self.meta.content_type
    }

    /// base64url (unpadded) MD5 recorded at upload time.
    pub fn hash(&self) -> &str {
        &self.meta.hash
    }

    pub fn meta(&self) -> &AttachmentMeta {
        &self.meta
    }

    /// Read the next segment, or `None` at the end.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(&seg) = self.meta.segments.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        match self.map.db().get(&self.map.row_key(&json!(seg)))? {
            Some(bytes) => Ok(Some(bytes)),
            None => Err(SepalError::decode(format!("attachment segment {seg} is missing"))),
        }
    }

    /// Read all remaining segments into one buffer.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read()? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Verify the content against the recorded MD5.
    pub fn verify(&mut self) -> Result<bool> {
        self.position = 0;
        let content = self.read_to_end()?;
        let digest = md5::compute(&content);
        Ok(URL_SAFE_NO_PAD.encode(digest.0) == self.meta.hash)
    }
}

/// Iterator over attachment metadata rows.
pub struct AttachmentIterator {
    rows: crate::jsonmap::MapIterator,
}

impl Iterator for AttachmentIterator {
    type Item = Result<AttachmentEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = match self.rows.next()? {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };
        let parse = || -> Result<AttachmentEntry> {
            let parts = row
                .key
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| SepalError::decode("malformed attachment key"))?;
            Ok(AttachmentEntry {
                doc_id: parts[0].as_str().unwrap_or_default().to_string(),
                att_id: parts[1].as_str().unwrap_or_default().to_string(),
                meta: AttachmentMeta::parse(&row.value)?,
            })
        };
        Some(parse())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::DocStoreConfig;

    fn setup(config: AttachmentsConfig) -> (Db, Arc<DocStore>, Attachments) {
        let db = Db::in_memory();
        let store = Arc::new(DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap());
        let atts = Attachments::new(
            &db,
            "blobs",
            1,
            store.clone(),
            Box::new(|doc, emit| {
                if let Some(list) = doc.content.as_ref().and_then(|c| c.get("atts")).and_then(Value::as_array)
                {
                    for a in list {
                        if let Some(s) = a.as_str() {
                            emit(s);
                        }
                    }
                }
            }),
            config,
        )
        .unwrap();
        (db, store, atts)
    }

    fn small() -> AttachmentsConfig {
        AttachmentsConfig { min_segment: 8, max_segment: 16 }
    }

    #[test]
    fn test_roundtrip_and_hash() {
        let (_db, store, atts) = setup(small());
        assert!(store.put(&Document::new("d", json!({"atts": ["img"]}))).unwrap());

        let payload: Vec<u8> = (0..100u8).collect();
        let mut up = atts.upload("d");
        up.open("img", "application/octet-stream").unwrap();
        up.write(&payload[..30]).unwrap();
        up.write(&payload[30..]).unwrap();
        let hash = up.close().unwrap();
        up.commit().unwrap();

        let mut down = atts.download("d", "img").unwrap().unwrap();
        assert_eq!(down.content_type(), "application/octet-stream");
        assert_eq!(down.hash(), hash);
        assert!(down.meta().segments.len() > 1, "payload must span segments");
        assert_eq!(down.read_to_end().unwrap(), payload);
        assert!(down.verify().unwrap());
        assert_eq!(hash, URL_SAFE_NO_PAD.encode(md5::compute(&payload).0));
    }

    #[test]
    fn test_segment_size_bounds() {
        let (_db, store, atts) = setup(small());
        assert!(store.put(&Document::new("d", json!({"atts": ["big"]}))).unwrap());

        let payload = vec![7u8; 100];
        let mut up = atts.upload("d");
        up.open("big", "bin").unwrap();
        up.write(&payload).unwrap();
        up.close().unwrap();
        up.commit().unwrap();

        let down = atts.download("d", "big").unwrap().unwrap();
        let segs = down.meta().segments.clone();
        assert!(segs.len() >= 100 / 16);
        for (i, _) in segs.iter().enumerate() {
            let chunk = atts.segment("d", "big", i).unwrap().unwrap();
            assert!(chunk.len() <= 16);
        }
    }

    #[test]
    fn test_rollback_on_drop() {
        let (_db, store, atts) = setup(small());
        assert!(store.put(&Document::new("d", json!({"atts": []}))).unwrap());
        {
            let mut up = atts.upload("d");
            up.open("tmp", "bin").unwrap();
            up.write(&[1u8; 64]).unwrap();
            // dropped without commit
        }
        assert!(atts.download("d", "tmp").unwrap().is_none());
        // no stray segment rows survive
        let entries: Vec<_> = atts.scan().unwrap().collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_replace_attachment_frees_old_segments() {
        let (_db, store, atts) = setup(small());
        assert!(store.put(&Document::new("d", json!({"atts": ["a"]}))).unwrap());

        let mut up = atts.upload("d");
        up.open("a", "bin").unwrap();
        up.write(&[1u8; 40]).unwrap();
        up.close().unwrap();
        up.commit().unwrap();
        let first_segs = atts.download("d", "a").unwrap().unwrap().meta().segments.clone();

        let mut up = atts.upload("d");
        up.open("a", "bin").unwrap();
        up.write(&[2u8; 40]).unwrap();
        up.close().unwrap();
        up.commit().unwrap();

        let second_segs = atts.download("d", "a").unwrap().unwrap().meta().segments.clone();
        assert!(first_segs.iter().all(|s| !second_segs.contains(s)));
        for seg in first_segs {
            assert!(
                atts.inner.map.db().get(&atts.inner.map.row_key(&json!(seg))).unwrap().is_none(),
                "replaced segment {seg} must be deleted"
            );
        }
        assert_eq!(atts.download("d", "a").unwrap().unwrap().read_to_end().unwrap(), vec![2u8; 40]);
    }

    #[test]
    fn test_gc_collects_unreferenced_attachments() {
        let (_db, store, atts) = setup(small());
        let mut doc = Document::new("d", json!({"atts": ["keep", "drop"]}));
        assert!(store.put_update(&mut doc).unwrap());

        for att in ["keep", "drop"] {
            let mut up = atts.upload("d");
            up.open(att, "bin").unwrap();
            up.write(&[9u8; 20]).unwrap();
            up.close().unwrap();
            up.commit().unwrap();
        }
        assert_eq!(atts.scan().unwrap().count(), 2);

        doc.content = Some(json!({"atts": ["keep"]}));
        assert!(store.put_update(&mut doc).unwrap());
        assert!(atts.run_gc().unwrap());

        assert!(atts.download("d", "keep").unwrap().is_some());
        assert!(atts.download("d", "drop").unwrap().is_none());
        assert_eq!(atts.scan().unwrap().count(), 1);
    }

    #[test]
    fn test_missing_reports_unuploaded() {
        let (_db, store, atts) = setup(small());
        let doc = Document::new("d", json!({"atts": ["a", "b"]}));
        assert!(store.put(&doc).unwrap());

        let mut up = atts.upload("d");
        up.open("a", "bin").unwrap();
        up.write(b"xxxxxxxxxx").unwrap();
        up.close().unwrap();
        up.commit().unwrap();

        assert_eq!(atts.missing(&doc).unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_pending_replay_cleans_orphans() {
        let (db, store, atts) = setup(small());
        assert!(store.put(&Document::new("d", json!({"atts": ["a"]}))).unwrap());

        let mut up = atts.upload("d");
        up.open("a", "bin").unwrap();
        up.write(&[3u8; 20]).unwrap();
        up.close().unwrap();
        up.commit().unwrap();

        // simulate a crash: an orphaned segment recorded as pending
        let orphan: SegId = 9999;
        let mut batch = WriteBatch::new();
        batch.put(atts.inner.map.row_key(&json!(orphan)), vec![1, 2, 3]);
        let mut pending_val = Vec::new();
        codec::encode_value(&json!([orphan]), &mut pending_val);
        batch.put(atts.inner.map.row_key(&Value::Bool(true)), pending_val);
        db.commit_batch(&mut batch).unwrap();
        drop(atts);

        let atts = Attachments::new(
            &db,
            "blobs",
            1,
            store.clone(),
            Box::new(|_, _| {}),
            small(),
        )
        .unwrap();
        assert!(
            atts.inner.map.db().get(&atts.inner.map.row_key(&json!(orphan))).unwrap().is_none(),
            "orphaned segment must be replayed away"
        );
        // the referenced attachment survives
        assert!(atts.download("d", "a").unwrap().is_some());
    }
}
