//! Ordered map of JSON keys to JSON values.
//!
//! A simpler cousin of the view: one row per key, no document ids, no
//! reverse index. [`JsonMapView`] is the read surface; [`JsonMap`] adds
//! direct writes with change observers. Maps are the building block the
//! attachment store keeps its rows in, and a convenient place for any
//! derived state that is not tied to single documents.

use std::sync::Arc;

use serde_json::Value;

use crate::codec;
use crate::db::{ClassId, Db, KeySpaceClass, KeySpaceId, Observable, ObserverHandle, keyspace_range};
use crate::error::Result;
use crate::kv::{IterRange, SnapshotMode, WriteBatch};

/// One row of a map query.
#[derive(Debug, Clone, PartialEq)]
pub struct MapRow {
    pub key: Value,
    pub value: Value,
}

/// Read-only surface over a map keyspace.
#[derive(Clone)]
pub struct JsonMapView {
    db: Db,
    kid: KeySpaceId,
}

impl JsonMapView {
    /// Open (or create) the map registered under `name`.
    pub fn open(db: &Db, name: &str) -> Result<JsonMapView> {
        JsonMapView::open_class(db, KeySpaceClass::JsonMap.id(), name)
    }

    /// Open under an explicit class; components embedding a map (such as
    /// the attachment store) register it under their own class.
    pub fn open_class(db: &Db, class: ClassId, name: &str) -> Result<JsonMapView> {
        let kid = db.alloc_keyspace_raw(class, name)?;
        Ok(JsonMapView { db: db.clone(), kid })
    }

    /// Rebind this view onto another handle (typically a snapshot).
    pub fn at(&self, db: &Db) -> JsonMapView {
        JsonMapView { db: db.clone(), kid: self.kid }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn kid(&self) -> KeySpaceId {
        self.kid
    }

    pub(crate) fn row_key(&self, key: &Value) -> Vec<u8> {
        let mut k = vec![self.kid];
        codec::encode_key(key, &mut k);
        k
    }

    /// Point lookup.
    pub fn lookup(&self, key: &Value) -> Result<Option<Value>> {
        match self.db.get(&self.row_key(key))? {
            Some(bytes) => Ok(Some(codec::decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Alias of [`JsonMapView::lookup`]; keys are unique here.
    pub fn find(&self, key: &Value) -> Result<Option<Value>> {
        self.lookup(key)
    }

    fn snapshot_iter(&self, range: IterRange) -> Result<MapIterator> {
        let snap = self.db.snapshot(SnapshotMode::WriteError);
        Ok(MapIterator { raw: snap.iter(range)?, filter: None })
    }

    /// Rows between two keys; backward when `from > to`, the greater
    /// endpoint included only with `include_upper`.
    pub fn range(&self, from: &Value, to: &Value, include_upper: bool) -> Result<MapIterator> {
        let from_key = self.row_key(from);
        let to_key = self.row_key(to);
        let backward = from_key > to_key;
        let range = if backward {
            let mut r = IterRange::new(from_key, to_key);
            if !include_upper {
                r = r.exclude_begin();
            }
            r
        } else {
            let mut r = IterRange::new(from_key, to_key);
            if !include_upper {
                r = r.exclude_end();
            }
            r
        };
        self.snapshot_iter(range)
    }

    /// Rows whose key extends `key`.
    pub fn prefix(&self, key: &Value, backward: bool) -> Result<MapIterator> {
        let mut begin = vec![self.kid];
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

    /// Every row of the map.
    pub fn scan(&self, backward: bool) -> Result<MapIterator> {
        let range = keyspace_range(self.kid);
        let range = if backward {
            IterRange::new(range.to, range.from).exclude_begin()
        } else {
            range
        };
        self.snapshot_iter(range)
    }

    /// Forward scan over an explicit byte range, end exclusive. For
    /// components that lay out several row kinds in one map keyspace.
    pub(crate) fn scan_bytes(&self, begin: Vec<u8>, end: Vec<u8>) -> Result<MapIterator> {
        self.snapshot_iter(IterRange::new(begin, end).exclude_end())
    }

    /// Scan starting at `from_key` (exclusive), to the end of the map.
    pub fn scan_from(&self, from_key: &Value, backward: bool) -> Result<MapIterator> {
        let start = self.row_key(from_key);
        let full = keyspace_range(self.kid);
        let range = if backward {
            IterRange::new(start, full.from).exclude_begin()
        } else {
            IterRange::new(start, full.to).exclude_begin().exclude_end()
        };
        self.snapshot_iter(range)
    }
}

/// A map with direct writes and change observers.
pub struct JsonMap {
    view: JsonMapView,
    observers: Arc<Observable<Value>>,
}

impl JsonMap {
    pub fn open(db: &Db, name: &str) -> Result<JsonMap> {
        JsonMap::open_class(db, KeySpaceClass::JsonMap.id(), name)
    }

    pub fn open_class(db: &Db, class: ClassId, name: &str) -> Result<JsonMap> {
        let view = JsonMapView::open_class(db, class, name)?;
        let observers = db.observable::<Value>(view.kid());
        Ok(JsonMap { view, observers })
    }

    /// The read surface of this map.
    pub fn view(&self) -> &JsonMapView {
        &self.view
    }

    /// Set `key` to `value`, committing immediately.
    pub fn set(&self, key: &Value, value: &Value) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.set_batch(&mut batch, key, value);
        self.view.db().commit_batch(&mut batch)
    }

    /// Record a set into `batch` and notify observers inside it.
    pub fn set_batch(&self, batch: &mut WriteBatch, key: &Value, value: &Value) {
        let mut val = Vec::new();
        codec::encode_value(value, &mut val);
        batch.put(self.view.row_key(key), val);
        if !self.observers.is_empty() {
            self.observers.broadcast(batch, key);
        }
    }

    /// Delete `key`, committing immediately.
    pub fn erase(&self, key: &Value) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.erase_batch(&mut batch, key);
        self.view.db().commit_batch(&mut batch)
    }

    /// Record a delete into `batch` and notify observers inside it.
    pub fn erase_batch(&self, batch: &mut WriteBatch, key: &Value) {
        batch.delete(self.view.row_key(key));
        if !self.observers.is_empty() {
            self.observers.broadcast(batch, key);
        }
    }

    /// Drop every row.
    pub fn clear(&self) -> Result<()> {
        self.view.db().clear_keyspace(self.view.kid())
    }

    /// Observe changed keys, inside the writer's batch; return `false`
    /// to unsubscribe.
    pub fn add_observer(
        &self,
        f: impl FnMut(&mut WriteBatch, &Value) -> bool + Send + 'static,
    ) -> ObserverHandle {
        self.observers.add(f)
    }

    pub fn remove_observer(&self, h: ObserverHandle) {
        self.observers.remove(h);
    }
}

impl std::ops::Deref for JsonMap {
    type Target = JsonMapView;

    fn deref(&self) -> &JsonMapView {
        &self.view
    }
}

type MapRowFilter = Box<dyn FnMut(&MapRow) -> bool + Send>;

/// Iterator over map rows.
pub struct MapIterator {
    raw: crate::db::RawIterator,
    filter: Option<MapRowFilter>,
}

impl MapIterator {
    /// Keep only rows the predicate accepts.
    pub fn with_filter(mut self, f: impl FnMut(&MapRow) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(f));
        self
    }
}

impl Iterator for MapIterator {
    type Item = Result<MapRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = self.raw.next()?;
            let parsed = codec::decode_key(&key[1..])
                .and_then(|(k, _)| Ok(MapRow { key: k, value: codec::decode_value(&value)? }));
            match parsed {
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
