//! Core database handle.
//!
//! [`Db`] multiplexes unrelated logical tables into one physical
//! key-value namespace. Every key starts with a one-byte keyspace id;
//! the reserved id `0xFF` holds the keyspace directory itself:
//!
//! ```text
//! FF <class> <name…>  ->  <kid>          directory entry
//! FF FF <kid>         ->  <metadata>     reverse entry + metadata
//! ```
//!
//! The handle is cheap to clone and shares the directory lock, the soft
//! keyspace locks and the per-keyspace observer registries with all its
//! clones — including snapshot handles, so a derived component can read
//! from a snapshot while staying registered on the live database.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use serde_json::Value;

use crate::codec;
use crate::error::{Result, SepalError};
use crate::kv::{IterRange, KvEngine, KvIter, SnapshotMode, WriteBatch};

/// Identifies a logical keyspace; the first byte of every key.
pub type KeySpaceId = u8;
/// Identifies the component class that owns a keyspace.
pub type ClassId = u8;

/// The reserved keyspace holding the directory.
pub const KEYSPACE_MANAGER: KeySpaceId = 0xFF;

/// Batched deletes and long updates flush once they reach this size.
pub(crate) const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Well-known component classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeySpaceClass {
    IncrementalStore = 1,
    Document = 2,
    Graveyard = 3,
    View = 4,
    Filter = 5,
    JsonMap = 6,
    Attachments = 7,
}

impl KeySpaceClass {
    pub fn id(self) -> ClassId {
        self as ClassId
    }
}

/// Directory information about an allocated keyspace.
#[derive(Debug, Clone)]
pub struct KeySpaceInfo {
    pub id: KeySpaceId,
    pub class_id: ClassId,
    pub name: String,
    pub metadata: Value,
}

/// Registration handle returned by [`Observable::add`].
pub type ObserverHandle = u64;

type ObserverFn<T> = Box<dyn FnMut(&mut WriteBatch, &T) -> bool + Send>;

/// Multi-subscriber event channel attached to a keyspace.
///
/// Callbacks run synchronously on the writer's thread, inside the
/// writer's batch, so their writes commit atomically with the upstream
/// write. A callback returning `false` is unsubscribed.
pub struct Observable<T> {
    inner: Mutex<ObservableInner<T>>,
}

struct ObservableInner<T> {
    next: ObserverHandle,
    list: Vec<(ObserverHandle, ObserverFn<T>)>,
}

impl<T> Observable<T> {
    fn new() -> Self {
        Observable { inner: Mutex::new(ObservableInner { next: 1, list: Vec::new() }) }
    }

    pub fn add(&self, f: impl FnMut(&mut WriteBatch, &T) -> bool + Send + 'static) -> ObserverHandle {
        let mut inner = self.inner.lock();
        let h = inner.next;
        inner.next += 1;
        inner.list.push((h, Box::new(f)));
        h
    }

    pub fn remove(&self, h: ObserverHandle) {
        self.inner.lock().list.retain(|(id, _)| *id != h);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().list.is_empty()
    }

    /// Invoke every observer in registration order; observers that
    /// return `false` are dropped before the next broadcast.
    pub fn broadcast(&self, batch: &mut WriteBatch, event: &T) {
        let mut inner = self.inner.lock();
        inner.list.retain_mut(|(_, f)| f(batch, event));
    }
}

struct DbShared {
    directory: Mutex<()>,
    locked: Mutex<AHashSet<KeySpaceId>>,
    observers: Mutex<AHashMap<KeySpaceId, Arc<dyn Any + Send + Sync>>>,
}

/// Handle to an open database (or to a snapshot of one).
#[derive(Clone)]
pub struct Db {
    engine: Arc<dyn KvEngine>,
    shared: Arc<DbShared>,
    sync_writes: bool,
}

impl Db {
    /// Open a database over an engine.
    pub fn open(engine: Arc<dyn KvEngine>) -> Db {
        Db::open_with(engine, false)
    }

    /// Open a database over an engine, choosing write durability.
    pub fn open_with(engine: Arc<dyn KvEngine>, sync_writes: bool) -> Db {
        Db {
            engine,
            shared: Arc::new(DbShared {
                directory: Mutex::new(()),
                locked: Mutex::new(AHashSet::new()),
                observers: Mutex::new(AHashMap::new()),
            }),
            sync_writes,
        }
    }

    /// Open a fresh in-memory database. Convenient for embedding and
    /// tests.
    pub fn in_memory() -> Db {
        Db::open(Arc::new(crate::kv::MemoryEngine::new()))
    }

    /// Create a handle over a consistent point-in-time view. The
    /// directory state (locks, observers) stays shared with the live
    /// handle.
    pub fn snapshot(&self, mode: SnapshotMode) -> Db {
        Db { engine: self.engine.snapshot(mode), shared: self.shared.clone(), sync_writes: self.sync_writes }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.engine.get(key)
    }

    pub fn commit_batch(&self, batch: &mut WriteBatch) -> Result<()> {
        self.engine.write(batch, self.sync_writes)
    }

    pub fn iter(&self, range: IterRange) -> Result<RawIterator> {
        Ok(RawIterator { inner: self.engine.iter(range)?, filters: Vec::new() })
    }

    pub fn compact(&self) -> Result<()> {
        self.engine.compact_range(None, None)
    }

    // ── keyspace directory ──────────────────────────────────────────

    /// Allocate (or look up) the keyspace registered for
    /// `(class, name)`. Ids are recycled lowest-first; the scan is
    /// linear, which is fine for a one-byte id space.
    pub fn alloc_keyspace(&self, class: KeySpaceClass, name: &str) -> Result<KeySpaceId> {
        self.alloc_keyspace_raw(class.id(), name)
    }

    pub fn alloc_keyspace_raw(&self, class_id: ClassId, name: &str) -> Result<KeySpaceId> {
        let _guard = self.shared.directory.lock();
        if let Some(existing) = self.get(&dir_key(class_id, name))? {
            return decode_kid(&existing);
        }
        let mut kid = 0;
        loop {
            if kid == KEYSPACE_MANAGER {
                return Err(SepalError::TooManyKeyspaces);
            }
            if self.get(&meta_key(kid))?.is_none() {
                break;
            }
            kid += 1;
        }
        let mut batch = WriteBatch::new();
        batch.put(meta_key(kid), Vec::new());
        batch.put(dir_key(class_id, name), vec![kid]);
        self.commit_batch(&mut batch)?;
        log::debug!("allocated keyspace {kid} for class {class_id} name {name:?}");
        Ok(kid)
    }

    /// Release a keyspace and delete its entire contents. Fails with
    /// [`SepalError::KeyspaceLocked`] while a live component holds the
    /// soft lock. Returns `false` when `(class, name)` is not
    /// registered.
    pub fn free_keyspace(&self, class: KeySpaceClass, name: &str) -> Result<bool> {
        self.free_keyspace_raw(class.id(), name)
    }

    pub fn free_keyspace_raw(&self, class_id: ClassId, name: &str) -> Result<bool> {
        let _guard = self.shared.directory.lock();
        let Some(existing) = self.get(&dir_key(class_id, name))? else {
            return Ok(false);
        };
        let kid = decode_kid(&existing)?;
        if self.shared.locked.lock().contains(&kid) {
            return Err(SepalError::KeyspaceLocked(kid));
        }
        self.clear_keyspace(kid)?;
        let mut batch = WriteBatch::new();
        batch.delete(meta_key(kid));
        batch.delete(dir_key(class_id, name));
        self.commit_batch(&mut batch)?;
        self.shared.observers.lock().remove(&kid);
        log::debug!("freed keyspace {kid} ({name:?})");
        Ok(true)
    }

    /// Delete every key of a keyspace, flushing in bounded batches so an
    /// arbitrarily large keyspace never builds an unbounded batch.
    pub fn clear_keyspace(&self, kid: KeySpaceId) -> Result<()> {
        let mut batch = WriteBatch::new();
        let mut iter = self.iter(keyspace_range(kid))?;
        while let Some((key, _)) = iter.next() {
            batch.delete(key);
            if batch.approximate_size() > FLUSH_THRESHOLD {
                self.commit_batch(&mut batch)?;
            }
        }
        self.commit_batch(&mut batch)
    }

    /// Enumerate allocated keyspaces.
    pub fn list_keyspaces(&self) -> Result<KeySpaceIterator> {
        // Directory entries live between FF 00 and FF FF; the reverse
        // rows (FF FF …) sort past the end key and are skipped.
        let range = IterRange::new(vec![KEYSPACE_MANAGER, 0], vec![KEYSPACE_MANAGER, 0xFF]).exclude_end();
        Ok(KeySpaceIterator { db: self.clone(), raw: self.iter(range)? })
    }

    /// Look up the keyspace registered for `(class, name)`.
    pub fn find_keyspace(&self, class_id: ClassId, name: &str) -> Result<Option<KeySpaceId>> {
        match self.get(&dir_key(class_id, name))? {
            Some(v) => Ok(Some(decode_kid(&v)?)),
            None => Ok(None),
        }
    }

    /// Store metadata alongside a keyspace definition.
    pub fn put_keyspace_metadata(&self, kid: KeySpaceId, data: &Value) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.put_keyspace_metadata_batch(&mut batch, kid, data);
        self.commit_batch(&mut batch)
    }

    /// Batched variant of [`Db::put_keyspace_metadata`].
    pub fn put_keyspace_metadata_batch(&self, batch: &mut WriteBatch, kid: KeySpaceId, data: &Value) {
        let mut val = Vec::new();
        codec::encode_value(data, &mut val);
        batch.put(meta_key(kid), val);
    }

    /// Metadata stored for a keyspace, `None` when absent or never set.
    pub fn keyspace_metadata(&self, kid: KeySpaceId) -> Result<Option<Value>> {
        match self.get(&meta_key(kid))? {
            Some(v) if !v.is_empty() => Ok(Some(codec::decode_value(&v)?)),
            _ => Ok(None),
        }
    }

    /// Take or release the in-memory soft lock of a keyspace. Returns
    /// `false` when taking a lock that is already held.
    pub fn keyspace_lock(&self, kid: KeySpaceId, lock: bool) -> bool {
        let mut locked = self.shared.locked.lock();
        if lock { locked.insert(kid) } else { locked.remove(&kid) || true }
    }

    /// Approximate byte size of a keyspace.
    pub fn keyspace_size(&self, kid: KeySpaceId) -> Result<u64> {
        let range = keyspace_range(kid);
        let sizes = self.engine.approximate_sizes(&[(range.from, range.to)])?;
        Ok(sizes.first().copied().unwrap_or(0))
    }

    /// The observer channel of a keyspace, created on first use. The
    /// event type is fixed by the component owning the keyspace.
    pub fn observable<T: Send + Sync + 'static>(&self, kid: KeySpaceId) -> Arc<Observable<T>> {
        let mut map = self.shared.observers.lock();
        let entry = map
            .entry(kid)
            .or_insert_with(|| Arc::new(Observable::<T>::new()) as Arc<dyn Any + Send + Sync>);
        match entry.clone().downcast::<Observable<T>>() {
            Ok(obs) => obs,
            Err(_) => {
                // A keyspace has exactly one owner class, so a type
                // mismatch means the id was recycled; replace the
                // registry.
                let obs = Arc::new(Observable::<T>::new());
                *entry = obs.clone() as Arc<dyn Any + Send + Sync>;
                obs
            }
        }
    }
}

fn dir_key(class_id: ClassId, name: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(2 + name.len());
    k.push(KEYSPACE_MANAGER);
    k.push(class_id);
    k.extend_from_slice(name.as_bytes());
    k
}

fn meta_key(kid: KeySpaceId) -> Vec<u8> {
    vec![KEYSPACE_MANAGER, KEYSPACE_MANAGER, kid]
}

fn decode_kid(value: &[u8]) -> Result<KeySpaceId> {
    value.first().copied().ok_or_else(|| SepalError::decode("empty keyspace directory entry"))
}

/// Full range of one keyspace, end exclusive.
pub(crate) fn keyspace_range(kid: KeySpaceId) -> IterRange {
    // The manager keyspace is the last one; its scans stay inside the
    // directory layout and never need an upper sibling.
    let to = if kid == KEYSPACE_MANAGER { vec![0xFF, 0xFF, 0xFF, 0xFF] } else { vec![kid + 1] };
    IterRange::new(vec![kid], to).exclude_end()
}

/// Build a key `<kid><content>`.
pub(crate) fn make_key(kid: KeySpaceId, content: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + content.len());
    k.push(kid);
    k.extend_from_slice(content);
    k
}

type RowFilter = Box<dyn FnMut(&[u8], &[u8]) -> bool + Send>;

/// Iterator over raw `(key, value)` pairs with optional row filters.
pub struct RawIterator {
    inner: Box<dyn KvIter>,
    filters: Vec<RowFilter>,
}

impl RawIterator {
    /// Add a predicate; rows it rejects become invisible.
    pub fn add_filter(&mut self, f: impl FnMut(&[u8], &[u8]) -> bool + Send + 'static) {
        self.filters.push(Box::new(f));
    }
}

impl Iterator for RawIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (k, v) = self.inner.next_entry()?;
            if self.filters.iter_mut().all(|f| f(&k, &v)) {
                return Some((k, v));
            }
        }
    }
}

/// Iterator over the keyspace directory.
pub struct KeySpaceIterator {
    db: Db,
    raw: RawIterator,
}

impl Iterator for KeySpaceIterator {
    type Item = Result<KeySpaceInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.raw.next()?;
        Some(self.parse(&key, &value))
    }
}

impl KeySpaceIterator {
    fn parse(&self, key: &[u8], value: &[u8]) -> Result<KeySpaceInfo> {
        if key.len() < 2 {
            return Err(SepalError::decode("short keyspace directory key"));
        }
        let class_id = key[1];
        let name = String::from_utf8(key[2..].to_vec())
            .map_err(|_| SepalError::decode("keyspace name is not utf-8"))?;
        let id = decode_kid(value)?;
        let metadata = self.db.keyspace_metadata(id)?.unwrap_or(Value::Null);
        Ok(KeySpaceInfo { id, class_id, name, metadata })
    }
}

thread_local! {
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(256));
}

/// Run `f` with the thread-local scratch buffer, cleared. The buffer
/// must not escape the closure and `with_buffer` must not be nested.
pub(crate) fn with_buffer<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    SCRATCH.with(|cell| {
        let mut buf = cell.borrow_mut();
        buf.clear();
        f(&mut buf)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_alloc_is_idempotent_and_lowest_free() {
        let db = Db::in_memory();
        let a = db.alloc_keyspace(KeySpaceClass::View, "one").unwrap();
        let b = db.alloc_keyspace(KeySpaceClass::View, "two").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(db.alloc_keyspace(KeySpaceClass::View, "one").unwrap(), a);

        // freeing recycles the id
        assert!(db.free_keyspace(KeySpaceClass::View, "one").unwrap());
        let c = db.alloc_keyspace(KeySpaceClass::JsonMap, "three").unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_free_clears_contents() {
        let db = Db::in_memory();
        let kid = db.alloc_keyspace(KeySpaceClass::JsonMap, "data").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(make_key(kid, b"k"), b"v".to_vec());
        db.commit_batch(&mut batch).unwrap();

        assert!(db.free_keyspace(KeySpaceClass::JsonMap, "data").unwrap());
        let again = db.alloc_keyspace(KeySpaceClass::JsonMap, "data").unwrap();
        assert_eq!(again, kid);
        let rows: Vec<_> = db.iter(keyspace_range(kid)).unwrap().collect();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_locked_keyspace_refuses_free() {
        let db = Db::in_memory();
        db.alloc_keyspace(KeySpaceClass::View, "held").unwrap();
        let kid = db.find_keyspace(KeySpaceClass::View.id(), "held").unwrap().unwrap();
        assert!(db.keyspace_lock(kid, true));
        assert!(matches!(
            db.free_keyspace(KeySpaceClass::View, "held"),
            Err(SepalError::KeyspaceLocked(k)) if k == kid
        ));
        db.keyspace_lock(kid, false);
        assert!(db.free_keyspace(KeySpaceClass::View, "held").unwrap());
    }

    #[test]
    fn test_metadata_and_listing() {
        let db = Db::in_memory();
        let kid = db.alloc_keyspace(KeySpaceClass::Document, "docs").unwrap();
        assert_eq!(db.keyspace_metadata(kid).unwrap(), None);
        db.put_keyspace_metadata(kid, &json!({"seq": 7})).unwrap();
        assert_eq!(db.keyspace_metadata(kid).unwrap(), Some(json!({"seq": 7})));

        let infos: Vec<_> = db.list_keyspaces().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "docs");
        assert_eq!(infos[0].class_id, KeySpaceClass::Document.id());
        assert_eq!(infos[0].metadata, json!({"seq": 7}));
    }

    #[test]
    fn test_observable_broadcast_and_unsubscribe() {
        let db = Db::in_memory();
        let obs = db.observable::<u32>(3);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        obs.add(move |_, v| {
            s1.lock().push(("a", *v));
            true
        });
        let s2 = seen.clone();
        obs.add(move |_, v| {
            s2.lock().push(("b", *v));
            false // one-shot
        });

        let mut batch = WriteBatch::new();
        obs.broadcast(&mut batch, &1);
        obs.broadcast(&mut batch, &2);
        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("a", 2)]);
    }

    #[test]
    fn test_exhausted_keyspaces() {
        let db = Db::in_memory();
        for i in 0..255 {
            db.alloc_keyspace(KeySpaceClass::View, &format!("ks{i}")).unwrap();
        }
        assert!(matches!(
            db.alloc_keyspace(KeySpaceClass::View, "overflow"),
            Err(SepalError::TooManyKeyspaces)
        ));
    }
}
