//! Append-only store of `{sequence id → JSON}` records.
//!
//! Every write receives a fresh, strictly monotonic sequence id; the
//! resulting log is the change feed every derived component catches up
//! from. Writes can be grouped in a batch that holds the store's
//! exclusive lock for its lifetime — sequence ids are handed out (and
//! observers notified) while the batch is open, so the caller must
//! either commit or drop it promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde_json::Value;

use crate::codec;
use crate::db::{Db, KeySpaceClass, KeySpaceId, Observable, ObserverHandle, make_key};
use crate::error::Result;
use crate::kv::{IterRange, WriteBatch};

/// Monotonically increasing id assigned by the incremental store.
pub type SeqId = u64;

/// Event delivered to incremental-store observers, inside the batch of
/// the write that produced it.
pub struct IncrementalEvent {
    pub seq: SeqId,
    pub payload: Value,
}

struct ListenState {
    epoch: u64,
}

/// The incremental store.
pub struct IncrementalStore {
    db: Db,
    kid: KeySpaceId,
    last_seq: AtomicU64,
    batch_lock: Mutex<()>,
    listen: Condvar,
    listen_state: Mutex<ListenState>,
    observers: Arc<Observable<IncrementalEvent>>,
}

impl IncrementalStore {
    /// Open (or create) the incremental store registered under `name`.
    pub fn open(db: &Db, name: &str) -> Result<IncrementalStore> {
        let kid = db.alloc_keyspace(KeySpaceClass::IncrementalStore, name)?;
        let observers = db.observable::<IncrementalEvent>(kid);
        let last_seq = Self::recover_seq(db, kid)?;
        Ok(IncrementalStore {
            db: db.clone(),
            kid,
            last_seq: AtomicU64::new(last_seq),
            batch_lock: Mutex::new(()),
            listen: Condvar::new(),
            listen_state: Mutex::new(ListenState { epoch: 0 }),
            observers,
        })
    }

    /// Recover the sequence counter by seeking to the last key of the
    /// keyspace. An empty store starts at 1.
    fn recover_seq(db: &Db, kid: KeySpaceId) -> Result<SeqId> {
        let range = IterRange::new(vec![kid + 1], vec![kid]).exclude_begin().exclude_end();
        let mut iter = db.iter(range)?;
        match iter.next() {
            Some((key, _)) => codec::read_seq(&key[1..]),
            None => Ok(1),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn keyspace(&self) -> KeySpaceId {
        self.kid
    }

    /// Last assigned sequence id.
    pub fn seq(&self) -> SeqId {
        self.last_seq.load(Ordering::SeqCst)
    }

    fn seq_key(&self, seq: SeqId) -> Vec<u8> {
        let mut content = Vec::with_capacity(8);
        codec::push_seq(&mut content, seq);
        make_key(self.kid, &content)
    }

    /// Store a record on its own, committing immediately.
    pub fn put(&self, payload: &Value) -> Result<SeqId> {
        let mut batch = self.create_batch();
        let seq = self.put_batch(&mut batch, payload);
        batch.commit()?;
        Ok(seq)
    }

    /// Store a record into an open batch. The sequence id is assigned
    /// (and observers run) immediately, even though the physical write
    /// only happens at commit.
    pub fn put_batch(&self, batch: &mut IncrementalBatch<'_>, payload: &Value) -> SeqId {
        let seq = self.last_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut value = Vec::new();
        codec::encode_value(payload, &mut value);
        batch.batch.put(self.seq_key(seq), value);
        if !self.observers.is_empty() {
            let event = IncrementalEvent { seq, payload: payload.clone() };
            self.observers.broadcast(&mut batch.batch, &event);
        }
        // taking the listen lock orders the counter bump before any
        // waiter's re-check, so no wakeup is lost
        drop(self.listen_state.lock());
        self.listen.notify_all();
        seq
    }

    /// Fetch the record stored under `seq`.
    pub fn get(&self, seq: SeqId) -> Result<Option<Value>> {
        self.get_at(&self.db, seq)
    }

    pub(crate) fn get_at(&self, db: &Db, seq: SeqId) -> Result<Option<Value>> {
        match db.get(&self.seq_key(seq))? {
            Some(bytes) => Ok(Some(codec::decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a record, committing immediately. Erases are not observed.
    pub fn erase(&self, seq: SeqId) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.erase_batch(&mut batch, seq);
        self.db.commit_batch(&mut batch)
    }

    /// Record an erase into any batch.
    pub fn erase_batch(&self, batch: &mut WriteBatch, seq: SeqId) {
        batch.delete(self.seq_key(seq));
    }

    /// Iterate records with sequence ids strictly greater than `from`.
    pub fn scan_from(&self, from: SeqId) -> Result<IncrementalIterator> {
        self.scan_from_at(&self.db, from)
    }

    pub(crate) fn scan_from_at(&self, db: &Db, from: SeqId) -> Result<IncrementalIterator> {
        let range = IterRange::new(self.seq_key(from), vec![self.kid + 1])
            .exclude_begin()
            .exclude_end();
        Ok(IncrementalIterator { raw: db.iter(range)? })
    }

    /// Open an exclusive write batch. At most one batch exists at a
    /// time; dropping it without [`IncrementalBatch::commit`] discards
    /// the buffered writes (assigned sequence ids stay consumed).
    pub fn create_batch(&self) -> IncrementalBatch<'_> {
        IncrementalBatch { _guard: self.batch_lock.lock(), batch: WriteBatch::new(), db: self.db.clone() }
    }

    /// Register an observer fired on every put with the producer's
    /// batch; return `false` from the callback to unsubscribe.
    pub fn add_observer(
        &self,
        f: impl FnMut(&mut WriteBatch, &IncrementalEvent) -> bool + Send + 'static,
    ) -> ObserverHandle {
        self.observers.add(f)
    }

    pub fn remove_observer(&self, h: ObserverHandle) {
        self.observers.remove(h);
    }

    /// Block until a record newer than `since` exists. Returns `false`
    /// when the wait was cancelled or timed out.
    pub fn wait_for_changes(&self, since: SeqId, timeout: Option<Duration>) -> bool {
        let mut state = self.listen_state.lock();
        let epoch = state.epoch;
        loop {
            if self.seq() > since {
                return true;
            }
            if state.epoch != epoch {
                return false;
            }
            match timeout {
                Some(t) => {
                    if self.listen.wait_for(&mut state, t).timed_out() {
                        return self.seq() > since;
                    }
                }
                None => self.listen.wait(&mut state),
            }
        }
    }

    /// Wake every waiter with a cancelled signal.
    pub fn cancel_listen(&self) {
        let mut state = self.listen_state.lock();
        state.epoch += 1;
        self.listen.notify_all();
    }
}

impl Drop for IncrementalStore {
    fn drop(&mut self) {
        self.cancel_listen();
    }
}

/// RAII write batch holding the store's exclusive lock.
pub struct IncrementalBatch<'a> {
    _guard: MutexGuard<'a, ()>,
    batch: WriteBatch,
    db: Db,
}

impl IncrementalBatch<'_> {
    /// Access the underlying batch to piggyback additional writes that
    /// must commit atomically with the store's records.
    pub fn batch(&mut self) -> &mut WriteBatch {
        &mut self.batch
    }

    /// Commit all buffered writes and release the store lock.
    pub fn commit(mut self) -> Result<()> {
        self.db.commit_batch(&mut self.batch)
    }
}

/// Iterator over `(seq, payload)` records.
pub struct IncrementalIterator {
    raw: crate::db::RawIterator,
}

impl Iterator for IncrementalIterator {
    type Item = Result<(SeqId, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.raw.next()?;
        Some(
            codec::read_seq(&key[1..])
                .and_then(|seq| Ok((seq, codec::decode_value(&value)?))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (Db, IncrementalStore) {
        let db = Db::in_memory();
        let inc = IncrementalStore::open(&db, "log").unwrap();
        (db, inc)
    }

    #[test]
    fn test_put_get_scan() {
        let (_db, inc) = store();
        let first = inc.put(&json!({"n": 1})).unwrap();
        let second = inc.put(&json!({"n": 2})).unwrap();
        assert!(second > first);
        assert_eq!(inc.seq(), second);

        assert_eq!(inc.get(first).unwrap(), Some(json!({"n": 1})));
        assert_eq!(inc.get(9999).unwrap(), None);

        let rows: Vec<_> = inc.scan_from(first).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(rows, vec![(second, json!({"n": 2}))]);
        let all: Vec<_> = inc.scan_from(0).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_seq_recovery_after_reopen() {
        let db = Db::in_memory();
        let last = {
            let inc = IncrementalStore::open(&db, "log").unwrap();
            inc.put(&json!("a")).unwrap();
            inc.put(&json!("b")).unwrap()
        };
        let inc = IncrementalStore::open(&db, "log").unwrap();
        assert_eq!(inc.seq(), last);
        let next = inc.put(&json!("c")).unwrap();
        assert!(next > last);
    }

    #[test]
    fn test_erase_and_batch_discard() {
        let (_db, inc) = store();
        let seq = inc.put(&json!("x")).unwrap();
        inc.erase(seq).unwrap();
        assert_eq!(inc.get(seq).unwrap(), None);

        let discarded = {
            let mut batch = inc.create_batch();
            inc.put_batch(&mut batch, &json!("never"))
            // dropped without commit
        };
        assert_eq!(inc.get(discarded).unwrap(), None);
        // the sequence id stays consumed
        assert!(inc.put(&json!("after")).unwrap() > discarded);
    }

    #[test]
    fn test_observer_rides_the_batch() {
        let (db, inc) = store();
        let marker_kid = 99u8;
        let handle = inc.add_observer(move |batch, event| {
            batch.put(make_key(marker_kid, b"seen"), event.seq.to_be_bytes().to_vec());
            true
        });

        let seq = inc.put(&json!("payload")).unwrap();
        let marker = db.get(&make_key(marker_kid, b"seen")).unwrap();
        assert_eq!(marker, Some(seq.to_be_bytes().to_vec()));
        inc.remove_observer(handle);
    }

    #[test]
    fn test_wait_for_changes_and_cancel() {
        let (_db, inc) = store();
        let seen = inc.seq();
        assert!(!inc.wait_for_changes(seen, Some(Duration::from_millis(10))));
        inc.put(&json!(1)).unwrap();
        assert!(inc.wait_for_changes(seen, Some(Duration::from_millis(10))));
    }
}
