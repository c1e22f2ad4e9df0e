//! In-memory reference implementation of the engine contract.
//!
//! Backed by a `BTreeMap` behind an `RwLock`. Iterators and snapshots
//! materialize their view at creation time, which gives them the same
//! isolation an LSM iterator gets from its implicit snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, SepalError};
use crate::kv::{BatchOp, EngineConfig, IterRange, KvEngine, KvIter, SnapshotMode, WriteBatch};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Reference in-memory engine. Cloning shares the underlying store.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

struct Inner {
    data: RwLock<Map>,
    config: EngineConfig,
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        MemoryEngine { inner: Arc::new(Inner { data: RwLock::new(Map::new()), config }) }
    }

    /// Number of live keys. Test helper.
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn log(&self, msg: &str) {
        if let Some(logger) = &self.inner.config.logger {
            logger(msg);
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        MemoryEngine::new()
    }
}

fn apply(map: &mut Map, batch: &mut WriteBatch) {
    for op in batch.ops() {
        match op {
            BatchOp::Put(k, v) => {
                map.insert(k.clone(), v.clone());
            }
            BatchOp::Delete(k) => {
                map.remove(k);
            }
        }
    }
    batch.clear();
}

fn materialize(map: &Map, range: &IterRange) -> Vec<(Vec<u8>, Vec<u8>)> {
    let descending = range.from > range.to;
    let (lo, hi) = if descending { (&range.to, &range.from) } else { (&range.from, &range.to) };
    let mut rows: Vec<(Vec<u8>, Vec<u8>)> = map
        .range::<Vec<u8>, _>(lo.clone()..=hi.clone())
        .filter(|(k, _)| {
            !(range.exclude_begin && *k == &range.from) && !(range.exclude_end && *k == &range.to)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if descending {
        rows.reverse();
    }
    rows
}

struct MemoryIter {
    rows: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl KvIter for MemoryIter {
    fn next_entry(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.rows.next()
    }
}

impl KvEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.data.read().get(key).cloned())
    }

    fn write(&self, batch: &mut WriteBatch, _sync: bool) -> Result<()> {
        apply(&mut self.inner.data.write(), batch);
        Ok(())
    }

    fn iter(&self, range: IterRange) -> Result<Box<dyn KvIter>> {
        let rows = materialize(&self.inner.data.read(), &range);
        Ok(Box::new(MemoryIter { rows: rows.into_iter() }))
    }

    fn snapshot(&self, mode: SnapshotMode) -> Arc<dyn KvEngine> {
        let data = Arc::new(self.inner.data.read().clone());
        Arc::new(MemorySnapshot { data, mode, live: self.clone() })
    }

    fn approximate_sizes(&self, ranges: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<u64>> {
        let map = self.inner.data.read();
        Ok(ranges
            .iter()
            .map(|(from, to)| {
                map.range::<Vec<u8>, _>(from.clone()..to.clone())
                    .map(|(k, v)| (k.len() + v.len()) as u64)
                    .sum()
            })
            .collect())
    }

    fn compact_range(&self, _from: Option<&[u8]>, _to: Option<&[u8]>) -> Result<()> {
        // Nothing to compact in a BTreeMap; kept for contract parity.
        self.log("compact_range: no-op on memory engine");
        Ok(())
    }
}

struct MemorySnapshot {
    data: Arc<Map>,
    mode: SnapshotMode,
    live: MemoryEngine,
}

impl KvEngine for MemorySnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn write(&self, batch: &mut WriteBatch, sync: bool) -> Result<()> {
        match self.mode {
            SnapshotMode::WriteError => Err(SepalError::SnapshotWriteRejected),
            SnapshotMode::WriteIgnore => {
                batch.clear();
                Ok(())
            }
            SnapshotMode::WriteForward => self.live.write(batch, sync),
        }
    }

    fn iter(&self, range: IterRange) -> Result<Box<dyn KvIter>> {
        let rows = materialize(&self.data, &range);
        Ok(Box::new(MemoryIter { rows: rows.into_iter() }))
    }

    fn snapshot(&self, mode: SnapshotMode) -> Arc<dyn KvEngine> {
        Arc::new(MemorySnapshot { data: self.data.clone(), mode, live: self.live.clone() })
    }

    fn approximate_sizes(&self, ranges: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<u64>> {
        Ok(ranges
            .iter()
            .map(|(from, to)| {
                self.data
                    .range::<Vec<u8>, _>(from.clone()..to.clone())
                    .map(|(k, v)| (k.len() + v.len()) as u64)
                    .sum()
            })
            .collect())
    }

    fn compact_range(&self, _from: Option<&[u8]>, _to: Option<&[u8]>) -> Result<()> {
        match self.mode {
            SnapshotMode::WriteError => Err(SepalError::SnapshotWriteRejected),
            SnapshotMode::WriteIgnore => Ok(()),
            SnapshotMode::WriteForward => self.live.compact_range(_from, _to),
        }
    }
}
