//! Contract with the underlying ordered key-value engine.
//!
//! The database consumes an external LSM-style engine through the
//! [`KvEngine`] trait: point reads, atomic write batches, range
//! iterators whose direction follows from the endpoints, snapshots,
//! approximate sizes and compaction. A reference [`MemoryEngine`] is
//! provided for embedding and tests; production deployments plug in an
//! adapter over their engine of choice.

pub mod memory;

use std::sync::Arc;

use crate::error::Result;

pub use memory::MemoryEngine;

/// How a snapshot treats writes addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Writing through the snapshot is an error.
    WriteError,
    /// Writes are silently dropped.
    WriteIgnore,
    /// Writes are forwarded to the live engine (and stay invisible
    /// within the snapshot).
    WriteForward,
}

/// A single operation recorded in a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An atomic unit of writes. Operations become visible together when the
/// batch is committed, or not at all.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    approximate: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let (key, value) = (key.into(), value.into());
        self.approximate += key.len() + value.len() + 16;
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        let key = key.into();
        self.approximate += key.len() + 16;
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.approximate = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Rough byte size of the batch, used to decide when a long update
    /// should flush.
    pub fn approximate_size(&self) -> usize {
        self.approximate
    }

    /// Recorded operations, in insertion order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// A key range for iteration. When `from > to` the iterator runs
/// backward; both endpoints are inclusive unless excluded, and exclusion
/// drops only the exact endpoint key.
#[derive(Debug, Clone)]
pub struct IterRange {
    pub from: Vec<u8>,
    pub to: Vec<u8>,
    pub exclude_begin: bool,
    pub exclude_end: bool,
}

impl IterRange {
    pub fn new(from: Vec<u8>, to: Vec<u8>) -> Self {
        IterRange { from, to, exclude_begin: false, exclude_end: false }
    }

    pub fn exclude_begin(mut self) -> Self {
        self.exclude_begin = true;
        self
    }

    pub fn exclude_end(mut self) -> Self {
        self.exclude_end = true;
        self
    }
}

/// Streaming iterator over `(key, value)` pairs.
pub trait KvIter: Send {
    fn next_entry(&mut self) -> Option<(Vec<u8>, Vec<u8>)>;
}

/// The ordered key-value engine the database is layered on.
pub trait KvEngine: Send + Sync {
    /// Point lookup. Absent keys are `None`, never an error.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Atomically apply and drain `batch`. With `sync` the write is
    /// durable on return.
    fn write(&self, batch: &mut WriteBatch, sync: bool) -> Result<()>;

    /// Open an iterator over `range` (see [`IterRange`] for direction
    /// and exclusion semantics).
    fn iter(&self, range: IterRange) -> Result<Box<dyn KvIter>>;

    /// Consistent point-in-time view of the engine.
    fn snapshot(&self, mode: SnapshotMode) -> Arc<dyn KvEngine>;

    /// Approximate on-disk size of each `[from, to)` range.
    fn approximate_sizes(&self, ranges: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<u64>>;

    /// Compact the given range; `None` bounds mean the whole store.
    fn compact_range(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> Result<()>;
}

/// Options recognized by engine adapters, mirroring the common LSM knobs.
///
/// The in-memory reference engine honors `logger` and carries the rest
/// untouched for adapter parity.
#[derive(Clone)]
pub struct EngineConfig {
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub paranoid_checks: bool,
    pub write_buffer_size: usize,
    pub max_open_files: u32,
    pub block_size: usize,
    pub block_restart_interval: u32,
    pub max_file_size: usize,
    pub bloom_filter_size: usize,
    pub sync_writes: bool,
    pub logger: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            bloom_filter_size: 16,
            sync_writes: false,
            logger: None,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("sync_writes", &self.sync_writes)
            .finish_non_exhaustive()
    }
}
