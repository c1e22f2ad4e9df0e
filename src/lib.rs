//! # Sepal
//!
//! An embedded JSON document database with incremental materialized
//! views, layered on an ordered key-value store.
//!
//! ## Features
//!
//! - Documents keyed by arbitrary strings, with bounded revision
//!   chains for optimistic concurrency and replication
//! - An append-only change feed driving every derived structure
//! - Multi-key views, JSON maps and filter views with ordered range
//!   scans over an order-preserving key codec
//! - Materialized aggregations with lazy, recipe-driven recomputation
//! - Segmented binary attachments with reference-based garbage
//!   collection
//! - Pluggable storage: any engine exposing ordered iterators, atomic
//!   batches and snapshots
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use sepal::{Db, DocStore, DocStoreConfig, Document, View};
//!
//! # fn main() -> sepal::Result<()> {
//! let db = Db::in_memory();
//! let docs = Arc::new(DocStore::open(&db, "docs", DocStoreConfig::default())?);
//! let by_tag = View::new(&db, "by-tag", 1, docs.clone(), Box::new(|doc, emit| {
//!     if let Some(tag) = doc.content.as_ref().and_then(|c| c.get("tag")) {
//!         emit.emit(tag, &json!(null));
//!     }
//! }))?;
//!
//! docs.put(&Document::new("d1", json!({"tag": "fruit"})))?;
//! let row = by_tag.find(&json!("fruit"))?.next().unwrap()?;
//! assert_eq!(row.doc_id, "d1");
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod attachments;
mod codec;
mod db;
mod docstore;
mod error;
pub mod filterview;
mod incremental;
pub mod inspector;
pub mod jsonmap;
pub mod kv;
pub mod replication;
mod view;

// Re-exports for the public API
pub use aggregator::{AggRow, Aggregator, AggregatorSource, MapKeyFn, RecipeEmit, ReduceFn};
pub use attachments::{Attachments, AttachmentsConfig};
pub use codec::{decode_key, encode_key, encode_key_prefix};
pub use db::{
    ClassId, Db, KEYSPACE_MANAGER, KeySpaceClass, KeySpaceId, KeySpaceInfo, Observable,
    ObserverHandle,
};
pub use docstore::{
    ChangesIterator, DocIterator, DocRevision, DocStatus, DocStore, DocStoreConfig, Document,
    DocumentRepl, MAX_REV_HISTORY, Timestamp,
};
pub use error::{Result, SepalError};
pub use filterview::{FilterView, UpdatableFilterView};
pub use incremental::{IncrementalStore, SeqId};
pub use inspector::{DumpQuery, Inspector};
pub use jsonmap::{JsonMap, JsonMapView};
pub use kv::{EngineConfig, IterRange, KvEngine, MemoryEngine, SnapshotMode, WriteBatch};
pub use view::{Emit, IndexFn, View, ViewIterator, ViewRow};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
