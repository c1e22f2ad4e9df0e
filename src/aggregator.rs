//! Materialized aggregations over a view.
//!
//! The aggregator never recomputes eagerly. When the source view
//! reindexes a document it broadcasts the affected user keys; the
//! aggregator maps each key to one or more result keys and overwrites
//! those rows with a *recipe* — the instructions for recomputing them.
//! The actual reduce runs on the next read that touches a recipe row,
//! and its output replaces the recipe as the authoritative value.
//!
//! A recipe value is one opcode byte followed by a JSON array of
//! arguments; authoritative values are plain JSON, whose first byte can
//! never collide with an opcode.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::codec;
use crate::db::{Db, FLUSH_THRESHOLD, KeySpaceClass, KeySpaceId, Observable, ObserverHandle};
use crate::error::{Result, SepalError};
use crate::kv::{IterRange, SnapshotMode, WriteBatch};
use crate::view::{View, ViewIterator, ViewRow};

const OP_FIND: u8 = 0x01;
const OP_PREFIX: u8 = 0x02;
const OP_RANGE: u8 = 0x03;
const OP_SCAN: u8 = 0x04;

/// Reduce callback: folds the matching source rows into one value.
/// Never called on an empty row set. Returning `None` drops the result
/// row. Must be total and deterministic.
pub type ReduceFn = Box<dyn Fn(&mut SourceRows<'_>, &Value) -> Result<Option<Value>> + Send + Sync>;

/// Key-mapping callback: translates a changed source key into the
/// result keys to invalidate.
pub type MapKeyFn = Box<dyn Fn(&Value, &mut RecipeEmit<'_>) + Send + Sync>;

/// Operations the aggregator needs from its source. Implemented by
/// [`View`]; other components can adapt themselves through it.
pub trait AggregatorSource: Send + Sync {
    /// Bring the source up to date (which is what triggers the
    /// invalidation broadcasts).
    fn update(&self) -> Result<()>;
    fn db(&self) -> &Db;
    fn find_rows(&self, key: &Value) -> Result<ViewIterator>;
    fn prefix_rows(&self, key: &Value) -> Result<ViewIterator>;
    fn range_rows(&self, from: &Value, to: &Value, include_upper: bool) -> Result<ViewIterator>;
    fn scan_rows(&self) -> Result<ViewIterator>;
    fn observe_keys(
        &self,
        f: Box<dyn FnMut(&mut WriteBatch, &Vec<Value>) -> bool + Send>,
    ) -> ObserverHandle;
    fn unobserve_keys(&self, h: ObserverHandle);
}

impl AggregatorSource for View {
    fn update(&self) -> Result<()> {
        View::update(self)
    }

    fn db(&self) -> &Db {
        View::db(self)
    }

    fn find_rows(&self, key: &Value) -> Result<ViewIterator> {
        self.find(key)
    }

    fn prefix_rows(&self, key: &Value) -> Result<ViewIterator> {
        self.prefix(key)
    }

    fn range_rows(&self, from: &Value, to: &Value, include_upper: bool) -> Result<ViewIterator> {
        self.range(from, to, include_upper)
    }

    fn scan_rows(&self) -> Result<ViewIterator> {
        self.scan(false)
    }

    fn observe_keys(
        &self,
        f: Box<dyn FnMut(&mut WriteBatch, &Vec<Value>) -> bool + Send>,
    ) -> ObserverHandle {
        self.add_key_observer(f)
    }

    fn unobserve_keys(&self, h: ObserverHandle) {
        self.remove_key_observer(h)
    }
}

/// Emits invalidation recipes while mapping a changed source key.
pub struct RecipeEmit<'a> {
    kid: KeySpaceId,
    batch: &'a mut WriteBatch,
}

impl RecipeEmit<'_> {
    fn put_recipe(&mut self, result_key: &Value, opcode: u8, args: Vec<Value>) {
        let mut row = vec![self.kid];
        codec::encode_key(result_key, &mut row);
        let mut value = vec![opcode];
        codec::encode_value(&Value::Array(args), &mut value);
        self.batch.put(row, value);
    }

    /// Recompute `result_key` by scanning the entire source.
    pub fn scan(&mut self, result_key: &Value, user_value: &Value) {
        self.put_recipe(result_key, OP_SCAN, vec![user_value.clone()]);
    }

    /// Recompute `result_key` from all source rows with exactly `key`.
    pub fn find(&mut self, result_key: &Value, key: &Value, user_value: &Value) {
        self.put_recipe(result_key, OP_FIND, vec![key.clone(), user_value.clone()]);
    }

    /// Recompute `result_key` from all source rows extending `prefix`.
    pub fn prefix(&mut self, result_key: &Value, prefix: &Value, user_value: &Value) {
        self.put_recipe(result_key, OP_PREFIX, vec![prefix.clone(), user_value.clone()]);
    }

    /// Recompute `result_key` from a source key range.
    pub fn range(
        &mut self,
        result_key: &Value,
        from: &Value,
        to: &Value,
        include_upper: bool,
        user_value: &Value,
    ) {
        self.put_recipe(
            result_key,
            OP_RANGE,
            vec![from.clone(), to.clone(), Value::Bool(include_upper), user_value.clone()],
        );
    }
}

/// The default key mapping, parameterized by `group_level`.
///
/// - `group_level == 0`: a single `null` bucket over the whole source;
/// - array keys with `group_level <= len`: one bucket per truncated
///   prefix `key[..group_level]`;
/// - everything else: one bucket per distinct key.
fn default_map_key(group_level: usize, key: &Value, emit: &mut RecipeEmit<'_>) {
    if group_level == 0 {
        emit.scan(&Value::Null, &Value::Null);
        return;
    }
    match key {
        Value::Array(items) if group_level <= items.len() => {
            let truncated = Value::Array(items[..group_level].to_vec());
            emit.prefix(&truncated, &truncated, &Value::Null);
        }
        other => emit.find(other, other, &Value::Null),
    }
}

/// One result row of an aggregator query.
#[derive(Debug, Clone, PartialEq)]
pub struct AggRow {
    pub key: Value,
    pub value: Value,
}

struct AggrInner {
    db: Db,
    kid: KeySpaceId,
    group_level: usize,
    map_key: Option<MapKeyFn>,
    reduce: ReduceFn,
    observers: Arc<Observable<Vec<Value>>>,
}

impl AggrInner {
    fn map_key(&self, key: &Value, emit: &mut RecipeEmit<'_>) {
        match &self.map_key {
            Some(f) => f(key, emit),
            None => default_map_key(self.group_level, key, emit),
        }
    }

    fn invalidate(&self, batch: &mut WriteBatch, keys: &[Value]) {
        let mut emit = RecipeEmit { kid: self.kid, batch };
        for key in keys {
            self.map_key(key, &mut emit);
        }
    }
}

/// A materialized view of a view, with lazy recomputation.
pub struct Aggregator {
    inner: Arc<AggrInner>,
    source: Arc<dyn AggregatorSource>,
    source_handle: ObserverHandle,
}

impl Aggregator {
    /// Open (or create) an aggregator over `source` with the default
    /// key mapping for `group_level` and the given reduce function.
    ///
    /// Invalidation only covers source updates made while the
    /// aggregator is attached; when attaching over an already indexed
    /// source, call [`Aggregator::rebuild`] once.
    pub fn new(
        db: &Db,
        name: &str,
        source: Arc<dyn AggregatorSource>,
        group_level: usize,
        reduce: ReduceFn,
    ) -> Result<Aggregator> {
        Self::build(db, name, source, group_level, None, reduce)
    }

    /// Open with a custom key-mapping function instead of the
    /// `group_level` default.
    pub fn with_map_key(
        db: &Db,
        name: &str,
        source: Arc<dyn AggregatorSource>,
        map_key: MapKeyFn,
        reduce: ReduceFn,
    ) -> Result<Aggregator> {
        Self::build(db, name, source, 0, Some(map_key), reduce)
    }

    fn build(
        db: &Db,
        name: &str,
        source: Arc<dyn AggregatorSource>,
        group_level: usize,
        map_key: Option<MapKeyFn>,
        reduce: ReduceFn,
    ) -> Result<Aggregator> {
        let kid = db.alloc_keyspace(KeySpaceClass::View, name)?;
        if !db.keyspace_lock(kid, true) {
            return Err(SepalError::KeyspaceLocked(kid));
        }
        let observers = db.observable::<Vec<Value>>(kid);
        let inner = Arc::new(AggrInner {
            db: db.clone(),
            kid,
            group_level,
            map_key,
            reduce,
            observers,
        });
        // invalidation rides the source's own update batch
        let hook = inner.clone();
        let source_handle = source.observe_keys(Box::new(move |batch, keys| {
            hook.invalidate(batch, keys);
            true
        }));
        Ok(Aggregator { inner, source, source_handle })
    }

    /// Drive the source; its key broadcasts write our recipe rows.
    pub fn update(&self) -> Result<()> {
        self.source.update()
    }

    /// Invalidate every result key derivable from the current source
    /// content. Existing authoritative rows become recipes again.
    pub fn rebuild(&self) -> Result<()> {
        self.update()?;
        let mut batch = WriteBatch::new();
        let mut rows = self.source.scan_rows()?;
        while let Some(row) = rows.next() {
            let mut emit = RecipeEmit { kid: self.inner.kid, batch: &mut batch };
            self.inner.map_key(&row?.key, &mut emit);
            if batch.approximate_size() > FLUSH_THRESHOLD {
                self.inner.db.commit_batch(&mut batch)?;
            }
        }
        self.inner.db.commit_batch(&mut batch)
    }

    fn row_key(&self, key: &Value) -> Vec<u8> {
        let mut k = vec![self.inner.kid];
        codec::encode_key(key, &mut k);
        k
    }

    /// Fetch one aggregated value, recomputing it if the stored row is a
    /// recipe. `None` when the bucket has no source rows.
    pub fn lookup(&self, key: &Value) -> Result<Option<Value>> {
        self.update()?;
        let row_key = self.row_key(key);
        let Some(stored) = self.inner.db.get(&row_key)? else {
            return Ok(None);
        };
        match parse_recipe(&stored)? {
            None => Ok(Some(codec::decode_value(&stored)?)),
            Some(recipe) => self.recompute(&row_key, recipe),
        }
    }

    /// Whether the stored row for `key` is currently a stale recipe.
    /// Introspection for tests and monitoring; reads do this check
    /// internally.
    pub fn is_stale(&self, key: &Value) -> Result<bool> {
        match self.inner.db.get(&self.row_key(key))? {
            Some(stored) => Ok(parse_recipe(&stored)?.is_some()),
            None => Ok(false),
        }
    }

    /// Recompute a recipe row: run the reduce over the matching source
    /// rows, store the authoritative value (or delete the row when the
    /// source range is empty) and notify downstream observers.
    fn recompute(&self, row_key: &[u8], recipe: Recipe) -> Result<Option<Value>> {
        let mut source_iter = match &recipe.op {
            RecipeOp::Scan => self.source.scan_rows()?,
            RecipeOp::Find(key) => self.source.find_rows(key)?,
            RecipeOp::Prefix(prefix) => self.source.prefix_rows(prefix)?,
            RecipeOp::Range(from, to, include_upper) => {
                self.source.range_rows(from, to, *include_upper)?
            }
        };

        let mut batch = WriteBatch::new();
        let result = match source_iter.next().transpose()? {
            // reduce never runs over an empty source
            None => None,
            Some(first) => {
                let mut rows = SourceRows { head: Some(first), rest: &mut source_iter };
                (self.inner.reduce)(&mut rows, &recipe.user_value)?
            }
        };

        match &result {
            Some(value) => {
                let mut bytes = Vec::new();
                codec::encode_value(value, &mut bytes);
                batch.put(row_key.to_vec(), bytes);
            }
            None => batch.delete(row_key.to_vec()),
        }
        if !self.inner.observers.is_empty() {
            let (key, _) = codec::decode_key(&row_key[1..])?;
            self.inner.observers.broadcast(&mut batch, &vec![key]);
        }
        self.inner.db.commit_batch(&mut batch)?;
        Ok(result)
    }

    fn snapshot_iter(&self, range: IterRange) -> Result<AggIterator<'_>> {
        let snap = self.inner.db.snapshot(SnapshotMode::WriteError);
        Ok(AggIterator { owner: self, raw: snap.iter(range)? })
    }

    /// Iterate result rows for exactly `key` (zero or one row).
    pub fn find(&self, key: &Value) -> Result<AggIterator<'_>> {
        self.update()?;
        let begin = self.row_key(key);
        let mut end = begin.clone();
        end.push(0);
        self.snapshot_iter(IterRange::new(begin, end).exclude_end())
    }

    /// Iterate result rows whose key extends `key`.
    pub fn prefix(&self, key: &Value, backward: bool) -> Result<AggIterator<'_>> {
        self.update()?;
        let mut begin = vec![self.inner.kid];
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

    /// Iterate result rows between two keys; backward when `from > to`.
    pub fn range(&self, from: &Value, to: &Value, include_upper: bool) -> Result<AggIterator<'_>> {
        self.update()?;
        let from_key = self.row_key(from);
        let to_key = self.row_key(to);
        let backward = from_key > to_key;
        let stretch = |mut k: Vec<u8>| {
            k.push(0);
            k
        };
        let range = if backward {
            let begin = if include_upper { stretch(from_key) } else { from_key };
            IterRange::new(begin, to_key).exclude_begin()
        } else {
            let end = if include_upper { stretch(to_key) } else { to_key };
            IterRange::new(from_key, end).exclude_end()
        };
        self.snapshot_iter(range)
    }

    /// Iterate every result row.
    pub fn scan(&self, backward: bool) -> Result<AggIterator<'_>> {
        self.update()?;
        let begin = vec![self.inner.kid];
        let end = vec![self.inner.kid + 1];
        let range = if backward {
            IterRange::new(end, begin).exclude_begin().exclude_end()
        } else {
            IterRange::new(begin, end).exclude_end()
        };
        self.snapshot_iter(range)
    }

    /// Observe recomputed (or emptied) result keys; return `false` to
    /// unsubscribe.
    pub fn add_observer(
        &self,
        f: impl FnMut(&mut WriteBatch, &Vec<Value>) -> bool + Send + 'static,
    ) -> ObserverHandle {
        self.inner.observers.add(f)
    }

    pub fn remove_observer(&self, h: ObserverHandle) {
        self.inner.observers.remove(h);
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.source.unobserve_keys(self.source_handle);
        self.inner.db.keyspace_lock(self.inner.kid, false);
    }
}

enum RecipeOp {
    Scan,
    Find(Value),
    Prefix(Value),
    Range(Value, Value, bool),
}

struct Recipe {
    op: RecipeOp,
    user_value: Value,
}

fn parse_recipe(stored: &[u8]) -> Result<Option<Recipe>> {
    let Some(&opcode) = stored.first() else {
        return Err(SepalError::decode("empty aggregator row"));
    };
    if !(OP_FIND..=OP_SCAN).contains(&opcode) {
        return Ok(None);
    }
    let args = codec::decode_value(&stored[1..])?;
    let args = args
        .as_array()
        .ok_or_else(|| SepalError::decode("aggregator recipe args are not an array"))?;
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    let recipe = match opcode {
        OP_SCAN => Recipe { op: RecipeOp::Scan, user_value: arg(0) },
        OP_FIND => Recipe { op: RecipeOp::Find(arg(0)), user_value: arg(1) },
        OP_PREFIX => Recipe { op: RecipeOp::Prefix(arg(0)), user_value: arg(1) },
        OP_RANGE => Recipe {
            op: RecipeOp::Range(arg(0), arg(1), args.get(2).and_then(Value::as_bool).unwrap_or(false)),
            user_value: arg(3),
        },
        _ => return Ok(None),
    };
    Ok(Some(recipe))
}

/// The non-empty source rows handed to a reduce function.
pub struct SourceRows<'a> {
    head: Option<ViewRow>,
    rest: &'a mut ViewIterator,
}

impl Iterator for SourceRows<'_> {
    type Item = Result<ViewRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.head.take() {
            Some(row) => Some(Ok(row)),
            None => self.rest.next(),
        }
    }
}

/// Iterator over aggregator rows; recipe rows are recomputed as they
/// are reached, rows whose bucket turns out empty are skipped.
pub struct AggIterator<'a> {
    owner: &'a Aggregator,
    raw: crate::db::RawIterator,
}

impl Iterator for AggIterator<'_> {
    type Item = Result<AggRow>;

    fn next(&mut self) -> Option<Self::Item> {
        // advance with an explicit loop: a recomputed-empty row simply
        // moves on to the next candidate
        loop {
            let (row_key, stored) = self.raw.next()?;
            let step = || -> Result<Option<AggRow>> {
                let (key, _) = codec::decode_key(&row_key[1..])?;
                match parse_recipe(&stored)? {
                    None => Ok(Some(AggRow { key, value: codec::decode_value(&stored)? })),
                    Some(recipe) => Ok(self
                        .owner
                        .recompute(&row_key, recipe)?
                        .map(|value| AggRow { key, value })),
                }
            };
            match step() {
                Ok(Some(row)) => return Some(Ok(row)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Ready-made reduce functions.
pub mod reduce {
    use super::*;

    /// Count the rows in each bucket.
    pub fn count() -> ReduceFn {
        Box::new(|rows, _| {
            let mut n: u64 = 0;
            for row in rows {
                row?;
                n += 1;
            }
            Ok(Some(json!(n)))
        })
    }

    /// Numeric sum of the row values. Integral results come back as
    /// JSON integers.
    pub fn sum() -> ReduceFn {
        Box::new(|rows, _| {
            let mut total = 0.0;
            for row in rows {
                total += row?.value.as_f64().unwrap_or(0.0);
            }
            let value = if total.fract() == 0.0 && total.abs() <= 9.007199254740992e15 {
                json!(total as i64)
            } else {
                json!(total)
            };
            Ok(Some(value))
        })
    }

    fn key_order(a: &Value, b: &Value) -> std::cmp::Ordering {
        let mut ea = Vec::new();
        let mut eb = Vec::new();
        codec::encode_key(a, &mut ea);
        codec::encode_key(b, &mut eb);
        ea.cmp(&eb)
    }

    /// Smallest row value, by JSON key order.
    pub fn min() -> ReduceFn {
        Box::new(|rows, _| {
            let mut best: Option<Value> = None;
            for row in rows {
                let v = row?.value;
                if best.as_ref().is_none_or(|b| key_order(&v, b).is_lt()) {
                    best = Some(v);
                }
            }
            Ok(best)
        })
    }

    /// Largest row value, by JSON key order.
    pub fn max() -> ReduceFn {
        Box::new(|rows, _| {
            let mut best: Option<Value> = None;
            for row in rows {
                let v = row?.value;
                if best.as_ref().is_none_or(|b| key_order(&v, b).is_gt()) {
                    best = Some(v);
                }
            }
            Ok(best)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::{DocStore, DocStoreConfig, Document};

    fn setup(group_level: usize) -> (Arc<DocStore>, Arc<View>, Aggregator) {
        let db = Db::in_memory();
        let store = Arc::new(DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap());
        let view = Arc::new(
            View::new(
                &db,
                "pairs",
                1,
                store.clone(),
                Box::new(|doc, emit| {
                    if let Some(c) = &doc.content {
                        emit.emit(&c["k"], &c["v"]);
                    }
                }),
            )
            .unwrap(),
        );
        let agg =
            Aggregator::new(&db, "sums", view.clone(), group_level, reduce::sum()).unwrap();
        (store, view, agg)
    }

    #[test]
    fn test_lazy_recompute_scenario() {
        let (store, _view, agg) = setup(1);
        let mut d1 = Document::new("d1", json!({"k": 1, "v": 10}));
        assert!(store.put_update(&mut d1).unwrap());
        assert!(store.put(&Document::new("d2", json!({"k": 1, "v": 20}))).unwrap());
        assert!(store.put(&Document::new("d3", json!({"k": 2, "v": 5}))).unwrap());

        assert_eq!(agg.lookup(&json!(1)).unwrap(), Some(json!(30)));
        assert_eq!(agg.lookup(&json!(2)).unwrap(), Some(json!(5)));
        // the second read hits the authoritative row
        assert!(!agg.is_stale(&json!(1)).unwrap());

        // updating a source document leaves a recipe until the next read
        d1.content = Some(json!({"k": 1, "v": 15}));
        assert!(store.put_update(&mut d1).unwrap());
        agg.update().unwrap();
        assert!(agg.is_stale(&json!(1)).unwrap());
        assert_eq!(agg.lookup(&json!(1)).unwrap(), Some(json!(35)));
        assert!(!agg.is_stale(&json!(1)).unwrap());
    }

    #[test]
    fn test_empty_bucket_row_disappears() {
        let (store, _view, agg) = setup(1);
        let mut d = Document::new("d", json!({"k": 7, "v": 1}));
        assert!(store.put_update(&mut d).unwrap());
        assert_eq!(agg.lookup(&json!(7)).unwrap(), Some(json!(1)));

        assert!(store.erase("d", d.rev).unwrap());
        // the delete left a recipe; recomputing finds no source rows
        assert_eq!(agg.lookup(&json!(7)).unwrap(), None);
        assert!(!agg.is_stale(&json!(7)).unwrap());
        let rows: Vec<_> = agg.scan(false).unwrap().collect::<Result<_>>().unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_scan_recomputes_in_stride() {
        let (store, _view, agg) = setup(1);
        for (id, k, v) in [("a", 1, 1), ("b", 1, 2), ("c", 2, 10), ("d", 3, 100)] {
            assert!(store.put(&Document::new(id, json!({"k": k, "v": v}))).unwrap());
        }
        let rows: Vec<_> = agg.scan(false).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(
            rows,
            vec![
                AggRow { key: json!(1), value: json!(3) },
                AggRow { key: json!(2), value: json!(10) },
                AggRow { key: json!(3), value: json!(100) },
            ]
        );
    }

    #[test]
    fn test_group_level_zero_single_bucket() {
        let (store, _view, agg) = setup(0);
        for (id, k, v) in [("a", 1, 1), ("b", 2, 2), ("c", 3, 4)] {
            assert!(store.put(&Document::new(id, json!({"k": k, "v": v}))).unwrap());
        }
        assert_eq!(agg.lookup(&json!(null)).unwrap(), Some(json!(7)));
    }

    #[test]
    fn test_group_level_truncates_array_keys() {
        let db = Db::in_memory();
        let store = Arc::new(DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap());
        let view = Arc::new(
            View::new(
                &db,
                "pairs",
                1,
                store.clone(),
                Box::new(|doc, emit| {
                    if let Some(c) = &doc.content {
                        emit.emit(&c["k"], &c["v"]);
                    }
                }),
            )
            .unwrap(),
        );
        let agg = Aggregator::new(&db, "by-first", view.clone(), 1, reduce::count()).unwrap();

        for (id, k) in [
            ("a", json!(["x", 1])),
            ("b", json!(["x", 2])),
            ("c", json!(["y", 1])),
        ] {
            assert!(store.put(&Document::new(id, json!({"k": k, "v": 0}))).unwrap());
        }
        assert_eq!(agg.lookup(&json!(["x"])).unwrap(), Some(json!(2)));
        assert_eq!(agg.lookup(&json!(["y"])).unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_min_max_reducers() {
        let db = Db::in_memory();
        let store = Arc::new(DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap());
        let view = Arc::new(
            View::new(
                &db,
                "pairs",
                1,
                store.clone(),
                Box::new(|doc, emit| {
                    if let Some(c) = &doc.content {
                        emit.emit(&c["k"], &c["v"]);
                    }
                }),
            )
            .unwrap(),
        );
        let lo = Aggregator::new(&db, "lo", view.clone(), 1, reduce::min()).unwrap();
        let hi = Aggregator::new(&db, "hi", view.clone(), 1, reduce::max()).unwrap();

        for (id, v) in [("a", 5), ("b", -2), ("c", 9)] {
            assert!(store.put(&Document::new(id, json!({"k": 1, "v": v}))).unwrap());
        }
        assert_eq!(lo.lookup(&json!(1)).unwrap(), Some(json!(-2)));
        assert_eq!(hi.lookup(&json!(1)).unwrap(), Some(json!(9)));
    }
}
