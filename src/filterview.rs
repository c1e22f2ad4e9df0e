//! Document-id keyed views.
//!
//! A filter view holds one row per document, keyed by the raw document
//! id; there is no separate user key and no reverse index. It models a
//! "set of documents matching a criterion, with a value attached".
//! [`UpdatableFilterView`] binds the set to a document store through a
//! map function: `Some(value)` keeps the document in the set, `None`
//! removes it.

use std::sync::Arc;

use serde_json::Value;

use crate::codec;
use crate::db::{Db, KeySpaceClass, KeySpaceId, Observable, ObserverHandle, make_key};
use crate::docstore::{DocStore, Document};
use crate::error::{Result, SepalError};
use crate::kv::{IterRange, SnapshotMode, WriteBatch};
use crate::view::UpdatableCore;

/// Map callback of an updatable filter view.
pub type FilterFn = Box<dyn Fn(&Document) -> Option<Value> + Send + Sync>;

/// One row of a filter view.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRow {
    pub id: String,
    pub value: Value,
}

/// Read surface over a docId-keyed keyspace.
#[derive(Clone)]
pub struct FilterView {
    db: Db,
    kid: KeySpaceId,
}

impl FilterView {
    /// Open (or create) the filter view registered under `name`.
    pub fn open(db: &Db, name: &str) -> Result<FilterView> {
        let kid = db.alloc_keyspace(KeySpaceClass::Filter, name)?;
        Ok(FilterView { db: db.clone(), kid })
    }

    fn from_kid(db: &Db, kid: KeySpaceId) -> FilterView {
        FilterView { db: db.clone(), kid }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Value stored for a document, `None` when it is not in the set.
    pub fn lookup(&self, doc_id: &str) -> Result<Option<Value>> {
        match self.db.get(&make_key(self.kid, doc_id.as_bytes()))? {
            Some(bytes) => Ok(Some(codec::decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    fn snapshot_iter(&self, range: IterRange) -> Result<FilterIterator> {
        let snap = self.db.snapshot(SnapshotMode::WriteError);
        Ok(FilterIterator { raw: snap.iter(range)?, filter: None })
    }

    /// Documents whose id starts with `prefix`, in id order.
    pub fn prefix(&self, prefix: &str, backward: bool) -> Result<FilterIterator> {
        let begin = make_key(self.kid, prefix.as_bytes());
        let mut end = begin.clone();
        codec::upper_bound(&mut end);
        let range = if backward {
            IterRange::new(end, begin).exclude_begin()
        } else {
            IterRange::new(begin, end).exclude_end()
        };
        self.snapshot_iter(range)
    }

    /// Every document in the set.
    pub fn scan(&self, backward: bool) -> Result<FilterIterator> {
        self.prefix("", backward)
    }

    /// Documents with ids between `from` and `to`; backward when
    /// `from > to`, the greater endpoint gated by `include_upper`.
    pub fn range(&self, from: &str, to: &str, include_upper: bool) -> Result<FilterIterator> {
        let backward = from > to;
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
        self.snapshot_iter(range)
    }
}

/// Filter view maintained from a document store.
pub struct UpdatableFilterView {
    core: UpdatableCore,
    source: Arc<DocStore>,
    map_fn: FilterFn,
    observers: Arc<Observable<Vec<String>>>,
}

impl UpdatableFilterView {
    /// Open (or create) the view; `revision` versions the map function.
    pub fn new(
        db: &Db,
        name: &str,
        revision: u64,
        source: Arc<DocStore>,
        map_fn: FilterFn,
    ) -> Result<UpdatableFilterView> {
        let core = UpdatableCore::open(db, KeySpaceClass::Filter.id(), name, revision)?;
        let observers = db.observable::<Vec<String>>(core.kid());
        Ok(UpdatableFilterView { core, source, map_fn, observers })
    }

    fn read_view(&self) -> FilterView {
        FilterView::from_kid(self.core.db(), self.core.kid())
    }

    /// Bring the set up to date with the source.
    pub fn update(&self) -> Result<()> {
        self.core.update_with(&self.source, |batch, doc| {
            let key = make_key(self.core.kid(), doc.id.as_bytes());
            match (self.map_fn)(doc) {
                Some(value) => {
                    let mut val = Vec::new();
                    codec::encode_value(&value, &mut val);
                    batch.put(key, val);
                }
                None => batch.delete(key),
            }
            if !self.observers.is_empty() {
                self.observers.broadcast(batch, &vec![doc.id.clone()]);
            }
            Ok(())
        })
    }

    /// Drop all rows and re-run the map function over the whole source.
    pub fn rebuild(&self) -> Result<()> {
        self.core.reset()?;
        self.update()
    }

    pub fn lookup(&self, doc_id: &str) -> Result<Option<Value>> {
        self.update()?;
        self.read_view().lookup(doc_id)
    }

    pub fn scan(&self, backward: bool) -> Result<FilterIterator> {
        self.update()?;
        self.read_view().scan(backward)
    }

    pub fn prefix(&self, prefix: &str, backward: bool) -> Result<FilterIterator> {
        self.update()?;
        self.read_view().prefix(prefix, backward)
    }

    pub fn range(&self, from: &str, to: &str, include_upper: bool) -> Result<FilterIterator> {
        self.update()?;
        self.read_view().range(from, to, include_upper)
    }

    /// Observe updated document ids inside the update batch; return
    /// `false` to unsubscribe.
    pub fn add_observer(
        &self,
        f: impl FnMut(&mut WriteBatch, &Vec<String>) -> bool + Send + 'static,
    ) -> ObserverHandle {
        self.observers.add(f)
    }

    pub fn remove_observer(&self, h: ObserverHandle) {
        self.observers.remove(h);
    }
}

type FilterRowPredicate = Box<dyn FnMut(&FilterRow) -> bool + Send>;

/// Iterator over filter-view rows.
pub struct FilterIterator {
    raw: crate::db::RawIterator,
    filter: Option<FilterRowPredicate>,
}

impl FilterIterator {
    /// Keep only rows the predicate accepts.
    pub fn with_filter(mut self, f: impl FnMut(&FilterRow) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(f));
        self
    }
}

impl Iterator for FilterIterator {
    type Item = Result<FilterRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = self.raw.next()?;
            let parsed = std::str::from_utf8(&key[1..])
                .map_err(|_| SepalError::decode("filter row id is not utf-8"))
                .map(str::to_string)
                .and_then(|id| Ok(FilterRow { id, value: codec::decode_value(&value)? }));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::DocStoreConfig;
    use serde_json::json;

    fn setup() -> (Arc<DocStore>, UpdatableFilterView) {
        let db = Db::in_memory();
        let store = Arc::new(DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap());
        let view = UpdatableFilterView::new(
            &db,
            "hot",
            1,
            store.clone(),
            Box::new(|doc| {
                let content = doc.content.as_ref()?;
                if content.get("hot")?.as_bool()? { Some(content["score"].clone()) } else { None }
            }),
        )
        .unwrap();
        (store, view)
    }

    fn ids(iter: FilterIterator) -> Vec<String> {
        iter.map(|r| r.unwrap().id).collect()
    }

    #[test]
    fn test_membership_follows_map_fn() {
        let (store, view) = setup();
        let mut a = Document::new("a", json!({"hot": true, "score": 5}));
        assert!(store.put_update(&mut a).unwrap());
        assert!(store.put(&Document::new("b", json!({"hot": false, "score": 1}))).unwrap());

        assert_eq!(view.lookup("a").unwrap(), Some(json!(5)));
        assert_eq!(view.lookup("b").unwrap(), None);
        assert_eq!(ids(view.scan(false).unwrap()), vec!["a".to_string()]);

        // cooling a document removes its row
        a.content = Some(json!({"hot": false, "score": 5}));
        assert!(store.put_update(&mut a).unwrap());
        assert_eq!(view.lookup("a").unwrap(), None);
        assert!(ids(view.scan(false).unwrap()).is_empty());
    }

    #[test]
    fn test_deleted_documents_leave_the_set() {
        let (store, view) = setup();
        let mut a = Document::new("a", json!({"hot": true, "score": 1}));
        assert!(store.put_update(&mut a).unwrap());
        assert_eq!(ids(view.scan(false).unwrap()), vec!["a".to_string()]);
        assert!(store.erase("a", a.rev).unwrap());
        assert!(ids(view.scan(false).unwrap()).is_empty());
    }

    #[test]
    fn test_prefix_and_range_on_ids() {
        let (store, view) = setup();
        for id in ["aa", "ab", "ba", "bb"] {
            assert!(store.put(&Document::new(id, json!({"hot": true, "score": 0}))).unwrap());
        }
        assert_eq!(ids(view.prefix("a", false).unwrap()), vec!["aa", "ab"]);
        assert_eq!(ids(view.range("ab", "bb", false).unwrap()), vec!["ab", "ba"]);
        assert_eq!(ids(view.range("bb", "aa", true).unwrap()), vec!["bb", "ba", "ab", "aa"]);
        assert_eq!(ids(view.scan(true).unwrap()), vec!["bb", "ba", "ab", "aa"]);
    }
}
