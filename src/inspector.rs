//! Read-only introspection surface.
//!
//! A thin, HTTP-shaped façade over the database: list the keyspaces,
//! dump the rows of one of them with paging and range options, report
//! per-keyspace info, trigger compaction. Responses are plain
//! `serde_json` values so an embedding web server can serve them 1:1;
//! no server lives in this crate.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use crate::codec;
use crate::db::{ClassId, Db, KeySpaceId, keyspace_range};
use crate::error::Result;
use crate::kv::{IterRange, SnapshotMode};

/// Query options of a row dump, mirroring the HTTP query parameters.
#[derive(Debug, Clone, Default)]
pub struct DumpQuery {
    /// Exact encoded-JSON key to match.
    pub key: Option<Value>,
    /// Encoded-JSON key prefix to match.
    pub prefix: Option<Value>,
    /// Range start (encoded-JSON key).
    pub start_key: Option<Value>,
    /// Range end (encoded-JSON key).
    pub end_key: Option<Value>,
    /// Include the upper range endpoint.
    pub include_upper: bool,
    /// Rows to skip.
    pub offset: usize,
    /// Maximum rows to return.
    pub limit: Option<usize>,
    /// Iterate in descending order.
    pub descending: bool,
    /// Return base64 of the raw bytes instead of decoding.
    pub raw: bool,
}

/// Read-only database inspector.
pub struct Inspector {
    db: Db,
}

impl Inspector {
    pub fn new(db: Db) -> Inspector {
        Inspector { db }
    }

    /// All allocated keyspaces: `[{id, class, name, size}]`.
    pub fn list(&self) -> Result<Value> {
        let mut out = Vec::new();
        for info in self.db.list_keyspaces()? {
            let info = info?;
            out.push(json!({
                "id": info.id,
                "class": info.class_id,
                "name": info.name,
                "size": self.db.keyspace_size(info.id)?,
            }));
        }
        Ok(Value::Array(out))
    }

    /// Info about one keyspace: `{kid, size, metadata}`, or `None` when
    /// `(class, name)` is not registered.
    pub fn info(&self, class: ClassId, name: &str) -> Result<Option<Value>> {
        let Some(kid) = self.db.find_keyspace(class, name)? else {
            return Ok(None);
        };
        Ok(Some(json!({
            "kid": kid,
            "size": self.db.keyspace_size(kid)?,
            "metadata": self.db.keyspace_metadata(kid)?.unwrap_or(Value::Null),
        })))
    }

    /// Dump rows of a keyspace as `[{key, value}]`. Decoding is
    /// best-effort — keyspaces store different key layouts — and `raw`
    /// mode sidesteps it with base64 of the stored bytes.
    pub fn dump(&self, class: ClassId, name: &str, query: &DumpQuery) -> Result<Option<Value>> {
        let Some(kid) = self.db.find_keyspace(class, name)? else {
            return Ok(None);
        };
        let range = self.build_range(kid, query);
        let snap = self.db.snapshot(SnapshotMode::WriteError);
        let iter = snap.iter(range)?;

        let mut rows = Vec::new();
        let limit = query.limit.unwrap_or(usize::MAX);
        for (key, value) in iter.skip(query.offset).take(limit) {
            rows.push(if query.raw {
                json!({
                    "key": STANDARD.encode(&key[1..]),
                    "value": STANDARD.encode(&value),
                })
            } else {
                json!({
                    "key": render_key(&key[1..]),
                    "value": render_value(&value),
                })
            });
        }
        Ok(Some(Value::Array(rows)))
    }

    fn build_range(&self, kid: KeySpaceId, query: &DumpQuery) -> IterRange {
        let full = keyspace_range(kid);
        let (begin, end) = if let Some(key) = &query.key {
            let mut b = vec![kid];
            codec::encode_key(key, &mut b);
            let mut e = b.clone();
            codec::upper_bound(&mut e);
            (b, e)
        } else if let Some(prefix) = &query.prefix {
            let mut b = vec![kid];
            codec::encode_key_prefix(prefix, &mut b);
            let mut e = b.clone();
            codec::upper_bound(&mut e);
            (b, e)
        } else {
            let begin = match &query.start_key {
                Some(k) => {
                    let mut b = vec![kid];
                    codec::encode_key(k, &mut b);
                    b
                }
                None => full.from.clone(),
            };
            let end = match &query.end_key {
                Some(k) => {
                    let mut e = vec![kid];
                    codec::encode_key(k, &mut e);
                    if query.include_upper {
                        codec::upper_bound(&mut e);
                    }
                    e
                }
                None => full.to.clone(),
            };
            (begin, end)
        };
        if query.descending {
            IterRange::new(end, begin).exclude_begin()
        } else {
            IterRange::new(begin, end).exclude_end()
        }
    }

    /// Compact the underlying engine.
    pub fn compact(&self) -> Result<()> {
        self.db.compact()
    }
}

/// Best-effort rendering of a stored key: codec-decoded JSON (with a
/// doc-id part when present), else a lossy string.
fn render_key(content: &[u8]) -> Value {
    if let Ok((key, doc_id)) = codec::split_doc_key(content) {
        return json!({"key": key, "id": doc_id});
    }
    match codec::decode_key(content) {
        Ok((v, used)) if used == content.len() => v,
        _ => Value::String(String::from_utf8_lossy(content).into_owned()),
    }
}

fn render_value(bytes: &[u8]) -> Value {
    match codec::decode_value(bytes) {
        Ok(v) => v,
        Err(_) => Value::String(STANDARD.encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KeySpaceClass;
    use crate::docstore::{DocStore, DocStoreConfig, Document};
    use crate::jsonmap::JsonMap;

    #[test]
    fn test_list_and_info() {
        let db = Db::in_memory();
        let _store = DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap();
        let inspector = Inspector::new(db.clone());

        let list = inspector.list().unwrap();
        let names: Vec<&str> =
            list.as_array().unwrap().iter().filter_map(|e| e["name"].as_str()).collect();
        // the store registers itself and its incremental log
        assert_eq!(names, vec!["docs", "docs"]);

        let info = inspector.info(KeySpaceClass::Document.id(), "docs").unwrap().unwrap();
        assert!(info["kid"].is_number());
        assert!(inspector.info(KeySpaceClass::Document.id(), "nope").unwrap().is_none());
    }

    #[test]
    fn test_dump_with_paging() {
        let db = Db::in_memory();
        let map = JsonMap::open(&db, "m").unwrap();
        for i in 0..10 {
            map.set(&json!(i), &json!({"v": i})).unwrap();
        }
        let inspector = Inspector::new(db.clone());

        let q = DumpQuery { offset: 2, limit: Some(3), ..DumpQuery::default() };
        let rows = inspector.dump(KeySpaceClass::JsonMap.id(), "m", &q).unwrap().unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["key"], json!(2));
        assert_eq!(rows[2]["value"], json!({"v": 4}));

        let q = DumpQuery { descending: true, limit: Some(1), ..DumpQuery::default() };
        let rows = inspector.dump(KeySpaceClass::JsonMap.id(), "m", &q).unwrap().unwrap();
        assert_eq!(rows.as_array().unwrap()[0]["key"], json!(9));

        let q = DumpQuery {
            start_key: Some(json!(7)),
            end_key: Some(json!(9)),
            include_upper: true,
            ..DumpQuery::default()
        };
        let rows = inspector.dump(KeySpaceClass::JsonMap.id(), "m", &q).unwrap().unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_dump_raw_mode_and_doc_rows() {
        let db = Db::in_memory();
        let store = DocStore::open(&db, "docs", DocStoreConfig::default()).unwrap();
        store.put(&Document::new("d1", json!({"x": 1}))).unwrap();
        let inspector = Inspector::new(db.clone());

        let rows = inspector
            .dump(KeySpaceClass::Document.id(), "docs", &DumpQuery::default())
            .unwrap()
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);

        let q = DumpQuery { raw: true, ..DumpQuery::default() };
        let rows = inspector.dump(KeySpaceClass::Document.id(), "docs", &q).unwrap().unwrap();
        let key_b64 = rows.as_array().unwrap()[0]["key"].as_str().unwrap().to_string();
        assert_eq!(STANDARD.decode(key_b64).unwrap(), b"d1");
    }
}
