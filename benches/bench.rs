use std::sync::Arc;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use serde_json::json;

use sepal::{Db, DocStore, DocStoreConfig, Document, View, encode_key};

fn bench_key_codec(c: &mut Criterion) {
    let keys = vec![
        json!(42.5),
        json!("a moderately sized string key"),
        json!(["compound", 17, true]),
    ];
    c.bench_function("codec_encode_key", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(64);
            for key in &keys {
                out.clear();
                encode_key(std::hint::black_box(key), &mut out);
            }
            out
        })
    });
}

fn bench_docstore_put(c: &mut Criterion) {
    let db = Db::in_memory();
    let store = DocStore::open(&db, "bench", DocStoreConfig::default()).unwrap();
    let mut i = 0u64;
    c.bench_function("docstore_put", |b| {
        b.iter(|| {
            i += 1;
            store
                .put(&Document::new(format!("doc{i}"), json!({"n": i, "body": "payload"})))
                .unwrap()
        })
    });
}

fn bench_view_update(c: &mut Criterion) {
    c.bench_function("view_index_1000_docs", |b| {
        b.iter_batched(
            || {
                let db = Db::in_memory();
                let store =
                    Arc::new(DocStore::open(&db, "bench", DocStoreConfig::default()).unwrap());
                for i in 0..1000u32 {
                    store
                        .put(&Document::new(format!("doc{i}"), json!({"k": i % 50})))
                        .unwrap();
                }
                let view = View::new(
                    &db,
                    "by-k",
                    1,
                    store.clone(),
                    Box::new(|doc, emit| {
                        if let Some(c) = &doc.content {
                            emit.emit(&c["k"], &json!(null));
                        }
                    }),
                )
                .unwrap();
                (store, view)
            },
            |(_store, view)| view.update().unwrap(),
            BatchSize::PerIteration,
        )
    });
}

criterion_group!(benches, bench_key_codec, bench_docstore_put, bench_view_update);
criterion_main!(benches);
