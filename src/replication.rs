//! Replication target interface.
//!
//! The wire protocol lives outside this crate; what is specified here is
//! the boundary a transport must implement to receive a change feed:
//! answer whether it already has a revision, accept documents in
//! replication form, and record checkpoints. [`LocalTarget`] implements
//! the boundary over an in-process document store, which is enough to
//! replicate between two stores of one program (or two databases) and to
//! exercise transports in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::docstore::{DocRevision, DocStore, DocumentRepl};
use crate::error::Result;
use crate::incremental::SeqId;

/// Outcome of transferring one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Stored.
    Ok,
    /// Rejected: the revision chains do not connect. Final for this
    /// document; conflicts are resolved on the target side.
    Conflict,
    /// Transport or storage failure; the replication run stops.
    Error,
    /// The target asks the source to stop replicating.
    Stop,
}

/// A place documents can be replicated to.
pub trait ReplicationTarget: Send + Sync {
    /// Whether the target already has `rev` in the document's chain.
    fn have(&self, doc_id: &str, rev: DocRevision) -> Result<bool>;

    /// Deliver one document in replication form.
    fn send(&self, doc: &DocumentRepl) -> Result<TransferState>;

    /// Record the last fully transferred sequence id of the source.
    fn checkpoint(&self, seq: SeqId) -> Result<()>;
}

/// Replication target backed by a local document store.
pub struct LocalTarget {
    store: Arc<DocStore>,
    checkpoint: AtomicU64,
}

impl LocalTarget {
    pub fn new(store: Arc<DocStore>) -> LocalTarget {
        LocalTarget { store, checkpoint: AtomicU64::new(0) }
    }

    /// The last checkpoint recorded by a replication run.
    pub fn last_checkpoint(&self) -> SeqId {
        self.checkpoint.load(Ordering::SeqCst)
    }
}

impl ReplicationTarget for LocalTarget {
    fn have(&self, doc_id: &str, rev: DocRevision) -> Result<bool> {
        Ok(self.store.revisions(doc_id)?.contains(&rev))
    }

    fn send(&self, doc: &DocumentRepl) -> Result<TransferState> {
        Ok(if self.store.replicate_put(doc)? { TransferState::Ok } else { TransferState::Conflict })
    }

    fn checkpoint(&self, seq: SeqId) -> Result<()> {
        self.checkpoint.store(seq, Ordering::SeqCst);
        Ok(())
    }
}

/// Document filter applied before transfer; `false` skips the document.
pub type ReplicationFilter<'a> = &'a dyn Fn(&DocumentRepl) -> bool;

/// Pump the change feed of `source` (from `since`, exclusive) into
/// `target`. Returns the sequence id replication advanced to, which the
/// caller passes back as the next `since`. Conflicts are final per
/// document and do not stop the run; `Stop` and `Error` do.
pub fn replicate(
    source: &DocStore,
    target: &dyn ReplicationTarget,
    since: SeqId,
    filter: Option<ReplicationFilter<'_>>,
) -> Result<SeqId> {
    let mut last = since;
    for change in source.scan_changes(since)? {
        let change = change?;
        let doc = source.replicate_get(&change.id)?;
        if let Some(f) = filter {
            if !f(&doc) {
                last = change.seq;
                continue;
            }
        }
        let top = doc.revisions.first().copied().unwrap_or(0);
        if top != 0 && target.have(&doc.id, top)? {
            last = change.seq;
            continue;
        }
        match target.send(&doc)? {
            TransferState::Ok | TransferState::Conflict => {
                last = change.seq;
            }
            TransferState::Stop | TransferState::Error => break,
        }
    }
    if last != since {
        target.checkpoint(last)?;
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::docstore::{DocStoreConfig, Document};
    use serde_json::json;

    fn store(name: &str) -> Arc<DocStore> {
        let db = Db::in_memory();
        Arc::new(DocStore::open(&db, name, DocStoreConfig::default()).unwrap())
    }

    #[test]
    fn test_replicates_inserts_updates_and_deletes() {
        let source = store("src");
        let target_store = store("dst");
        let target = LocalTarget::new(target_store.clone());

        let mut a = Document::new("a", json!({"v": 1}));
        assert!(source.put_update(&mut a).unwrap());
        assert!(source.put(&Document::new("b", json!({"v": 2}))).unwrap());
        let seq = replicate(&source, &target, 0, None).unwrap();
        assert_eq!(seq, source.seq());
        assert_eq!(target.last_checkpoint(), seq);
        assert_eq!(target_store.get("a").unwrap().content, Some(json!({"v": 1})));

        // an update and a delete flow through on the next run
        a.content = Some(json!({"v": 10}));
        assert!(source.put_update(&mut a).unwrap());
        assert!(source.erase("a", a.rev).unwrap());
        let seq2 = replicate(&source, &target, seq, None).unwrap();
        assert!(seq2 > seq);
        let replicated = target_store.get("a").unwrap();
        assert!(replicated.deleted);
        assert_eq!(target_store.replicate_get("a").unwrap().revisions.len(), 3);
    }

    #[test]
    fn test_replication_is_idempotent() {
        let source = store("src");
        let target_store = store("dst");
        let target = LocalTarget::new(target_store.clone());

        assert!(source.put(&Document::new("a", json!(1))).unwrap());
        let seq = replicate(&source, &target, 0, None).unwrap();
        // replaying the same feed transfers nothing new
        assert_eq!(replicate(&source, &target, 0, None).unwrap(), seq);
        assert_eq!(target_store.revisions("a").unwrap().len(), 1);
    }

    #[test]
    fn test_filter_skips_documents() {
        let source = store("src");
        let target_store = store("dst");
        let target = LocalTarget::new(target_store.clone());

        assert!(source.put(&Document::new("keep", json!(1))).unwrap());
        assert!(source.put(&Document::new("skip", json!(2))).unwrap());
        let filter = |doc: &DocumentRepl| doc.id != "skip";
        replicate(&source, &target, 0, Some(&filter)).unwrap();

        assert!(!target_store.get("keep").unwrap().deleted);
        assert!(target_store.get("skip").unwrap().deleted);
    }

    #[test]
    fn test_diverged_target_reports_conflict_and_continues() {
        let source = store("src");
        let target_store = store("dst");
        let target = LocalTarget::new(target_store.clone());

        // both sides wrote the same id independently
        assert!(source.put(&Document::new("d", json!("source"))).unwrap());
        assert!(target_store.put(&Document::new("d", json!("target"))).unwrap());
        assert!(source.put(&Document::new("e", json!("fine"))).unwrap());

        let seq = replicate(&source, &target, 0, None).unwrap();
        assert_eq!(seq, source.seq(), "conflict must not stop the run");
        assert_eq!(target_store.get("d").unwrap().content, Some(json!("target")));
        assert_eq!(target_store.get("e").unwrap().content, Some(json!("fine")));
    }
}
