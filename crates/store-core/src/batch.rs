//! Batch: an ordered sequence of pending operations applied on commit.
//!
//! A batch buffers set/update/delete operations against document handles and
//! applies them in append order on `commit`, with exactly the same
//! per-operation effects as the non-batched calls. The only optimization is
//! a single persistence write at the end instead of one per operation.
//!
//! There is no atomicity and no rollback: if an operation fails
//! mid-application, the earlier operations remain applied (and are persisted
//! and notified). This is a documented weakness of the design, not a bug.

use crate::document::Fields;
use crate::store::{
    self, Database, DocumentHandle, Result, apply_delete, apply_set, apply_update,
};

use tracing::debug;

enum BatchOp {
    Set {
        collection: String,
        id: String,
        fields: Fields,
        merge: bool,
    },
    Update {
        collection: String,
        id: String,
        fields: Fields,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl BatchOp {
    fn reference(&self) -> (&str, &str) {
        match self {
            BatchOp::Set { collection, id, .. }
            | BatchOp::Update { collection, id, .. }
            | BatchOp::Delete { collection, id } => (collection, id),
        }
    }
}

/// An in-memory sequence of pending operations. No identity beyond its
/// lifetime; dropped without commit, it has no effect.
pub struct Batch {
    db: Database,
    ops: Vec<BatchOp>,
}

impl Batch {
    pub(crate) fn new(db: Database) -> Self {
        Self {
            db,
            ops: Vec::new(),
        }
    }

    /// Queue a body replacement for the document.
    pub fn set(&mut self, doc: &DocumentHandle, fields: Fields) -> &mut Self {
        self.ops.push(BatchOp::Set {
            collection: doc.collection_name().to_string(),
            id: doc.id().to_string(),
            fields,
            merge: false,
        });
        self
    }

    /// Queue a shallow merge into the document.
    pub fn set_merge(&mut self, doc: &DocumentHandle, fields: Fields) -> &mut Self {
        self.ops.push(BatchOp::Set {
            collection: doc.collection_name().to_string(),
            id: doc.id().to_string(),
            fields,
            merge: true,
        });
        self
    }

    /// Queue a partial update of the document.
    pub fn update(&mut self, doc: &DocumentHandle, fields: Fields) -> &mut Self {
        self.ops.push(BatchOp::Update {
            collection: doc.collection_name().to_string(),
            id: doc.id().to_string(),
            fields,
        });
        self
    }

    /// Queue a deletion of the document.
    pub fn delete(&mut self, doc: &DocumentHandle) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            collection: doc.collection_name().to_string(),
            id: doc.id().to_string(),
        });
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every queued operation in append order, then persist once.
    ///
    /// An invalid reference stops application at that operation; the applied
    /// prefix stays in place, is persisted, and its change events are
    /// emitted before the error returns.
    pub async fn commit(self) -> Result<()> {
        let total = self.ops.len();
        let mut applied: Vec<(String, String)> = Vec::new();
        let mut failure = None;

        self.db.with_state_mut(|state| {
            for op in self.ops {
                let (collection, id) = op_reference_owned(&op);
                if let Err(e) = store::check_reference(&collection, &id) {
                    failure = Some(e);
                    break;
                }
                let changed = match op {
                    BatchOp::Set { fields, merge, .. } => {
                        apply_set(state, &collection, &id, fields, merge);
                        true
                    }
                    BatchOp::Update { fields, .. } => apply_update(state, &collection, &id, fields),
                    BatchOp::Delete { .. } => apply_delete(state, &collection, &id),
                };
                if changed {
                    applied.push((collection, id));
                }
            }
        });

        debug!(applied = applied.len(), total, "Batch commit");

        if !applied.is_empty() {
            self.db.persist().await;
            for (collection, id) in &applied {
                self.db.emit_local_change(collection, id);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn op_reference_owned(op: &BatchOp) -> (String, String) {
    let (collection, id) = op.reference();
    (collection.to_string(), id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StoreEvent;
    use crate::persistence::InMemoryPersistence;
    use crate::store::StoreError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn fields(value: serde_json::Value) -> Fields {
        serde_json::from_value(value).unwrap()
    }

    async fn empty_db() -> (Database, Arc<InMemoryPersistence>) {
        let persistence = Arc::new(InMemoryPersistence::new());
        let db = Database::open(persistence.clone()).await;
        (db, persistence)
    }

    #[tokio::test]
    async fn test_commit_applies_in_order() {
        let (db, _) = empty_db().await;
        let coll = db.collection("students");

        let mut batch = db.batch();
        batch.set(&coll.doc("s1"), fields(json!({"a": 1})));
        batch.update(&coll.doc("s1"), fields(json!({"b": 2})));
        batch.set(&coll.doc("s2"), fields(json!({"a": 3})));
        batch.commit().await.unwrap();

        let s1 = coll.doc("s1").get().unwrap();
        assert_eq!(s1.field("a"), Some(&json!(1)));
        assert_eq!(s1.field("b"), Some(&json!(2)));
        assert!(coll.doc("s2").get().is_some());
    }

    #[tokio::test]
    async fn test_nothing_applied_before_commit() {
        let (db, _) = empty_db().await;
        let coll = db.collection("students");

        let mut batch = db.batch();
        batch.set(&coll.doc("s1"), fields(json!({"a": 1})));

        assert!(coll.doc("s1").get().is_none());
        drop(batch);
        assert!(coll.doc("s1").get().is_none());
    }

    #[tokio::test]
    async fn test_single_persist_per_commit() {
        let (db, persistence) = empty_db().await;
        let coll = db.collection("students");

        let mut batch = db.batch();
        batch.set(&coll.doc("s1"), fields(json!({"a": 1})));
        batch.set(&coll.doc("s2"), fields(json!({"a": 2})));
        batch.delete(&coll.doc("s1"));
        batch.commit().await.unwrap();

        let blob = persistence.stored().unwrap();
        assert_eq!(blob, db.export_blob());
        assert!(coll.doc("s1").get().is_none());
        assert!(coll.doc("s2").get().is_some());
    }

    #[tokio::test]
    async fn test_partial_apply_on_failure() {
        let (db, _) = empty_db().await;
        let coll = db.collection("students");

        let mut batch = db.batch();
        batch.set(&coll.doc("s1"), fields(json!({"a": 1})));
        // Second operation fails: empty document id
        batch.set(&coll.doc(""), fields(json!({"a": 2})));
        batch.set(&coll.doc("s3"), fields(json!({"a": 3})));

        let err = batch.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidReference(_)));

        // First operation's effect is observable; the third never ran
        assert!(coll.doc("s1").get().is_some());
        assert!(coll.doc("s3").get().is_none());
    }

    #[tokio::test]
    async fn test_update_of_missing_doc_is_noop_within_batch() {
        let (db, _) = empty_db().await;
        let coll = db.collection("students");

        let mut batch = db.batch();
        batch.update(&coll.doc("ghost"), fields(json!({"a": 1})));
        batch.set(&coll.doc("s1"), fields(json!({"a": 2})));
        batch.commit().await.unwrap();

        assert!(coll.doc("ghost").get().is_none());
        assert!(coll.doc("s1").get().is_some());
    }

    #[tokio::test]
    async fn test_events_emitted_after_commit_in_order() {
        let (db, _) = empty_db().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = db.events().subscribe(move |event| {
            if let StoreEvent::LocalChange { doc_id, .. } = event {
                seen_clone.lock().unwrap().push(doc_id);
            }
        });

        let coll = db.collection("students");
        let mut batch = db.batch();
        batch.set(&coll.doc("s1"), fields(json!({"a": 1})));
        batch.set(&coll.doc("s2"), fields(json!({"a": 2})));
        batch.commit().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_empty_batch_commit_is_silent() {
        let (db, persistence) = empty_db().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = db.events().subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        db.batch().commit().await.unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(persistence.stored(), None);
    }
}
