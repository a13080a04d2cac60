//! Database: the in-memory nested mapping of collections to documents.
//!
//! The database is an explicitly constructed value (no ambient singleton);
//! collaborators receive a clone, which shares the underlying state. Every
//! mutating call updates memory, stamps system timestamps, serializes the
//! whole database to the persistence adapter, and emits a `LocalChange`
//! event, in that order.
//!
//! Durability is at-least-once: a failed persistence write is logged and the
//! in-memory mutation is kept, so the caller sees the operation succeed. The
//! next successful write persists the accumulated state.

use crate::batch::Batch;
use crate::document::{self, CREATED_AT, Document, Fields, UPDATED_AT};
use crate::events::{EventBus, StoreEvent};
use crate::persistence::PersistenceAdapter;
use crate::query::{GroupQuery, Operator, Query};

use indexmap::IndexMap;
use indexmap::map::Entry;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid document reference: {0}")]
    InvalidReference(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One collection: document id -> field map, in insertion order.
pub type CollectionState = IndexMap<String, Fields>;

/// The whole database: collection name -> collection, in insertion order.
///
/// This is also the persistence/publish blob format (as JSON).
pub type DatabaseSnapshot = IndexMap<String, CollectionState>;

struct Inner {
    state: RwLock<DatabaseSnapshot>,
    persistence: Arc<dyn PersistenceAdapter>,
    events: Arc<EventBus>,
}

/// The document store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Open a database backed by the given persistence adapter.
    ///
    /// Loads the persisted blob if one exists. A malformed blob is discarded
    /// with a warning and the database starts empty; the sync engine's
    /// bootstrap then repopulates it from the remote's current snapshot.
    pub async fn open(persistence: Arc<dyn PersistenceAdapter>) -> Self {
        let state = match persistence.load().await {
            Ok(Some(blob)) => match serde_json::from_slice::<DatabaseSnapshot>(&blob) {
                Ok(snapshot) => {
                    debug!(collections = snapshot.len(), "Loaded local database blob");
                    snapshot
                }
                Err(e) => {
                    warn!("Discarding malformed local blob: {}", e);
                    DatabaseSnapshot::default()
                }
            },
            Ok(None) => DatabaseSnapshot::default(),
            Err(e) => {
                warn!("Failed to load local blob, starting empty: {}", e);
                DatabaseSnapshot::default()
            }
        };

        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(state),
                persistence,
                events: Arc::new(EventBus::new()),
            }),
        }
    }

    /// The event bus collaborators subscribe to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Handle to a named collection. The collection need not exist yet.
    pub fn collection(&self, name: &str) -> CollectionHandle {
        CollectionHandle {
            db: self.clone(),
            name: name.to_string(),
        }
    }

    /// Cross-collection query over every sub-collection named `name`.
    pub fn collection_group(&self, name: &str) -> GroupQuery {
        GroupQuery::new(self.clone(), name.to_string())
    }

    /// Start a batch of pending operations.
    pub fn batch(&self) -> Batch {
        Batch::new(self.clone())
    }

    /// Copy of the full database contents.
    pub fn snapshot(&self) -> DatabaseSnapshot {
        self.read_state(|state| state.clone())
    }

    /// True when no collection holds any document.
    pub fn is_empty(&self) -> bool {
        self.read_state(|state| state.values().all(|c| c.is_empty()))
    }

    /// Serialize the whole database to the blob format used for persistence
    /// and remote publishing.
    pub fn export_blob(&self) -> Vec<u8> {
        self.read_state(|state| {
            serde_json::to_vec(state).expect("database state is valid JSON")
        })
    }

    /// Replace the entire database with a remotely fetched snapshot and
    /// persist it. No field-level merge is attempted, and no `LocalChange`
    /// events are emitted for the overwritten documents.
    pub(crate) async fn apply_remote_snapshot(&self, snapshot: DatabaseSnapshot) {
        self.with_state_mut(|state| *state = snapshot);
        self.persist().await;
    }

    /// Serialize and save the current state, swallowing write failures.
    pub(crate) async fn persist(&self) {
        let blob = self.export_blob();
        if let Err(e) = self.inner.persistence.save(&blob).await {
            // The in-memory mutation is kept; the next successful save
            // catches up with the accumulated state.
            warn!("Persistence write failed, continuing in memory: {}", e);
        }
    }

    pub(crate) fn emit_local_change(&self, collection: &str, doc_id: &str) {
        self.inner.events.emit(StoreEvent::LocalChange {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
        });
    }

    pub(crate) fn read_state<R>(&self, f: impl FnOnce(&DatabaseSnapshot) -> R) -> R {
        let state = self.inner.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut DatabaseSnapshot) -> R) -> R {
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

/// Reject references the store cannot address.
pub(crate) fn check_reference(collection: &str, id: &str) -> Result<()> {
    if collection.is_empty() {
        return Err(StoreError::InvalidReference("empty collection name".into()));
    }
    if id.is_empty() {
        return Err(StoreError::InvalidReference("empty document id".into()));
    }
    Ok(())
}

fn strip_system_fields(fields: &mut Fields) {
    // System timestamps are stamped by the store, never by the caller.
    fields.shift_remove(CREATED_AT);
    fields.shift_remove(UPDATED_AT);
}

/// Set a document, replacing or shallow-merging its body.
///
/// `createdAt` is preserved only if the document already existed; a set on a
/// fresh id stamps both timestamps. Merge is top-level only, no deep merge.
pub(crate) fn apply_set(
    state: &mut DatabaseSnapshot,
    collection: &str,
    id: &str,
    mut fields: Fields,
    merge: bool,
) {
    strip_system_fields(&mut fields);
    let now = document::now_iso();
    let coll = state.entry(collection.to_string()).or_default();
    match coll.entry(id.to_string()) {
        Entry::Occupied(mut entry) => {
            let existing = entry.get_mut();
            if merge {
                for (k, v) in fields {
                    existing.insert(k, v);
                }
                existing.insert(UPDATED_AT.to_string(), Value::String(now));
            } else {
                if let Some(created) = existing.get(CREATED_AT).cloned() {
                    fields.insert(CREATED_AT.to_string(), created);
                }
                fields.insert(UPDATED_AT.to_string(), Value::String(now));
                *existing = fields;
            }
        }
        Entry::Vacant(entry) => {
            fields.insert(CREATED_AT.to_string(), Value::String(now.clone()));
            fields.insert(UPDATED_AT.to_string(), Value::String(now));
            entry.insert(fields);
        }
    }
}

/// Merge partial fields into an existing document.
///
/// Returns false (a no-op, not a create) when the document does not exist.
pub(crate) fn apply_update(
    state: &mut DatabaseSnapshot,
    collection: &str,
    id: &str,
    mut fields: Fields,
) -> bool {
    let Some(existing) = state.get_mut(collection).and_then(|c| c.get_mut(id)) else {
        return false;
    };
    strip_system_fields(&mut fields);
    for (k, v) in fields {
        existing.insert(k, v);
    }
    existing.insert(UPDATED_AT.to_string(), Value::String(document::now_iso()));
    true
}

/// Remove a document. Returns false when it did not exist.
pub(crate) fn apply_delete(state: &mut DatabaseSnapshot, collection: &str, id: &str) -> bool {
    state
        .get_mut(collection)
        .is_some_and(|c| c.shift_remove(id).is_some())
}

/// Handle to a named collection.
#[derive(Clone)]
pub struct CollectionHandle {
    db: Database,
    name: String,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of all current documents, in insertion order.
    pub fn get(&self) -> Vec<Document> {
        self.db.read_state(|state| {
            state
                .get(&self.name)
                .map(|coll| {
                    coll.iter()
                        .map(|(id, fields)| Document {
                            id: id.clone(),
                            fields: fields.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Handle to a document by id. The document need not exist.
    pub fn doc(&self, id: &str) -> DocumentHandle {
        DocumentHandle {
            db: self.db.clone(),
            collection: self.name.clone(),
            id: id.to_string(),
        }
    }

    /// Create a document under a freshly generated id.
    pub async fn add(&self, fields: Fields) -> Result<DocumentHandle> {
        let handle = self.doc(&document::generate_id());
        handle.set(fields).await?;
        Ok(handle)
    }

    /// Start a query with one predicate.
    pub fn filter(&self, field: &str, op: Operator, value: Value) -> Query {
        Query::new(self.db.clone(), self.name.clone()).filter(field, op, value)
    }
}

/// Handle to a single document within a collection.
#[derive(Clone)]
pub struct DocumentHandle {
    db: Database,
    collection: String,
    id: String,
}

impl DocumentHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Snapshot of the document, or `None` if it does not exist.
    pub fn get(&self) -> Option<Document> {
        self.db.read_state(|state| {
            state
                .get(&self.collection)
                .and_then(|c| c.get(&self.id))
                .map(|fields| Document {
                    id: self.id.clone(),
                    fields: fields.clone(),
                })
        })
    }

    /// Replace the document body (`merge = false` semantics).
    pub async fn set(&self, fields: Fields) -> Result<()> {
        self.write(fields, false).await
    }

    /// Shallow-merge top-level fields into the document (`merge = true`).
    pub async fn set_merge(&self, fields: Fields) -> Result<()> {
        self.write(fields, true).await
    }

    async fn write(&self, fields: Fields, merge: bool) -> Result<()> {
        check_reference(&self.collection, &self.id)?;
        self.db
            .with_state_mut(|state| apply_set(state, &self.collection, &self.id, fields, merge));
        self.db.persist().await;
        self.db.emit_local_change(&self.collection, &self.id);
        Ok(())
    }

    /// Merge partial fields into the document. A no-op if it does not exist.
    pub async fn update(&self, fields: Fields) -> Result<()> {
        check_reference(&self.collection, &self.id)?;
        let applied = self
            .db
            .with_state_mut(|state| apply_update(state, &self.collection, &self.id, fields));
        if applied {
            self.db.persist().await;
            self.db.emit_local_change(&self.collection, &self.id);
        }
        Ok(())
    }

    /// Delete the document. A no-op if it does not exist.
    pub async fn delete(&self) -> Result<()> {
        check_reference(&self.collection, &self.id)?;
        let existed = self
            .db
            .with_state_mut(|state| apply_delete(state, &self.collection, &self.id));
        if existed {
            self.db.persist().await;
            self.db.emit_local_change(&self.collection, &self.id);
        }
        Ok(())
    }

    /// Sub-collection of this document, stored as a parent-prefixed
    /// top-level collection (`{parent}_{id}_{name}`).
    ///
    /// Group queries recover the parent id from this name by taking the last
    /// `_`-separated segment before the sub-collection name, so document ids
    /// used as sub-collection parents must not contain `_`. Generated ids
    /// never do; caller-chosen ids with underscores get misattributed.
    pub fn collection(&self, name: &str) -> CollectionHandle {
        CollectionHandle {
            db: self.db.clone(),
            name: format!("{}_{}_{}", self.collection, self.id, name),
        }
    }
}
