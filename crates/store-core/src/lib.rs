//! store-core: Local-first document store with commit-log synchronization.
//!
//! This crate provides the core functionality for:
//! - A collection/document database held in memory and persisted as one blob
//! - Chainable predicate queries and collection-group queries
//! - Batched writes with a single persistence flush
//! - A polling sync engine reconciling the store with a shared commit log
//! - PersistenceAdapter and RemoteRepository trait abstractions

pub mod batch;
pub mod document;
pub mod events;
pub mod persistence;
pub mod query;
pub mod remote;
pub mod store;
pub mod sync_engine;

pub use batch::Batch;
pub use document::{Document, Fields};
pub use events::{EventBus, StoreEvent, Subscription};
pub use persistence::{InMemoryPersistence, PersistenceAdapter, PersistenceError};
pub use query::{GroupQuery, Operator, Query};
pub use remote::{InMemoryRemote, RemoteError, RemoteRepository, RevisionInfo};
pub use store::{
    CollectionHandle, CollectionState, Database, DatabaseSnapshot, DocumentHandle, StoreError,
};
pub use sync_engine::{
    SyncCommand, SyncConfig, SyncEngine, SyncError, SyncHandle, SyncState, SyncStatus,
};
