//! PersistenceAdapter trait: one serialized blob in a local key-value slot.
//!
//! Implementations:
//! - `InMemoryPersistence` - For testing
//! - `FilePersistence` (in store-daemon) - Single JSON file on disk
//!
//! The adapter is schema-unaware: it stores whatever bytes it is given and
//! hands the same bytes back on the next load. The blob is always a full
//! dump of the database; no incremental diff format exists.

use async_trait::async_trait;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Load failed: {0}")]
    Load(String),

    #[error("Save failed: {0}")]
    Save(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Local persistence for the serialized database blob.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Load the persisted blob. `None` means nothing has ever been saved.
    async fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Save a new blob, replacing any previous one.
    async fn save(&self, blob: &[u8]) -> Result<()>;
}

/// In-memory persistence for tests.
///
/// `set_fail_saves` injects save failures so tests can assert that in-memory
/// state survives a persistence error.
pub struct InMemoryPersistence {
    blob: RwLock<Option<Vec<u8>>>,
    fail_saves: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the stored blob (for simulating a prior session).
    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self {
            blob: RwLock::new(Some(blob)),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `save` fail.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// The currently stored blob, if any.
    pub fn stored(&self) -> Option<Vec<u8>> {
        self.blob.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self {
            blob: RwLock::new(None),
            fail_saves: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blob.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, blob: &[u8]) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::Save("injected failure".into()));
        }
        *self.blob.write().unwrap_or_else(|e| e.into_inner()) = Some(blob.to_vec());
        Ok(())
    }
}

// Allow sharing one adapter between a store and test assertions.
#[async_trait]
impl<T: PersistenceAdapter> PersistenceAdapter for std::sync::Arc<T> {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        (**self).load().await
    }

    async fn save(&self, blob: &[u8]) -> Result<()> {
        (**self).save(blob).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_empty() {
        let p = InMemoryPersistence::new();
        assert_eq!(p.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let p = InMemoryPersistence::new();
        p.save(b"blob").await.unwrap();
        assert_eq!(p.load().await.unwrap(), Some(b"blob".to_vec()));
    }

    #[tokio::test]
    async fn test_injected_save_failure() {
        let p = InMemoryPersistence::new();
        p.save(b"first").await.unwrap();
        p.set_fail_saves(true);
        assert!(p.save(b"second").await.is_err());
        // Previous blob untouched
        assert_eq!(p.load().await.unwrap(), Some(b"first".to_vec()));
    }
}
