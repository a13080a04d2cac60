//! RemoteRepository trait: a commit-log-backed remote for whole snapshots.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing
//! - `FileRemote` (in store-daemon) - Shared directory acting as the log
//!
//! The remote stores an append-only history of full database snapshots. All
//! mutation is append-only publishing; no partial or field-level remote
//! writes exist. Revision ids are content hashes and are never fabricated by
//! clients.

use crate::document::now_iso;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown revision: {0}")]
    UnknownRevision(String),

    #[error("Remote error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Metadata for a revision in the remote commit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionInfo {
    /// Content-hash identifier of the revision.
    pub id: String,
    /// Writer identity that published the revision.
    pub author: String,
    /// Publish time, ISO-8601.
    pub timestamp: String,
}

/// A commit-log-backed remote holding whole-database snapshots.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Latest revision in the log, or `None` for an empty remote.
    async fn latest_revision(&self) -> Result<Option<RevisionInfo>>;

    /// Full snapshot blob at the given revision.
    async fn fetch_snapshot(&self, revision_id: &str) -> Result<Vec<u8>>;

    /// Append a new snapshot to the log, returning its revision id.
    async fn publish(&self, blob: &[u8], author: &str, message: &str) -> Result<String>;
}

/// Compute a revision id from the log position, parent id, author, and blob.
///
/// Including the position keeps ids unique even when the same author
/// republishes an identical snapshot.
pub fn revision_id(position: u64, parent: Option<&str>, author: &str, blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(position.to_be_bytes());
    if let Some(parent) = parent {
        hasher.update(parent.as_bytes());
    }
    hasher.update(author.as_bytes());
    hasher.update(blob);
    hex::encode(hasher.finalize())
}

/// Abbreviate a revision id for log output.
///
/// Ids from `revision_id` are hex, but file-backed remotes read them from a
/// hand-editable log, so the cut respects char boundaries.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(7) {
        Some((i, _)) => &id[..i],
        None => id,
    }
}

struct Commit {
    info: RevisionInfo,
    #[allow(dead_code)]
    message: String,
    blob: Vec<u8>,
}

/// In-memory remote for tests: an append-only commit log.
///
/// `set_unavailable` injects transport failures on every operation so tests
/// can assert the engine's abandon-and-retry behavior.
#[derive(Default)]
pub struct InMemoryRemote {
    log: Mutex<Vec<Commit>>,
    unavailable: AtomicBool,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of revisions in the log.
    pub fn revision_count(&self) -> usize {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteRepository for InMemoryRemote {
    async fn latest_revision(&self) -> Result<Option<RevisionInfo>> {
        self.check_available()?;
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        Ok(log.last().map(|commit| commit.info.clone()))
    }

    async fn fetch_snapshot(&self, revision_id: &str) -> Result<Vec<u8>> {
        self.check_available()?;
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.iter()
            .find(|commit| commit.info.id == revision_id)
            .map(|commit| commit.blob.clone())
            .ok_or_else(|| RemoteError::UnknownRevision(revision_id.to_string()))
    }

    async fn publish(&self, blob: &[u8], author: &str, message: &str) -> Result<String> {
        self.check_available()?;
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        let parent = log.last().map(|commit| commit.info.id.clone());
        let id = revision_id(log.len() as u64, parent.as_deref(), author, blob);
        log.push(Commit {
            info: RevisionInfo {
                id: id.clone(),
                author: author.to_string(),
                timestamp: now_iso(),
            },
            message: message.to_string(),
            blob: blob.to_vec(),
        });
        Ok(id)
    }
}

// Allow sharing one remote between multiple engines (and test assertions).
#[async_trait]
impl<T: RemoteRepository> RemoteRepository for std::sync::Arc<T> {
    async fn latest_revision(&self) -> Result<Option<RevisionInfo>> {
        (**self).latest_revision().await
    }

    async fn fetch_snapshot(&self, revision_id: &str) -> Result<Vec<u8>> {
        (**self).fetch_snapshot(revision_id).await
    }

    async fn publish(&self, blob: &[u8], author: &str, message: &str) -> Result<String> {
        (**self).publish(blob, author, message).await
    }
}
