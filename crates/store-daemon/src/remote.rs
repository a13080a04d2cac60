//! File-backed remote: a shared directory acting as the commit log.
//!
//! Layout inside the remote directory:
//! - `log.json` holds the ordered revision metadata, newest last
//! - `snapshots/<revision_id>.json` holds each snapshot blob
//!
//! Multiple daemons pointed at the same directory (e.g. on a network mount)
//! see each other's revisions through polling. Snapshot files are written
//! before the log entry, so a revision listed in the log always has its blob
//! on disk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use store_core::remote::{RemoteError, RemoteRepository, Result, RevisionInfo, revision_id};
use store_core::document::now_iso;
use tokio::fs;
use tracing::debug;

const LOG_FILE: &str = "log.json";
const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    id: String,
    author: String,
    timestamp: String,
    message: String,
}

impl LogEntry {
    fn info(&self) -> RevisionInfo {
        RevisionInfo {
            id: self.id.clone(),
            author: self.author.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

pub struct FileRemote {
    dir: PathBuf,
}

impl FileRemote {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn snapshot_path(&self, revision_id: &str) -> PathBuf {
        self.dir.join(SNAPSHOT_DIR).join(format!("{revision_id}.json"))
    }

    async fn read_log(&self) -> Result<Vec<LogEntry>> {
        let raw = match fs::read(self.log_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RemoteError::Unavailable(e.to_string())),
        };
        serde_json::from_slice(&raw).map_err(|e| RemoteError::Other(e.to_string()))
    }

    async fn write_log(&self, log: &[LogEntry]) -> Result<()> {
        let raw =
            serde_json::to_vec_pretty(log).map_err(|e| RemoteError::Other(e.to_string()))?;
        let tmp = self.dir.join(format!("{LOG_FILE}.tmp"));
        fs::write(&tmp, raw)
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        fs::rename(&tmp, self.log_path())
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl RemoteRepository for FileRemote {
    async fn latest_revision(&self) -> Result<Option<RevisionInfo>> {
        let log = self.read_log().await?;
        Ok(log.last().map(LogEntry::info))
    }

    async fn fetch_snapshot(&self, revision_id: &str) -> Result<Vec<u8>> {
        match fs::read(self.snapshot_path(revision_id)).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RemoteError::UnknownRevision(revision_id.to_string()))
            }
            Err(e) => Err(RemoteError::Unavailable(e.to_string())),
        }
    }

    async fn publish(&self, blob: &[u8], author: &str, message: &str) -> Result<String> {
        fs::create_dir_all(self.dir.join(SNAPSHOT_DIR))
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        let mut log = self.read_log().await?;
        let parent = log.last().map(|entry| entry.id.clone());
        let id = revision_id(log.len() as u64, parent.as_deref(), author, blob);

        // Snapshot first, log entry second
        fs::write(self.snapshot_path(&id), blob)
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        log.push(LogEntry {
            id: id.clone(),
            author: author.to_string(),
            timestamp: now_iso(),
            message: message.to_string(),
        });
        self.write_log(&log).await?;

        debug!("Published revision {} ({} bytes)", id, blob.len());
        Ok(id)
    }
}
