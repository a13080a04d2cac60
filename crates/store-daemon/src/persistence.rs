//! File-backed persistence for the local database.
//!
//! The whole database is one JSON file. Saves go through a temporary file in
//! the same directory followed by a rename, so a crash mid-write never leaves
//! a truncated database behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use store_core::{PersistenceAdapter, PersistenceError};
use tokio::fs;
use tracing::debug;

type Result<T> = std::result::Result<T, PersistenceError>;

pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PersistenceAdapter for FilePersistence {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::Load(e.to_string())),
        }
    }

    async fn save(&self, blob: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::Save(e.to_string()))?;
        }

        let tmp = self.tmp_path();
        fs::write(&tmp, blob)
            .await
            .map_err(|e| PersistenceError::Save(e.to_string()))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PersistenceError::Save(e.to_string()))?;

        debug!("Saved {} bytes to {:?}", blob.len(), self.path);
        Ok(())
    }
}
