//! Daemon command-line configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use store_core::SyncConfig;

#[derive(Parser, Debug)]
#[command(name = "store-daemon")]
#[command(about = "Local-first document store sync daemon")]
pub struct Args {
    /// Path to the local database file
    #[arg(short, long)]
    pub data: PathBuf,

    /// Path to the shared remote directory (the commit log)
    #[arg(short, long)]
    pub remote: PathBuf,

    /// Writer identity stamped on published revisions
    #[arg(short, long)]
    pub writer: String,

    /// Polling interval in seconds
    #[arg(long, default_value_t = 3)]
    pub poll_secs: u64,

    /// Debounce delay before publishing local changes, in seconds
    #[arg(long, default_value_t = 5)]
    pub debounce_secs: u64,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

impl Args {
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(self.writer.clone());
        config.poll_interval = Duration::from_secs(self.poll_secs);
        config.debounce = Duration::from_secs(self.debounce_secs);
        config
    }
}
