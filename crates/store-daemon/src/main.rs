//! store-daemon: Headless sync daemon for a local-first document store.
//!
//! Holds the database in memory, persists it to a single JSON file, and keeps
//! it reconciled with a shared remote directory acting as the commit log.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use store_daemon::config::Args;
use store_daemon::persistence::FilePersistence;
use store_daemon::remote::FileRemote;

use store_core::remote::short_id;
use store_core::{Database, StoreEvent, SyncEngine};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,store_daemon=debug"
    } else {
        "info,store_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting store-daemon");
    info!("Database file: {:?}", args.data);
    info!("Remote directory: {:?}", args.remote);
    info!("Writer identity: {}", args.writer);

    let persistence = Arc::new(FilePersistence::new(&args.data));
    let db = Database::open(persistence).await;
    let remote = FileRemote::new(&args.remote);

    // Log store activity
    let _sub = db.events().subscribe(|event| match event {
        StoreEvent::LocalChange { collection, doc_id } => {
            info!("Local change: {}/{}", collection, doc_id);
        }
        StoreEvent::RemoteChange { revision_id, author, .. } => {
            info!("Remote change {} from {}", short_id(&revision_id), author);
        }
        StoreEvent::SyncError { message } => {
            warn!("Sync error: {}", message);
        }
        StoreEvent::SyncStarted | StoreEvent::SyncFinished => {}
    });

    let engine = SyncEngine::new(db, remote, args.sync_config());
    let (handle, task) = engine.start();
    let runner = tokio::spawn(task);

    info!("Daemon running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.shutdown();
    runner.await?;

    info!("Shutting down");
    Ok(())
}
