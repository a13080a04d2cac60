//! SyncEngine: polls the remote commit log and reconciles the local store.
//!
//! The engine cycles through a small state machine:
//!
//! 1. `Idle -> Polling`: on a timer tick, ask the remote for its head revision
//! 2. `Polling -> Idle`: head equals the sync cursor, nothing to do
//! 3. `Polling -> Fetching`: head moved past the sync cursor
//! 4. `Fetching -> Idle`: the head is our own publish (echo); advance the
//!    cursor without touching the store
//! 5. `Applying -> Idle`: foreign-authored head; overwrite the whole local
//!    database with the fetched snapshot, persist, advance the cursor, and
//!    emit a `RemoteChange` event
//! 6. any state -> `ErrorBackoff`: a remote failure abandons the cycle; the
//!    next tick retries with no additional delay
//!
//! Local changes are published after a debounce delay so a burst of writes
//! settles into a single revision. The run loop awaits each step to
//! completion before servicing the next tick or command, so at most one
//! snapshot application is ever in flight; a head that moves again
//! mid-apply is picked up on the next tick.
//!
//! Conflicting concurrent writers are not detected: the later publish becomes
//! the head and its snapshot wins wholesale on the next poll. Known data-loss
//! risk of the snapshot-overwrite model.

use crate::events::StoreEvent;
use crate::remote::{RemoteError, RemoteRepository, RevisionInfo, short_id};
use crate::store::{Database, DatabaseSnapshot};

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Malformed remote snapshot: {0}")]
    MalformedSnapshot(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SyncState {
    Idle,
    Polling,
    Fetching,
    Applying,
    ErrorBackoff,
}

/// Sync engine tunables.
///
/// The poll interval and debounce delay are configuration, not constants;
/// the defaults match the original deployment values.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Stable writer identity (e.g. an email-like string). Stamped on every
    /// published revision and compared against revision authors to detect
    /// echoes of our own commits.
    pub writer_id: String,
    /// Fixed polling period.
    pub poll_interval: Duration,
    /// Delay after a local change before publishing, letting a burst of
    /// writes settle into one revision.
    pub debounce: Duration,
}

impl SyncConfig {
    pub fn new(writer_id: impl Into<String>) -> Self {
        Self {
            writer_id: writer_id.into(),
            poll_interval: Duration::from_secs(3),
            debounce: Duration::from_secs(5),
        }
    }
}

/// Commands accepted by a running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Run one polling step immediately, bypassing the timer.
    SyncNow,
    /// The hosting process regained foreground/visibility; poll out of cycle.
    Foregrounded,
    /// Resume polling.
    Enable,
    /// Cancel future polls. Does not abort a step already in flight.
    Disable,
    /// Stop the engine loop.
    Shutdown,
}

/// Handle for sending commands to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncCommand>,
}

impl SyncHandle {
    pub fn sync_now(&self) {
        let _ = self.tx.send(SyncCommand::SyncNow);
    }

    pub fn foregrounded(&self) {
        let _ = self.tx.send(SyncCommand::Foregrounded);
    }

    pub fn enable(&self) {
        let _ = self.tx.send(SyncCommand::Enable);
    }

    pub fn disable(&self) {
        let _ = self.tx.send(SyncCommand::Disable);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SyncCommand::Shutdown);
    }
}

/// Point-in-time engine status for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub state: SyncState,
    pub cursor: Option<String>,
    #[serde(rename = "pendingPublish")]
    pub pending_publish: bool,
}

/// Polls a `RemoteRepository` and keeps one `Database` reconciled with it.
pub struct SyncEngine<R: RemoteRepository> {
    db: Database,
    remote: R,
    config: SyncConfig,
    /// Last revision observed from the remote. Never fabricated locally.
    cursor: Option<String>,
    state: SyncState,
    /// A local change awaits publishing after the debounce delay.
    pending_publish: bool,
    enabled: bool,
}

impl<R: RemoteRepository> SyncEngine<R> {
    pub fn new(db: Database, remote: R, config: SyncConfig) -> Self {
        Self {
            db,
            remote,
            config,
            cursor: None,
            state: SyncState::Idle,
            pending_publish: false,
            enabled: true,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            enabled: self.enabled,
            state: self.state,
            cursor: self.cursor.clone(),
            pending_publish: self.pending_publish,
        }
    }

    /// Initial poll on startup.
    ///
    /// An empty local database adopts the remote head unconditionally (this
    /// is how a fresh client or one with a discarded blob cold-starts). A
    /// non-empty database only seeds the cursor, so pre-existing local state
    /// is not clobbered before the first publish.
    pub async fn bootstrap(&mut self) {
        match self.remote.latest_revision().await {
            Ok(Some(head)) => {
                if self.db.is_empty() {
                    info!("Local database empty, adopting remote head {}", short_id(&head.id));
                    if let Err(e) = self.adopt_head(&head).await {
                        warn!("Failed to adopt remote head: {}", e);
                        self.emit_error(&e);
                    }
                } else {
                    debug!("Seeding cursor at {}", short_id(&head.id));
                    self.cursor = Some(head.id);
                }
            }
            Ok(None) => {
                debug!("Remote is empty, cold start");
            }
            Err(e) => {
                warn!("Initial poll failed: {}", e);
                self.emit_error(&SyncError::Remote(e));
            }
        }
    }

    /// One polling step: check the head revision, fetch and apply if it moved.
    pub async fn poll_once(&mut self) {
        if !self.enabled {
            return;
        }

        self.state = SyncState::Polling;
        let head = match self.remote.latest_revision().await {
            Ok(head) => head,
            Err(e) => {
                warn!("Poll failed: {}", e);
                self.emit_error(&SyncError::Remote(e));
                // No extra backoff delay; the next tick retries normally.
                self.state = SyncState::ErrorBackoff;
                return;
            }
        };
        self.state = SyncState::Idle;

        let Some(head) = head else {
            return;
        };
        if self.cursor.as_deref() == Some(head.id.as_str()) {
            return;
        }

        // Awaited to completion before the next step is serviced, so at most
        // one apply is ever in flight.
        self.apply_revision(head).await;
    }

    /// Publish the current database snapshot as a new revision.
    ///
    /// On failure the publish stays pending and is retried after another
    /// debounce period.
    pub async fn publish_once(&mut self, message: &str) {
        self.pending_publish = false;
        let blob = self.db.export_blob();
        match self
            .remote
            .publish(&blob, &self.config.writer_id, message)
            .await
        {
            Ok(revision_id) => {
                info!("Published revision {}", short_id(&revision_id));
                // The id came from the remote, so the cursor may advance to
                // it; this also avoids refetching our own snapshot.
                self.cursor = Some(revision_id);
            }
            Err(e) => {
                warn!("Publish failed: {}", e);
                self.emit_error(&SyncError::Remote(e));
                self.pending_publish = true;
            }
        }
    }

    /// Record that a local change occurred (debounced publish follows).
    pub fn note_local_change(&mut self) {
        self.pending_publish = true;
    }

    pub fn has_pending_publish(&self) -> bool {
        self.pending_publish
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        info!("Sync {}", if enabled { "enabled" } else { "disabled" });
    }

    async fn apply_revision(&mut self, head: RevisionInfo) {
        self.state = SyncState::Fetching;
        self.db.events().emit(StoreEvent::SyncStarted);

        let result = self.fetch_and_apply(&head).await;
        match result {
            Ok(()) => {
                self.state = SyncState::Idle;
            }
            Err(e) => {
                warn!("Failed to apply revision {}: {}", short_id(&head.id), e);
                self.emit_error(&e);
                self.state = SyncState::ErrorBackoff;
            }
        }

        self.db.events().emit(StoreEvent::SyncFinished);
    }

    async fn fetch_and_apply(&mut self, head: &RevisionInfo) -> Result<()> {
        if head.author == self.config.writer_id {
            // Echo of our own commit: advance the cursor so it is not
            // re-processed, but leave the store untouched.
            debug!("Skipping own revision {}", short_id(&head.id));
            self.cursor = Some(head.id.clone());
            return Ok(());
        }

        let snapshot = self.fetch_snapshot(&head.id).await?;

        self.state = SyncState::Applying;
        self.db.apply_remote_snapshot(snapshot.clone()).await;
        self.cursor = Some(head.id.clone());
        info!(
            "Applied revision {} from {}",
            short_id(&head.id),
            head.author
        );
        self.db.events().emit(StoreEvent::RemoteChange {
            revision_id: head.id.clone(),
            author: head.author.clone(),
            snapshot,
        });
        Ok(())
    }

    /// Fetch and apply a head revision regardless of author (bootstrap path).
    async fn adopt_head(&mut self, head: &RevisionInfo) -> Result<()> {
        let snapshot = self.fetch_snapshot(&head.id).await?;
        self.db.apply_remote_snapshot(snapshot.clone()).await;
        self.cursor = Some(head.id.clone());
        self.db.events().emit(StoreEvent::RemoteChange {
            revision_id: head.id.clone(),
            author: head.author.clone(),
            snapshot,
        });
        Ok(())
    }

    async fn fetch_snapshot(&self, revision_id: &str) -> Result<DatabaseSnapshot> {
        let blob = self.remote.fetch_snapshot(revision_id).await?;
        serde_json::from_slice(&blob).map_err(|e| SyncError::MalformedSnapshot(e.to_string()))
    }

    fn emit_error(&self, error: &SyncError) {
        self.db.events().emit(StoreEvent::SyncError {
            message: error.to_string(),
        });
    }

    /// Run the engine until `Shutdown`.
    ///
    /// Returns a handle for manual triggers before spawning. Polls on a
    /// fixed interval, publishes local changes after the debounce delay, and
    /// services commands in between.
    pub fn start(self) -> (SyncHandle, impl std::future::Future<Output = ()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SyncHandle { tx };
        (handle.clone(), self.run(rx))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SyncCommand>) {
        // Local mutations arrive through the store's event bus.
        let (change_tx, mut change_rx) = mpsc::unbounded_channel();
        let _sub = self.db.events().subscribe(move |event| {
            if let StoreEvent::LocalChange { .. } = event {
                let _ = change_tx.send(());
            }
        });

        if self.enabled {
            self.bootstrap().await;
        }

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let publish_at = tokio::time::sleep(self.config.debounce);
        tokio::pin!(publish_at);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }

                Some(()) = change_rx.recv() => {
                    self.note_local_change();
                    publish_at.as_mut().reset(Instant::now() + self.config.debounce);
                }

                () = &mut publish_at, if self.pending_publish => {
                    if self.enabled {
                        self.publish_once("sync: local changes").await;
                    }
                    if self.pending_publish {
                        // Publish failed or sync is disabled; retry later.
                        publish_at.as_mut().reset(Instant::now() + self.config.debounce);
                    } else {
                        // Observe our own commit promptly so the cursor and
                        // any queued foreign revisions settle.
                        self.poll_once().await;
                    }
                }

                Some(command) = commands.recv() => {
                    match command {
                        SyncCommand::SyncNow | SyncCommand::Foregrounded => {
                            self.poll_once().await;
                        }
                        SyncCommand::Enable => self.set_enabled(true),
                        SyncCommand::Disable => self.set_enabled(false),
                        SyncCommand::Shutdown => break,
                    }
                }
            }
        }

        debug!("Sync engine stopped");
    }
}
