//! Replication client (replica side)
//!
//! The client:
//! - Restores the last activated point from `replica_state.json` on startup
//! - Pulls newer points from the primary (poll, on-demand trigger, or when a
//!   pinned search waits for a version)
//! - Stages fetched files in a temporary directory, installs them once every
//!   file is verified, opens the new point and only then activates it
//! - Retries failed syncs with exponential backoff
//!
//! # State machine
//!
//! ```text
//! DISCONNECTED ──► SYNCING ──► ACTIVE ──► SYNCING (poll / trigger)
//!       ▲             │
//!       └─── error ───┘
//! ```
//!
//! A failed attempt never touches the active version. Checksum mismatches and
//! incomplete manifests additionally force the next attempt to ask for a full
//! copy instead of a delta.

use super::connection::{PrimaryConnection, TransferHeader};
use crate::config::ReplicationConfig;
use crate::engine::segment::write_atomic;
use crate::engine::{IndexEngine, PointSearcher};
use crate::gateway::SearchGateway;
use crate::nrt::{Manifest, SegmentFile, Version};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

const STATE_FILE: &str = "replica_state.json";

/// Replica sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Not connected; serving the last active version
    Disconnected,
    /// Sync attempt in progress
    Syncing,
    /// Serving; up to date as of the last sync
    Active,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Syncing => f.write_str("syncing"),
            Self::Active => f.write_str("active"),
        }
    }
}

/// Durable replica state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLocalState {
    /// Version currently served
    pub active_version: Version,
    /// Version being assembled, if any
    pub pending_version: Option<Version>,
    /// Manifest of the active version
    pub local_manifest: Manifest,
}

/// Result of one sync attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Nothing newer on the primary
    UpToDate {
        /// Active version
        version: Version,
    },
    /// A newer point was activated
    Activated {
        /// Newly active version
        version: Version,
        /// Files fetched from the primary
        files_fetched: usize,
        /// Files already present locally
        files_reused: usize,
        /// Bytes received
        bytes: u64,
    },
}

impl SyncOutcome {
    /// Active version after the sync
    pub fn version(&self) -> Version {
        match self {
            Self::UpToDate { version } | Self::Activated { version, .. } => *version,
        }
    }
}

/// Replica statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientStats {
    /// Completed sync attempts
    pub syncs: u64,
    /// Failed sync attempts
    pub failed_syncs: u64,
    /// Versions activated
    pub activations: u64,
    /// Syncs that used a full copy
    pub full_copies: u64,
    /// Files fetched
    pub files_fetched: u64,
    /// Files found locally and not fetched
    pub files_reused: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Latest version reported by the primary
    pub primary_version: Option<Version>,
    /// Time of the last successful sync
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Message of the last failure
    pub last_error: Option<String>,
}

/// Replica state restored from disk
pub struct RestoredState {
    /// State to resume from
    pub state: ReplicaLocalState,
    /// Searcher for the restored active version
    pub searcher: PointSearcher,
    /// True when the persisted state was unusable
    pub force_full: bool,
}

/// Connection slot guarded by the sync lock
#[derive(Default)]
struct SyncSlot {
    connection: Option<PrimaryConnection>,
    last_result: Option<Result<SyncOutcome>>,
}

/// Replica-side replication client
pub struct ReplicationClient {
    node_name: String,
    index_name: String,
    primary_addr: SocketAddr,
    config: ReplicationConfig,
    engine: Arc<dyn IndexEngine>,
    gateway: Arc<SearchGateway>,
    state_path: PathBuf,
    local: RwLock<ReplicaLocalState>,
    sync_state: RwLock<SyncState>,
    sync_lock: tokio::sync::Mutex<SyncSlot>,
    completed_syncs: AtomicU64,
    force_full: AtomicBool,
    trigger: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Mutex<ClientStats>,
}

impl ReplicationClient {
    /// Restore the last activated point from `data_dir`.
    ///
    /// Falls back to an empty version 0 (and a forced full copy) when the state
    /// file is unreadable or its files are missing or corrupt.
    pub fn restore(engine: &Arc<dyn IndexEngine>, data_dir: &Path) -> Result<RestoredState> {
        let path = data_dir.join(STATE_FILE);
        let persisted = if path.exists() {
            match std::fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<ReplicaLocalState>(&bytes)?))
            {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable replica state {:?}: {}", path, e);
                    None
                }
            }
        } else {
            None
        };
        let had_state = path.exists();

        if let Some(mut state) = persisted {
            state.pending_version = None;
            let opened = engine
                .recover(&state.local_manifest)
                .and_then(|_| engine.open_point(&state.local_manifest));
            match opened {
                Ok(searcher) => {
                    remove_unreferenced(engine.as_ref(), &state.local_manifest)?;
                    tracing::info!(
                        "Restored replica at version {} ({} files)",
                        state.active_version,
                        state.local_manifest.len()
                    );
                    return Ok(RestoredState {
                        state,
                        searcher,
                        force_full: false,
                    });
                }
                Err(e) => tracing::warn!(
                    "Persisted version {} is not usable, starting empty: {}",
                    state.active_version,
                    e
                ),
            }
        }

        let state = ReplicaLocalState::default();
        engine.recover(&state.local_manifest)?;
        let searcher = engine.open_point(&state.local_manifest)?;
        Ok(RestoredState {
            state,
            searcher,
            force_full: had_state,
        })
    }

    /// Create a client resuming from `state`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl Into<String>,
        index_name: impl Into<String>,
        primary_addr: SocketAddr,
        config: ReplicationConfig,
        engine: Arc<dyn IndexEngine>,
        gateway: Arc<SearchGateway>,
        data_dir: &Path,
        state: ReplicaLocalState,
        force_full: bool,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node_name: node_name.into(),
            index_name: index_name.into(),
            primary_addr,
            config,
            engine,
            gateway,
            state_path: data_dir.join(STATE_FILE),
            local: RwLock::new(state),
            sync_state: RwLock::new(SyncState::Disconnected),
            sync_lock: tokio::sync::Mutex::new(SyncSlot::default()),
            completed_syncs: AtomicU64::new(0),
            force_full: AtomicBool::new(force_full),
            trigger: Arc::new(Notify::new()),
            shutdown_tx,
            task: Mutex::new(None),
            stats: Mutex::new(ClientStats::default()),
        }
    }

    /// Current sync state
    pub fn sync_state(&self) -> SyncState {
        *self.sync_state.read()
    }

    /// Snapshot of the local state
    pub fn local_state(&self) -> ReplicaLocalState {
        self.local.read().clone()
    }

    /// Active version
    pub fn active_version(&self) -> Version {
        self.local.read().active_version
    }

    /// Primary replication address
    pub fn primary_addr(&self) -> SocketAddr {
        self.primary_addr
    }

    /// Whether the next sync asks for a full copy
    pub fn full_copy_pending(&self) -> bool {
        self.force_full.load(Ordering::SeqCst)
    }

    /// Notifier that wakes the background loop for an immediate sync
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Get statistics
    pub fn stats(&self) -> ClientStats {
        self.stats.lock().clone()
    }

    fn set_state(&self, state: SyncState) {
        let mut current = self.sync_state.write();
        if *current != state {
            tracing::debug!("Replica {} {} -> {}", self.node_name, *current, state);
            *current = state;
        }
    }

    /// Run one sync attempt now.
    ///
    /// A call made while another attempt is in flight waits for that attempt
    /// and returns its result instead of starting a second one.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        let observed = self.completed_syncs.load(Ordering::SeqCst);
        let mut slot = self.sync_lock.lock().await;

        if self.completed_syncs.load(Ordering::SeqCst) != observed {
            if let Some(result) = &slot.last_result {
                return result.as_ref().map(Clone::clone).map_err(Error::shared);
            }
        }
        if *self.shutdown_tx.borrow() {
            return Err(Error::shutdown("Replication client stopped"));
        }

        self.set_state(SyncState::Syncing);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let timeout = self.config.transfer_timeout;
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, self.sync_attempt(&mut slot.connection)) => {
                result.unwrap_or_else(|_| Err(Error::timeout(format!("Sync exceeded {:?}", timeout))))
            }
            _ = shutdown_rx.wait_for(|stopped| *stopped) => {
                Err(Error::shutdown("Sync cancelled by shutdown"))
            }
        };

        match &result {
            Ok(outcome) => {
                self.set_state(SyncState::Active);
                let mut stats = self.stats.lock();
                stats.syncs += 1;
                stats.last_sync_at = Some(Utc::now());
                tracing::debug!("Sync finished at version {}", outcome.version());
            }
            Err(e) => {
                slot.connection = None;
                self.local.write().pending_version = None;
                self.set_state(SyncState::Disconnected);
                if e.is_consistency_violation() {
                    tracing::error!("Sync rejected, next attempt takes a full copy: {}", e);
                    self.force_full.store(true, Ordering::SeqCst);
                }
                let mut stats = self.stats.lock();
                stats.failed_syncs += 1;
                stats.last_error = Some(e.to_string());
            }
        }

        slot.last_result = Some(result.as_ref().map(Clone::clone).map_err(Error::shared));
        self.completed_syncs.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn sync_attempt(&self, slot: &mut Option<PrimaryConnection>) -> Result<SyncOutcome> {
        if slot.is_none() {
            let connection = PrimaryConnection::connect(
                self.primary_addr,
                &self.node_name,
                &self.index_name,
                self.config.connect_timeout,
                self.config.read_timeout,
            )
            .await?;
            if !connection.peer_is_primary() {
                return Err(Error::replication(format!(
                    "{} at {} is not a primary",
                    connection.peer_name(),
                    self.primary_addr
                )));
            }
            tracing::info!(
                "Replica {} connected to primary {} at {}",
                self.node_name,
                connection.peer_name(),
                self.primary_addr
            );
            *slot = Some(connection);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(Error::internal("Primary connection missing"));
        };

        let active = self.active_version();
        let force_full = self.force_full.load(Ordering::SeqCst);

        let latest = connection.latest_point().await?;
        self.stats.lock().primary_version = Some(latest.version);
        if latest.version <= active {
            if latest.version < active {
                tracing::warn!(
                    "Primary reports version {} behind local version {}",
                    latest.version,
                    active
                );
            }
            return Ok(SyncOutcome::UpToDate { version: active });
        }

        let since = if force_full { None } else { Some(active) };
        let header = connection.get_segment_files(since).await?;
        let target = header.point.version;
        if target <= active {
            return Ok(SyncOutcome::UpToDate { version: active });
        }
        self.local.write().pending_version = Some(target);

        let needed = self.missing_files(&header);
        let files_reused = header.point.manifest.len().saturating_sub(needed.len());
        tracing::info!(
            "Syncing version {} -> {} ({} files to fetch, {} reused, full copy: {})",
            active,
            target,
            needed.len(),
            files_reused,
            header.full_copy
        );

        // dropped on every exit path, discarding whatever is still staged
        let staging = tempfile::Builder::new()
            .prefix("sync-")
            .tempdir_in(self.engine.staging_root())?;
        let fetched = if needed.is_empty() {
            Default::default()
        } else {
            connection.fetch_files(target, &needed, staging.path()).await?
        };

        let staged: Vec<(SegmentFile, PathBuf)> = needed
            .iter()
            .map(|file| {
                fetched
                    .staged
                    .get(&file.name)
                    .map(|path| (file.clone(), path.clone()))
                    .ok_or_else(|| Error::replication(format!("File {} was not transferred", file.name)))
            })
            .collect::<Result<_>>()?;

        let engine = self.engine.clone();
        let manifest = header.point.manifest.clone();
        let searcher = tokio::task::spawn_blocking(move || -> Result<PointSearcher> {
            for (file, path) in &staged {
                engine.install_segment(file, path)?;
            }
            if let Some(missing) = manifest.files().iter().find(|f| !engine.has_segment(f)) {
                return Err(Error::engine(format!(
                    "Manifest incomplete: {} is missing locally",
                    missing.name
                )));
            }
            engine.open_point(&manifest)
        })
        .await
        .map_err(|e| Error::internal(format!("Activation task failed: {}", e)))??;
        drop(staging);

        self.activate(&header, Arc::new(searcher))?;

        {
            let mut stats = self.stats.lock();
            stats.activations += 1;
            stats.files_fetched += needed.len() as u64;
            stats.files_reused += files_reused as u64;
            stats.bytes_received += fetched.bytes;
            if header.full_copy {
                stats.full_copies += 1;
            }
        }
        self.force_full.store(false, Ordering::SeqCst);

        Ok(SyncOutcome::Activated {
            version: target,
            files_fetched: needed.len(),
            files_reused,
            bytes: fetched.bytes,
        })
    }

    /// Files of the target point that are not present and verified locally
    fn missing_files(&self, header: &TransferHeader) -> Vec<SegmentFile> {
        let candidates: &[SegmentFile] = if header.full_copy {
            header.point.manifest.files()
        } else {
            &header.delta.added
        };
        candidates
            .iter()
            .filter(|file| !self.engine.has_segment(file))
            .cloned()
            .collect()
    }

    fn activate(&self, header: &TransferHeader, searcher: Arc<PointSearcher>) -> Result<()> {
        let version = header.point.version;
        let manifest = header.point.manifest.clone();
        {
            let mut local = self.local.write();
            if version <= local.active_version {
                return Err(Error::internal(format!(
                    "Refusing to activate version {} over {}",
                    version, local.active_version
                )));
            }
            self.engine.recover(&manifest)?;
            if !self.gateway.activate(version, searcher) {
                return Err(Error::shutdown("Search gateway closed during activation"));
            }
            *local = ReplicaLocalState {
                active_version: version,
                pending_version: None,
                local_manifest: manifest,
            };
        }
        tracing::info!("Replica {} activated version {}", self.node_name, version);

        let state = self.local_state();
        if let Err(e) = self.persist(&state) {
            tracing::error!("Failed to persist replica state at version {}: {}", version, e);
        }
        if let Err(e) = remove_unreferenced(self.engine.as_ref(), &state.local_manifest) {
            tracing::warn!("Failed to remove superseded segment files: {}", e);
        }
        Ok(())
    }

    fn persist(&self, state: &ReplicaLocalState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.state_path, &bytes)
    }

    /// Sync loop: poll while active, back off after failures, wake on trigger
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = self.config.initial_backoff;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let delay = match self.sync_now().await {
                Ok(_) => {
                    backoff = self.config.initial_backoff;
                    self.config.poll_interval
                }
                Err(Error::Shutdown(_)) => break,
                Err(e) => {
                    let delay = backoff;
                    tracing::warn!("Sync with {} failed: {}. Retrying in {:?}", self.primary_addr, e, delay);
                    backoff = std::cmp::min(backoff * 2, self.config.max_backoff);
                    delay
                }
            };

            tokio::select! {
                _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SyncState::Disconnected);
        tracing::info!("Replica {} replication loop stopped", self.node_name);
    }

    /// Start the background sync loop
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(tokio::spawn(self.clone().run()));
        }
    }

    /// Stop the loop, cancelling an in-flight sync (staged files are discarded)
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        // wait out a sync_now call that is not owned by the loop
        let mut slot = self.sync_lock.lock().await;
        slot.connection = None;
        self.set_state(SyncState::Disconnected);
    }
}

fn remove_unreferenced(engine: &dyn IndexEngine, manifest: &Manifest) -> Result<()> {
    let orphans: Vec<String> = engine
        .list_segments()?
        .into_iter()
        .filter(|name| manifest.get(name).is_none())
        .collect();
    if !orphans.is_empty() {
        tracing::debug!("Removing {} segment files outside the active manifest", orphans.len());
        engine.remove_segments(&orphans)?;
    }
    Ok(())
}
