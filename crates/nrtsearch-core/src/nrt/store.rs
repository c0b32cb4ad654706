//! NRT point store (primary side)
//!
//! Wraps the index engine and owns version assignment. All refreshes, whether
//! triggered by `writeNRTPoint` or the background scheduler, run through one
//! writer mutex so versions are assigned strictly in order and each manifest
//! delta is computed against a consistent previous point. Readers (latest point,
//! deltas, leases) only touch the retention list and never wait on the writer.

use super::retention::{PointLease, PointRetention};
use super::{Manifest, ManifestDelta, NrtPoint, Version};
use crate::engine::segment::write_atomic;
use crate::engine::{IndexEngine, PointSearcher};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const POINT_PREFIX: &str = "point_";
const POINT_SUFFIX: &str = ".json";

/// Result of a refresh
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// Latest point after the refresh
    pub point: Arc<NrtPoint>,
    /// False when there was nothing new and the version did not advance
    pub did_refresh: bool,
    /// Files added and removed relative to the previous point
    pub delta: ManifestDelta,
}

/// What a replica at some version needs to reach the latest point
#[derive(Debug)]
pub enum DeltaOutcome {
    /// Replica already has the latest point
    UpToDate {
        /// Leased latest point
        latest: PointLease,
    },
    /// Replica's version is retained; only the delta is needed
    Delta {
        /// Leased latest point
        latest: PointLease,
        /// Files to fetch and drop
        delta: ManifestDelta,
    },
    /// Replica's version is unknown or pruned; it must take the whole manifest
    FullCopyRequired {
        /// Leased latest point
        latest: PointLease,
    },
}

impl DeltaOutcome {
    /// Lease on the target point
    pub fn latest(&self) -> &PointLease {
        match self {
            Self::UpToDate { latest }
            | Self::Delta { latest, .. }
            | Self::FullCopyRequired { latest } => latest,
        }
    }
}

/// Notified with each newly published point, inside the writer section
pub trait PointListener: Send + Sync {
    /// Called once per new version, in version order
    fn point_published(&self, point: &Arc<NrtPoint>, searcher: Arc<PointSearcher>);
}

/// Refresh counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Refreshes that published a new version
    pub refreshes: u64,
    /// Refreshes with nothing to publish
    pub noop_refreshes: u64,
    /// Refreshes that failed and published nothing
    pub failed_refreshes: u64,
    /// Points dropped from retention
    pub pruned_points: u64,
    /// Segment files deleted because no retained point referenced them
    pub removed_files: u64,
}

/// Versioned point store over an index engine
pub struct NrtPointStore {
    engine: Arc<dyn IndexEngine>,
    points_dir: PathBuf,
    writer: Mutex<()>,
    retention: PointRetention,
    listener: RwLock<Option<Arc<dyn PointListener>>>,
    stats: Mutex<StoreStats>,
    closed: AtomicBool,
}

impl NrtPointStore {
    /// Open the store under `data_dir`, resuming at the last persisted point.
    ///
    /// A fresh store starts at version 0 with an empty manifest. Segment files
    /// no retained point references are removed.
    pub fn open(
        engine: Arc<dyn IndexEngine>,
        data_dir: impl AsRef<Path>,
        retained_points: usize,
    ) -> Result<Self> {
        let points_dir = data_dir.as_ref().join("points");
        std::fs::create_dir_all(&points_dir)?;

        let mut persisted = load_points(&points_dir)?;
        let latest = match persisted.pop() {
            Some(point) => point,
            None => {
                let initial = NrtPoint::new(0, Manifest::empty());
                persist_point(&points_dir, &initial)?;
                initial
            }
        };
        engine.recover(&latest.manifest)?;

        let latest = Arc::new(latest);
        let retention = PointRetention::new(latest.clone(), retained_points);
        let keep_from = persisted
            .len()
            .saturating_sub(retained_points.saturating_sub(1));
        for (idx, point) in persisted.into_iter().enumerate() {
            let usable =
                idx >= keep_from && point.manifest.files().iter().all(|f| engine.has_segment(f));
            if usable {
                retention.insert(Arc::new(point));
            } else {
                remove_point_file(&points_dir, point.version);
            }
        }

        let store = Self {
            engine,
            points_dir,
            writer: Mutex::new(()),
            retention,
            listener: RwLock::new(None),
            stats: Mutex::new(StoreStats::default()),
            closed: AtomicBool::new(false),
        };
        store.remove_unreferenced()?;

        tracing::info!(
            "Opened NRT point store at version {} ({} files, {} retained points)",
            latest.version,
            latest.manifest.len(),
            store.retention.versions().len()
        );
        Ok(store)
    }

    /// Register the listener notified of new points
    pub fn set_listener(&self, listener: Arc<dyn PointListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Underlying engine
    pub fn engine(&self) -> &Arc<dyn IndexEngine> {
        &self.engine
    }

    /// Commit pending mutations and publish the next version.
    ///
    /// Publishes nothing when the engine's file set is unchanged. On any
    /// failure the store stays at its previous version.
    pub fn refresh(&self) -> Result<RefreshOutcome> {
        let _writer = self.writer.lock();
        self.ensure_open()?;

        let previous = self.retention.latest();
        let outcome = match self.publish_next(&previous) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.lock().failed_refreshes += 1;
                tracing::warn!(
                    "Refresh failed, staying at version {}: {}",
                    previous.version,
                    e
                );
                return Err(e);
            }
        };

        if outcome.did_refresh {
            self.stats.lock().refreshes += 1;
            tracing::info!(
                "Published version {} (+{} / -{} files)",
                outcome.point.version,
                outcome.delta.added.len(),
                outcome.delta.removed.len()
            );
            if let Err(e) = self.prune_locked() {
                tracing::warn!("Pruning after version {} failed: {}", outcome.point.version, e);
            }
        } else {
            self.stats.lock().noop_refreshes += 1;
            tracing::debug!("Refresh found no changes at version {}", previous.version);
        }
        Ok(outcome)
    }

    fn publish_next(&self, previous: &Arc<NrtPoint>) -> Result<RefreshOutcome> {
        let info = self.engine.commit()?;
        let manifest = Manifest::new(info.files);
        if manifest == previous.manifest {
            return Ok(RefreshOutcome {
                point: previous.clone(),
                did_refresh: false,
                delta: ManifestDelta::default(),
            });
        }

        let delta = manifest.diff(&previous.manifest);
        let point = Arc::new(NrtPoint::new(previous.version + 1, manifest));
        let searcher = Arc::new(self.engine.open_point(&point.manifest)?);
        persist_point(&self.points_dir, &point)?;
        self.retention.insert(point.clone());

        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.point_published(&point, searcher);
        }

        Ok(RefreshOutcome {
            point,
            did_refresh: true,
            delta,
        })
    }

    /// Most recently published point
    pub fn latest_point(&self) -> Arc<NrtPoint> {
        self.retention.latest()
    }

    /// Retained point by version
    pub fn point(&self, version: Version) -> Option<Arc<NrtPoint>> {
        self.retention.get(version)
    }

    /// Lease a retained point so its files survive pruning
    pub fn lease(&self, version: Version) -> Option<PointLease> {
        self.retention.lease(version)
    }

    /// Lease the latest point
    pub fn lease_latest(&self) -> PointLease {
        self.retention.lease_latest()
    }

    /// Retained versions, oldest first
    pub fn retained_versions(&self) -> Vec<Version> {
        self.retention.versions()
    }

    /// Work out what a replica at `since` needs to reach the latest point
    pub fn delta_since(&self, since: Option<Version>) -> DeltaOutcome {
        let latest = self.retention.lease_latest();
        let Some(since) = since else {
            return DeltaOutcome::FullCopyRequired { latest };
        };

        if since == latest.version() {
            return DeltaOutcome::UpToDate { latest };
        }
        if since > latest.version() {
            tracing::warn!(
                "Replica reports version {} ahead of latest {}; forcing full copy",
                since,
                latest.version()
            );
            return DeltaOutcome::FullCopyRequired { latest };
        }

        match self.retention.get(since) {
            Some(base) => {
                let delta = latest.point().manifest.diff(&base.manifest);
                DeltaOutcome::Delta { latest, delta }
            }
            None => {
                tracing::debug!(
                    "Version {} no longer retained (oldest {}); full copy required",
                    since,
                    self.retention.oldest_version()
                );
                DeltaOutcome::FullCopyRequired { latest }
            }
        }
    }

    /// Prune retention unless a refresh is in progress (it prunes itself)
    pub fn prune(&self) -> Result<usize> {
        let Some(_writer) = self.writer.try_lock() else {
            return Ok(0);
        };
        self.prune_locked()
    }

    fn prune_locked(&self) -> Result<usize> {
        let pruned = self.retention.prune();
        for point in &pruned {
            remove_point_file(&self.points_dir, point.version);
        }
        if !pruned.is_empty() {
            self.stats.lock().pruned_points += pruned.len() as u64;
            tracing::debug!(
                "Pruned {} points, oldest retained is now {}",
                pruned.len(),
                self.retention.oldest_version()
            );
        }
        self.remove_unreferenced()?;
        Ok(pruned.len())
    }

    fn remove_unreferenced(&self) -> Result<()> {
        let mut referenced = self.retention.referenced_files();
        referenced.extend(self.engine.live_files().into_iter().map(|f| f.name));

        let orphans: Vec<String> = self
            .engine
            .list_segments()?
            .into_iter()
            .filter(|name| !referenced.contains(name))
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }

        tracing::debug!("Removing {} unreferenced segment files", orphans.len());
        self.engine.remove_segments(&orphans)?;
        self.stats.lock().removed_files += orphans.len() as u64;
        Ok(())
    }

    /// Outstanding leases on `version`
    pub fn lease_count(&self, version: Version) -> usize {
        self.retention.lease_count(version)
    }

    /// Refresh counters
    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::shutdown("NRT point store is closed"));
        }
        Ok(())
    }

    /// Refuse further refreshes; waits for an in-flight refresh to finish
    pub fn close(&self) {
        let _writer = self.writer.lock();
        self.closed.store(true, Ordering::SeqCst);
        self.listener.write().take();
    }
}

fn point_path(points_dir: &Path, version: Version) -> PathBuf {
    points_dir.join(format!("{POINT_PREFIX}{version:020}{POINT_SUFFIX}"))
}

fn persist_point(points_dir: &Path, point: &NrtPoint) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(point)?;
    write_atomic(&point_path(points_dir, point.version), &bytes)
}

fn remove_point_file(points_dir: &Path, version: Version) {
    if let Err(e) = std::fs::remove_file(point_path(points_dir, version)) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove point {} manifest: {}", version, e);
        }
    }
}

/// Persisted points in ascending version order
fn load_points(points_dir: &Path) -> Result<Vec<NrtPoint>> {
    let mut points = Vec::new();
    for entry in std::fs::read_dir(points_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(POINT_PREFIX) || !name.ends_with(POINT_SUFFIX) {
            continue;
        }
        let bytes = std::fs::read(entry.path())?;
        match serde_json::from_slice::<NrtPoint>(&bytes) {
            Ok(point) => points.push(point),
            Err(e) => tracing::warn!("Ignoring unreadable point manifest {}: {}", name, e),
        }
    }
    points.sort_by_key(|p| p.version);
    Ok(points)
}
