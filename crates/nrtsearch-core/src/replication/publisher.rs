//! Replication publisher (primary side)
//!
//! The publisher:
//! - Exposes `writeNRTPoint`, the only network-triggerable refresh
//! - Runs the optional background refresh scheduler
//! - Plans transfers for replicas (delta or full copy) and leases the target
//!   point until the transfer finishes
//! - Serves raw segment bytes of leased points
//!
//! Manual and scheduled refreshes both go through [`NrtPointStore::refresh`],
//! which serializes them on the store's writer lock.

use crate::config::ReplicationConfig;
use crate::nrt::{DeltaOutcome, Manifest, ManifestDelta, NrtPoint, NrtPointStore, PointLease, Version};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Result of `writeNRTPoint`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearcherVersion {
    /// Latest version after the refresh
    pub version: Version,
    /// False when nothing changed and the version did not advance
    pub did_refresh: bool,
}

/// Transfer plan for one replica request
#[derive(Debug)]
pub struct TransferPlan {
    /// Lease on the target point, held until the transfer completes
    pub lease: PointLease,
    /// True when the replica must compare against the whole manifest
    pub full_copy: bool,
    /// Files to fetch and drop relative to the replica's version
    pub delta: ManifestDelta,
}

impl TransferPlan {
    /// Target point
    pub fn point(&self) -> &Arc<NrtPoint> {
        self.lease.point()
    }
}

/// Publisher statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublisherStats {
    /// `writeNRTPoint` calls (manual and scheduled)
    pub write_requests: u64,
    /// Transfers planned
    pub transfers: u64,
    /// Transfers that required a full copy
    pub full_copies: u64,
    /// Segment files sent
    pub files_sent: u64,
    /// Segment bytes sent
    pub bytes_sent: u64,
}

/// Primary-side replication publisher
pub struct ReplicationPublisher {
    index_name: String,
    store: Arc<NrtPointStore>,
    config: ReplicationConfig,
    stats: Mutex<PublisherStats>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationPublisher {
    /// Create a publisher over `store`
    pub fn new(index_name: impl Into<String>, store: Arc<NrtPointStore>, config: ReplicationConfig) -> Self {
        Self {
            index_name: index_name.into(),
            store,
            config,
            stats: Mutex::new(PublisherStats::default()),
            shutdown_tx: Mutex::new(None),
            refresh_task: Mutex::new(None),
        }
    }

    /// Point store backing this publisher
    pub fn store(&self) -> &Arc<NrtPointStore> {
        &self.store
    }

    /// Most recently published point
    pub fn latest_point(&self) -> Arc<NrtPoint> {
        self.store.latest_point()
    }

    /// Refresh the index and report the resulting version
    pub async fn write_nrt_point(&self, index_name: &str) -> Result<SearcherVersion> {
        if index_name != self.index_name {
            return Err(Error::IndexNotFound(index_name.to_string()));
        }
        self.stats.lock().write_requests += 1;

        let store = self.store.clone();
        let outcome = tokio::task::spawn_blocking(move || store.refresh())
            .await
            .map_err(|e| Error::internal(format!("Refresh task failed: {}", e)))??;

        Ok(SearcherVersion {
            version: outcome.point.version,
            did_refresh: outcome.did_refresh,
        })
    }

    /// Plan what a replica at `since_version` must fetch.
    ///
    /// Unknown or pruned versions yield a full-copy plan listing the whole
    /// manifest as added.
    pub fn get_segment_files(&self, since_version: Option<Version>) -> TransferPlan {
        let plan = match self.store.delta_since(since_version) {
            DeltaOutcome::UpToDate { latest } => TransferPlan {
                lease: latest,
                full_copy: false,
                delta: ManifestDelta::default(),
            },
            DeltaOutcome::Delta { latest, delta } => TransferPlan {
                lease: latest,
                full_copy: false,
                delta,
            },
            DeltaOutcome::FullCopyRequired { latest } => {
                let delta = latest.point().manifest.diff(&Manifest::empty());
                TransferPlan {
                    lease: latest,
                    full_copy: true,
                    delta,
                }
            }
        };

        let mut stats = self.stats.lock();
        stats.transfers += 1;
        if plan.full_copy {
            stats.full_copies += 1;
        }
        plan
    }

    /// Raw bytes of a file in `point`; the caller holds a lease on it
    pub fn read_file(&self, point: &NrtPoint, name: &str) -> Result<Vec<u8>> {
        if point.manifest.get(name).is_none() {
            return Err(Error::replication(format!(
                "File {} is not part of version {}",
                name, point.version
            )));
        }
        self.store.engine().read_segment(name)
    }

    /// Record a finished transfer and let retention catch up
    pub fn finish_transfer(&self, files: u64, bytes: u64) {
        {
            let mut stats = self.stats.lock();
            stats.files_sent += files;
            stats.bytes_sent += bytes;
        }
        if let Err(e) = self.store.prune() {
            tracing::warn!("Pruning after transfer failed: {}", e);
        }
    }

    /// Start the background refresh scheduler if an interval is configured
    pub fn start(self: &Arc<Self>) {
        let Some(interval) = self.config.refresh_interval else {
            return;
        };
        let mut task = self.refresh_task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let publisher = self.clone();
        *task = Some(tokio::spawn(async move {
            tracing::info!("Background refresh every {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::debug!("Background refresh stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let index_name = publisher.index_name.clone();
                        match publisher.write_nrt_point(&index_name).await {
                            Ok(version) if version.did_refresh => {
                                tracing::debug!("Scheduled refresh published version {}", version.version);
                            }
                            Ok(_) => {}
                            Err(Error::Shutdown(_)) => break,
                            Err(e) => tracing::warn!("Scheduled refresh failed: {}", e),
                        }
                    }
                }
            }
        }));
    }

    /// Stop the background refresh scheduler
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Get statistics
    pub fn stats(&self) -> PublisherStats {
        self.stats.lock().clone()
    }
}
