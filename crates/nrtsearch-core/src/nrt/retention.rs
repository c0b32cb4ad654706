//! Retention of superseded NRT points
//!
//! Points are kept in a version-indexed list. The newest `capacity` points are
//! always kept; older points survive pruning only while a [`PointLease`] on
//! them is alive (an in-flight transfer or a replica's full-copy request).

use super::{NrtPoint, Version};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

struct RetainedPoint {
    point: Arc<NrtPoint>,
    leases: usize,
}

struct RetentionInner {
    points: BTreeMap<Version, RetainedPoint>,
    latest: Arc<NrtPoint>,
    capacity: usize,
}

/// Version-indexed retention list
#[derive(Clone)]
pub struct PointRetention {
    inner: Arc<Mutex<RetentionInner>>,
}

/// Keeps a point from being pruned while alive
pub struct PointLease {
    point: Arc<NrtPoint>,
    inner: Arc<Mutex<RetentionInner>>,
}

impl PointLease {
    /// The leased point
    pub fn point(&self) -> &Arc<NrtPoint> {
        &self.point
    }

    /// Version of the leased point
    pub fn version(&self) -> Version {
        self.point.version
    }
}

impl std::fmt::Debug for PointLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointLease")
            .field("version", &self.point.version)
            .finish()
    }
}

impl Drop for PointLease {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(retained) = inner.points.get_mut(&self.point.version) {
            retained.leases = retained.leases.saturating_sub(1);
        }
    }
}

impl PointRetention {
    /// Create a retention list holding `initial`
    pub fn new(initial: Arc<NrtPoint>, capacity: usize) -> Self {
        let mut points = BTreeMap::new();
        points.insert(
            initial.version,
            RetainedPoint {
                point: initial.clone(),
                leases: 0,
            },
        );
        Self {
            inner: Arc::new(Mutex::new(RetentionInner {
                points,
                latest: initial,
                capacity: capacity.max(1),
            })),
        }
    }

    /// Add a point; it becomes the latest if its version is newest
    pub fn insert(&self, point: Arc<NrtPoint>) {
        let mut inner = self.inner.lock();
        if point.version > inner.latest.version {
            inner.latest = point.clone();
        }
        inner
            .points
            .entry(point.version)
            .or_insert(RetainedPoint { point, leases: 0 });
    }

    /// Most recent point
    pub fn latest(&self) -> Arc<NrtPoint> {
        self.inner.lock().latest.clone()
    }

    /// Retained point by version
    pub fn get(&self, version: Version) -> Option<Arc<NrtPoint>> {
        self.inner
            .lock()
            .points
            .get(&version)
            .map(|r| r.point.clone())
    }

    /// Lease a retained point
    pub fn lease(&self, version: Version) -> Option<PointLease> {
        let mut inner = self.inner.lock();
        let retained = inner.points.get_mut(&version)?;
        retained.leases += 1;
        Some(PointLease {
            point: retained.point.clone(),
            inner: self.inner.clone(),
        })
    }

    /// Lease the latest point
    pub fn lease_latest(&self) -> PointLease {
        let mut inner = self.inner.lock();
        let latest = inner.latest.clone();
        if let Some(retained) = inner.points.get_mut(&latest.version) {
            retained.leases += 1;
        }
        PointLease {
            point: latest,
            inner: self.inner.clone(),
        }
    }

    /// Number of outstanding leases on `version`
    pub fn lease_count(&self, version: Version) -> usize {
        self.inner
            .lock()
            .points
            .get(&version)
            .map(|r| r.leases)
            .unwrap_or(0)
    }

    /// Retained versions in ascending order
    pub fn versions(&self) -> Vec<Version> {
        self.inner.lock().points.keys().copied().collect()
    }

    /// Oldest retained version
    pub fn oldest_version(&self) -> Version {
        let inner = self.inner.lock();
        inner
            .points
            .keys()
            .next()
            .copied()
            .unwrap_or(inner.latest.version)
    }

    /// Drop unleased points outside the newest `capacity`; returns them
    pub fn prune(&self) -> Vec<Arc<NrtPoint>> {
        let mut inner = self.inner.lock();
        let capacity = inner.capacity;
        let keep_from = inner
            .points
            .keys()
            .rev()
            .nth(capacity - 1)
            .copied()
            .unwrap_or(0);

        let doomed: Vec<Version> = inner
            .points
            .iter()
            .filter(|(version, retained)| **version < keep_from && retained.leases == 0)
            .map(|(version, _)| *version)
            .collect();

        doomed
            .into_iter()
            .filter_map(|version| inner.points.remove(&version).map(|r| r.point))
            .collect()
    }

    /// Names of all files referenced by a retained point
    pub fn referenced_files(&self) -> HashSet<String> {
        self.inner
            .lock()
            .points
            .values()
            .flat_map(|r| r.point.manifest.files().iter().map(|f| f.name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nrt::{Manifest, SegmentFile};

    fn point(version: Version, files: &[&str]) -> Arc<NrtPoint> {
        Arc::new(NrtPoint::new(
            version,
            Manifest::new(files.iter().map(|name| SegmentFile {
                name: name.to_string(),
                length: 1,
                checksum: 0,
            })),
        ))
    }

    #[test]
    fn test_latest_tracks_newest_version() {
        let retention = PointRetention::new(point(0, &[]), 4);
        retention.insert(point(1, &["a"]));
        retention.insert(point(2, &["a", "b"]));
        assert_eq!(retention.latest().version, 2);
        assert_eq!(retention.versions(), vec![0, 1, 2]);
    }

    #[test]
    fn test_prune_keeps_capacity_newest() {
        let retention = PointRetention::new(point(0, &[]), 2);
        for v in 1..=4 {
            retention.insert(point(v, &["a"]));
        }
        let removed: Vec<_> = retention.prune().iter().map(|p| p.version).collect();
        assert_eq!(removed, vec![0, 1, 2]);
        assert_eq!(retention.versions(), vec![3, 4]);
        assert_eq!(retention.oldest_version(), 3);
    }

    #[test]
    fn test_leased_point_survives_prune() {
        let retention = PointRetention::new(point(0, &["old"]), 1);
        let lease = retention.lease(0).unwrap();
        retention.insert(point(1, &["new"]));

        assert!(retention.prune().is_empty());
        assert!(retention.referenced_files().contains("old"));
        assert_eq!(retention.lease_count(0), 1);

        drop(lease);
        assert_eq!(retention.lease_count(0), 0);
        let removed: Vec<_> = retention.prune().iter().map(|p| p.version).collect();
        assert_eq!(removed, vec![0]);
        assert!(!retention.referenced_files().contains("old"));
    }

    #[test]
    fn test_lease_missing_version() {
        let retention = PointRetention::new(point(0, &[]), 1);
        assert!(retention.lease(7).is_none());
        assert_eq!(retention.lease_latest().version(), 0);
    }
}
