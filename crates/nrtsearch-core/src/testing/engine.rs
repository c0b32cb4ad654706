//! Engine wrapper with injectable failures

use crate::engine::{CommitInfo, Document, IndexEngine, PointSearcher};
use crate::nrt::{Manifest, SegmentFile};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Delegates to an inner engine, failing commits on demand
pub struct FailingEngine {
    inner: Arc<dyn IndexEngine>,
    fail_commits: AtomicBool,
    failed: AtomicU64,
}

impl FailingEngine {
    /// Wrap `inner`; commits succeed until [`FailingEngine::fail_commits`] is set
    pub fn new(inner: Arc<dyn IndexEngine>) -> Self {
        Self {
            inner,
            fail_commits: AtomicBool::new(false),
            failed: AtomicU64::new(0),
        }
    }

    /// Make subsequent commits fail with an I/O-style commit error
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of commits rejected so far
    pub fn failed_commits(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

impl IndexEngine for FailingEngine {
    fn add_documents(&self, docs: Vec<Document>) -> Result<usize> {
        self.inner.add_documents(docs)
    }

    fn pending_documents(&self) -> usize {
        self.inner.pending_documents()
    }

    fn commit(&self) -> Result<CommitInfo> {
        if self.fail_commits.load(Ordering::SeqCst) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(Error::commit("injected failure: disk full"));
        }
        self.inner.commit()
    }

    fn live_files(&self) -> Vec<SegmentFile> {
        self.inner.live_files()
    }

    fn recover(&self, manifest: &Manifest) -> Result<()> {
        self.inner.recover(manifest)
    }

    fn has_segment(&self, file: &SegmentFile) -> bool {
        self.inner.has_segment(file)
    }

    fn read_segment(&self, name: &str) -> Result<Vec<u8>> {
        self.inner.read_segment(name)
    }

    fn install_segment(&self, file: &SegmentFile, staged: &Path) -> Result<()> {
        self.inner.install_segment(file, staged)
    }

    fn remove_segments(&self, names: &[String]) -> Result<()> {
        self.inner.remove_segments(names)
    }

    fn list_segments(&self) -> Result<Vec<String>> {
        self.inner.list_segments()
    }

    fn staging_root(&self) -> PathBuf {
        self.inner.staging_root()
    }

    fn open_point(&self, manifest: &Manifest) -> Result<PointSearcher> {
        self.inner.open_point(manifest)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
