//! Index engine seam
//!
//! The replication core treats the index engine as a collaborator: something
//! that buffers documents, commits them into immutable segment files, and opens
//! a searchable view pinned to an exact manifest. [`SegmentEngine`] is the
//! directory-backed implementation used by nodes; tests substitute their own
//! implementations (e.g. to inject commit failures).

pub mod searcher;
pub mod segment;

pub use searcher::{Hit, PointSearcher, SearchHits};
pub use segment::SegmentEngine;

use crate::Result;
use crate::nrt::{Manifest, SegmentFile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A document as ingested by the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier
    pub id: String,
    /// Field name to value
    pub fields: BTreeMap<String, String>,
}

impl Document {
    /// Create a document with no fields
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Result of an engine commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Engine generation after the commit
    pub generation: u64,
    /// Live segment files after the commit
    pub files: Vec<SegmentFile>,
    /// False when there was nothing to commit
    pub changed: bool,
}

/// Operations the replication core needs from an index engine
pub trait IndexEngine: Send + Sync {
    /// Buffer documents for the next commit; returns the pending count
    fn add_documents(&self, docs: Vec<Document>) -> Result<usize>;

    /// Number of buffered, uncommitted documents
    fn pending_documents(&self) -> usize;

    /// Durably write pending documents as new segment files.
    ///
    /// On error nothing becomes live and pending documents are kept.
    fn commit(&self) -> Result<CommitInfo>;

    /// Segment files of the last successful commit (or recovery)
    fn live_files(&self) -> Vec<SegmentFile>;

    /// Make `manifest` the live file set (startup recovery)
    fn recover(&self, manifest: &Manifest) -> Result<()>;

    /// True if the exact file is present and verified locally
    fn has_segment(&self, file: &SegmentFile) -> bool;

    /// Raw bytes of a local segment file
    fn read_segment(&self, name: &str) -> Result<Vec<u8>>;

    /// Verify a staged file against its descriptor and move it into place
    fn install_segment(&self, file: &SegmentFile, staged: &Path) -> Result<()>;

    /// Delete local segment files that are not live
    fn remove_segments(&self, names: &[String]) -> Result<()>;

    /// Names of all segment files on disk
    fn list_segments(&self) -> Result<Vec<String>>;

    /// Directory under which transfers stage incoming files
    fn staging_root(&self) -> PathBuf;

    /// Open a searchable view of exactly `manifest`
    fn open_point(&self, manifest: &Manifest) -> Result<PointSearcher>;

    /// Release caches and refuse further writes
    fn close(&self) -> Result<()>;
}
