//! Segment file descriptors and manifests
//!
//! A manifest is the exact set of segment files making up one NRT point. It is
//! the wire contract between publisher and client: every `(name, length,
//! checksum)` tuple must round-trip unchanged for a transfer to be valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Searcher version: strictly increasing per index, assigned on refresh
pub type Version = u64;

/// Immutable segment file descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentFile {
    /// File name, unique within the index
    pub name: String,
    /// Length in bytes
    pub length: u64,
    /// CRC32 of the complete file contents
    pub checksum: u32,
}

impl SegmentFile {
    /// Create a descriptor from file contents
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            length: bytes.len() as u64,
            checksum: crc32fast::hash(bytes),
        }
    }
}

/// Ordered set of segment files in an NRT point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    files: Vec<SegmentFile>,
}

/// Files added to and removed from a manifest relative to an older one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDelta {
    /// Present in the new manifest only
    pub added: Vec<SegmentFile>,
    /// Present in the old manifest only
    pub removed: Vec<SegmentFile>,
}

impl ManifestDelta {
    /// True when both manifests were identical
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Total bytes a receiver must fetch
    pub fn added_bytes(&self) -> u64 {
        self.added.iter().map(|f| f.length).sum()
    }
}

impl Manifest {
    /// Build a manifest, ordering files by name.
    ///
    /// A later descriptor with a duplicate name replaces the earlier one.
    pub fn new(files: impl IntoIterator<Item = SegmentFile>) -> Self {
        let by_name: BTreeMap<String, SegmentFile> =
            files.into_iter().map(|f| (f.name.clone(), f)).collect();
        Self {
            files: by_name.into_values().collect(),
        }
    }

    /// Empty manifest
    pub fn empty() -> Self {
        Self::default()
    }

    /// Files in name order
    pub fn files(&self) -> &[SegmentFile] {
        &self.files
    }

    /// Number of files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the manifest has no files
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Look up a file by name
    pub fn get(&self, name: &str) -> Option<&SegmentFile> {
        self.files
            .binary_search_by(|f| f.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.files[idx])
    }

    /// True if the exact descriptor (name, length and checksum) is present
    pub fn contains(&self, file: &SegmentFile) -> bool {
        self.get(&file.name) == Some(file)
    }

    /// Total size of all files
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Symmetric difference against an older manifest.
    ///
    /// A file whose name survives but whose length or checksum changed shows
    /// up in both lists.
    pub fn diff(&self, previous: &Manifest) -> ManifestDelta {
        let added = self
            .files
            .iter()
            .filter(|f| !previous.contains(f))
            .cloned()
            .collect();
        let removed = previous
            .files
            .iter()
            .filter(|f| !self.contains(f))
            .cloned()
            .collect();
        ManifestDelta { added, removed }
    }
}
