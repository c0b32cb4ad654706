//! Directory-backed segment engine
//!
//! Every commit writes the buffered documents as one immutable segment file
//! `seg_<generation>.sgm`:
//!
//! ```text
//! [magic:8 "NRTSEG01"][bincode Vec<Document>]
//! ```
//!
//! The manifest checksum of a segment is the CRC32 of the whole file. Once the
//! live segment count exceeds `max_segments`, a commit merges all live segments
//! into a single new file; the superseded files stay on disk until the point
//! store prunes the last NRT point referencing them.

use super::{CommitInfo, Document, IndexEngine, PointSearcher};
use crate::config::EngineConfig;
use crate::nrt::{Manifest, SegmentFile};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const SEGMENT_MAGIC: &[u8; 8] = b"NRTSEG01";
const SEGMENT_PREFIX: &str = "seg_";
const SEGMENT_SUFFIX: &str = ".sgm";

/// Segment file name for a generation
pub fn segment_name(generation: u64) -> String {
    format!("{SEGMENT_PREFIX}{generation:010}{SEGMENT_SUFFIX}")
}

/// Generation encoded in a segment file name
pub fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Encode documents into segment file bytes
pub fn encode_segment(docs: &[Document]) -> Result<Vec<u8>> {
    let payload = bincode::serialize(docs)?;
    let mut buf = Vec::with_capacity(SEGMENT_MAGIC.len() + payload.len());
    buf.extend_from_slice(SEGMENT_MAGIC);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode segment file bytes
pub fn decode_segment(bytes: &[u8]) -> Result<Vec<Document>> {
    if bytes.len() < SEGMENT_MAGIC.len() || &bytes[..SEGMENT_MAGIC.len()] != SEGMENT_MAGIC {
        return Err(Error::engine("Not a segment file (bad magic)"));
    }
    Ok(bincode::deserialize(&bytes[SEGMENT_MAGIC.len()..])?)
}

/// Write `bytes` to `path` via a temp file + fsync + rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::internal(format!("Path has no file name: {:?}", path)))?
        .to_string_lossy();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

struct EngineState {
    pending: Vec<Document>,
    live: Vec<SegmentFile>,
    generation: u64,
}

/// Segment engine rooted at `<data_dir>/segments`
pub struct SegmentEngine {
    segments_dir: PathBuf,
    staging_dir: PathBuf,
    config: EngineConfig,
    state: Mutex<EngineState>,
    /// Verified descriptors of files on disk
    on_disk: DashMap<String, SegmentFile>,
    /// Decoded documents by segment name
    cache: DashMap<String, Arc<Vec<Document>>>,
    closed: AtomicBool,
}

impl SegmentEngine {
    /// Open (or create) an engine under `data_dir`.
    ///
    /// Leftover staging files from an interrupted transfer are discarded.
    pub fn open(data_dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let segments_dir = data_dir.join("segments");
        let staging_dir = data_dir.join("staging");

        std::fs::create_dir_all(&segments_dir)?;
        if staging_dir.exists() {
            std::fs::remove_dir_all(&staging_dir)?;
        }
        std::fs::create_dir_all(&staging_dir)?;

        let on_disk = DashMap::new();
        let mut generation = 0;
        for entry in std::fs::read_dir(&segments_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(file_generation) = parse_segment_name(&name) else {
                continue;
            };
            let bytes = std::fs::read(entry.path())?;
            on_disk.insert(name.clone(), SegmentFile::from_bytes(name, &bytes));
            generation = generation.max(file_generation);
        }

        tracing::debug!(
            "Opened segment engine at {:?} ({} files, generation {})",
            segments_dir,
            on_disk.len(),
            generation
        );

        Ok(Self {
            segments_dir,
            staging_dir,
            config,
            state: Mutex::new(EngineState {
                pending: Vec::new(),
                live: Vec::new(),
                generation,
            }),
            on_disk,
            cache: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory holding segment files
    pub fn segments_dir(&self) -> &Path {
        &self.segments_dir
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::shutdown("Index engine is closed"));
        }
        Ok(())
    }

    fn write_segment(&self, name: &str, docs: Vec<Document>) -> Result<SegmentFile> {
        let bytes = encode_segment(&docs)?;
        write_atomic(&self.segments_dir.join(name), &bytes)?;
        let descriptor = SegmentFile::from_bytes(name, &bytes);
        self.on_disk.insert(name.to_string(), descriptor.clone());
        self.cache.insert(name.to_string(), Arc::new(docs));
        Ok(descriptor)
    }

    /// Load and verify a segment against its descriptor
    fn load_segment(&self, file: &SegmentFile) -> Result<Arc<Vec<Document>>> {
        if let Some(docs) = self.cache.get(&file.name) {
            if self.on_disk.get(&file.name).as_deref() == Some(file) {
                return Ok(docs.clone());
            }
        }

        let bytes = std::fs::read(self.segments_dir.join(&file.name)).map_err(|e| {
            Error::engine(format!("Segment {} unreadable: {}", file.name, e))
        })?;
        let actual = SegmentFile::from_bytes(file.name.clone(), &bytes);
        if actual.checksum != file.checksum || actual.length != file.length {
            return Err(Error::ChecksumMismatch {
                file: file.name.clone(),
                expected: file.checksum,
                actual: actual.checksum,
            });
        }

        let docs = Arc::new(decode_segment(&bytes)?);
        self.on_disk.insert(file.name.clone(), actual);
        self.cache.insert(file.name.clone(), docs.clone());
        Ok(docs)
    }

    fn discard(&self, name: &str) {
        self.on_disk.remove(name);
        self.cache.remove(name);
        if let Err(e) = std::fs::remove_file(self.segments_dir.join(name)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove segment {}: {}", name, e);
            }
        }
    }
}

impl IndexEngine for SegmentEngine {
    fn add_documents(&self, docs: Vec<Document>) -> Result<usize> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.pending.extend(docs);
        Ok(state.pending.len())
    }

    fn pending_documents(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn commit(&self) -> Result<CommitInfo> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        let needs_merge = state.live.len() > self.config.max_segments;
        if state.pending.is_empty() && !needs_merge {
            return Ok(CommitInfo {
                generation: state.generation,
                files: state.live.clone(),
                changed: false,
            });
        }

        let mut generation = state.generation;
        let mut live = state.live.clone();
        let mut written = Vec::new();

        let result = (|| -> Result<()> {
            if !state.pending.is_empty() {
                generation += 1;
                let name = segment_name(generation);
                live.push(self.write_segment(&name, state.pending.clone())?);
                written.push(name);
            }

            if live.len() > self.config.max_segments {
                let mut merged = Vec::new();
                for file in &live {
                    merged.extend(self.load_segment(file)?.iter().cloned());
                }
                generation += 1;
                let name = segment_name(generation);
                let descriptor = self.write_segment(&name, merged)?;
                written.push(name);
                tracing::debug!(
                    "Merged {} segments into {}",
                    live.len(),
                    descriptor.name
                );
                live = vec![descriptor];
            }
            Ok(())
        })();

        if let Err(e) = result {
            for name in &written {
                self.discard(name);
            }
            return Err(Error::commit(e.to_string()));
        }

        state.pending.clear();
        state.live = live.clone();
        state.generation = generation;

        Ok(CommitInfo {
            generation,
            files: live,
            changed: true,
        })
    }

    fn live_files(&self) -> Vec<SegmentFile> {
        self.state.lock().live.clone()
    }

    fn recover(&self, manifest: &Manifest) -> Result<()> {
        self.ensure_open()?;
        for file in manifest.files() {
            if !self.has_segment(file) {
                return Err(Error::engine(format!(
                    "Segment {} missing or corrupt during recovery",
                    file.name
                )));
            }
        }

        let mut state = self.state.lock();
        state.live = manifest.files().to_vec();
        let max_generation = manifest
            .files()
            .iter()
            .filter_map(|f| parse_segment_name(&f.name))
            .max()
            .unwrap_or(0);
        state.generation = state.generation.max(max_generation);
        Ok(())
    }

    fn has_segment(&self, file: &SegmentFile) -> bool {
        self.on_disk.get(&file.name).as_deref() == Some(file)
    }

    fn read_segment(&self, name: &str) -> Result<Vec<u8>> {
        if !self.on_disk.contains_key(name) {
            return Err(Error::engine(format!("Unknown segment {}", name)));
        }
        Ok(std::fs::read(self.segments_dir.join(name))?)
    }

    fn install_segment(&self, file: &SegmentFile, staged: &Path) -> Result<()> {
        self.ensure_open()?;
        let bytes = std::fs::read(staged)?;
        let actual = SegmentFile::from_bytes(file.name.clone(), &bytes);
        if actual.checksum != file.checksum || actual.length != file.length {
            return Err(Error::ChecksumMismatch {
                file: file.name.clone(),
                expected: file.checksum,
                actual: actual.checksum,
            });
        }

        if self.has_segment(file) {
            std::fs::remove_file(staged)?;
            return Ok(());
        }

        {
            let staged_file = std::fs::File::open(staged)?;
            staged_file.sync_all()?;
        }
        std::fs::rename(staged, self.segments_dir.join(&file.name))?;
        self.cache.remove(&file.name);
        self.on_disk.insert(file.name.clone(), actual);
        Ok(())
    }

    fn remove_segments(&self, names: &[String]) -> Result<()> {
        let state = self.state.lock();
        for name in names {
            if state.live.iter().any(|f| &f.name == name) {
                continue;
            }
            self.discard(name);
        }
        Ok(())
    }

    fn list_segments(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.on_disk.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn staging_root(&self) -> PathBuf {
        self.staging_dir.clone()
    }

    fn open_point(&self, manifest: &Manifest) -> Result<PointSearcher> {
        self.ensure_open()?;
        let mut segments = Vec::with_capacity(manifest.len());
        for file in manifest.files() {
            segments.push(self.load_segment(file)?);
        }
        PointSearcher::build(segments.iter().flat_map(|docs| docs.iter()))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pending = self.state.lock().pending.len();
        if pending > 0 {
            tracing::warn!("Closing engine with {} uncommitted documents", pending);
        }
        self.cache.clear();
        if self.staging_dir.exists() {
            std::fs::remove_dir_all(&self.staging_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    fn docs(range: std::ops::Range<usize>) -> Vec<Document> {
        range
            .map(|i| Document::new(format!("doc-{i}")).with_field("body", format!("text {i}")))
            .collect()
    }

    #[test]
    fn test_segment_name_roundtrip() {
        assert_eq!(segment_name(7), "seg_0000000007.sgm");
        assert_eq!(parse_segment_name("seg_0000000007.sgm"), Some(7));
        assert_eq!(parse_segment_name("meta.json"), None);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        assert!(decode_segment(b"garbage!").is_err());
        assert!(decode_segment(b"xy").is_err());
    }

    #[test]
    fn test_commit_without_pending_is_unchanged() {
        let ctx = TestContext::new();
        let engine = SegmentEngine::open(ctx.path(), EngineConfig::default()).unwrap();

        let info = engine.commit().unwrap();
        assert!(!info.changed);
        assert!(info.files.is_empty());
    }

    #[test]
    fn test_commit_writes_immutable_segments() {
        let ctx = TestContext::new();
        let engine = SegmentEngine::open(ctx.path(), EngineConfig::default()).unwrap();

        engine.add_documents(docs(0..2)).unwrap();
        let first = engine.commit().unwrap();
        assert!(first.changed);
        assert_eq!(first.files.len(), 1);
        assert_eq!(engine.pending_documents(), 0);

        engine.add_documents(docs(2..4)).unwrap();
        let second = engine.commit().unwrap();
        assert_eq!(second.files.len(), 2);
        assert_eq!(second.files[0], first.files[0]);
        assert!(second.generation > first.generation);

        let bytes = engine.read_segment(&first.files[0].name).unwrap();
        assert_eq!(crc32fast::hash(&bytes), first.files[0].checksum);
    }

    #[test]
    fn test_merge_above_max_segments() {
        let ctx = TestContext::new();
        let engine = SegmentEngine::open(ctx.path(), EngineConfig { max_segments: 2 }).unwrap();

        for i in 0..3 {
            engine.add_documents(docs(i * 2..i * 2 + 2)).unwrap();
            engine.commit().unwrap();
        }

        let live = engine.live_files();
        assert_eq!(live.len(), 1);
        let searcher = engine.open_point(&Manifest::new(live)).unwrap();
        assert_eq!(searcher.num_docs(), 6);
    }

    #[test]
    fn test_install_rejects_corrupt_staged_file() {
        let ctx = TestContext::new();
        let primary = SegmentEngine::open(ctx.path().join("p"), EngineConfig::default()).unwrap();
        let replica = SegmentEngine::open(ctx.path().join("r"), EngineConfig::default()).unwrap();

        primary.add_documents(docs(0..3)).unwrap();
        let info = primary.commit().unwrap();
        let file = &info.files[0];

        let mut bytes = primary.read_segment(&file.name).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let staged = replica.staging_root().join("corrupt.part");
        std::fs::write(&staged, &bytes).unwrap();

        let err = replica.install_segment(file, &staged).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!replica.has_segment(file));
    }

    #[test]
    fn test_install_and_open_on_replica() {
        let ctx = TestContext::new();
        let primary = SegmentEngine::open(ctx.path().join("p"), EngineConfig::default()).unwrap();
        let replica = SegmentEngine::open(ctx.path().join("r"), EngineConfig::default()).unwrap();

        primary.add_documents(docs(0..3)).unwrap();
        let info = primary.commit().unwrap();
        let file = &info.files[0];

        let staged = replica.staging_root().join("ok.part");
        std::fs::write(&staged, primary.read_segment(&file.name).unwrap()).unwrap();
        replica.install_segment(file, &staged).unwrap();

        assert!(replica.has_segment(file));
        let searcher = replica.open_point(&Manifest::new(info.files.clone())).unwrap();
        assert_eq!(searcher.num_docs(), 3);
    }

    #[test]
    fn test_reopen_finds_segments_and_recovers() {
        let ctx = TestContext::new();
        let files = {
            let engine = SegmentEngine::open(ctx.path(), EngineConfig::default()).unwrap();
            engine.add_documents(docs(0..2)).unwrap();
            engine.commit().unwrap().files
        };

        let engine = SegmentEngine::open(ctx.path(), EngineConfig::default()).unwrap();
        let manifest = Manifest::new(files.clone());
        engine.recover(&manifest).unwrap();
        assert_eq!(engine.live_files(), files);

        engine.add_documents(docs(2..3)).unwrap();
        let info = engine.commit().unwrap();
        assert_eq!(info.generation, 2);
    }

    #[test]
    fn test_remove_skips_live_segments() {
        let ctx = TestContext::new();
        let engine = SegmentEngine::open(ctx.path(), EngineConfig::default()).unwrap();
        engine.add_documents(docs(0..1)).unwrap();
        let info = engine.commit().unwrap();

        engine.remove_segments(&[info.files[0].name.clone()]).unwrap();
        assert!(engine.has_segment(&info.files[0]));
    }

    #[test]
    fn test_closed_engine_rejects_writes() {
        let ctx = TestContext::new();
        let engine = SegmentEngine::open(ctx.path(), EngineConfig::default()).unwrap();
        engine.close().unwrap();
        assert!(matches!(
            engine.add_documents(docs(0..1)),
            Err(Error::Shutdown(_))
        ));
    }
}
