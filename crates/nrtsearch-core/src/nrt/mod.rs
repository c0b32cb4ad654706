//! NRT points: versioned, immutable views of the primary's index
//!
//! ```text
//! addDocuments ──► engine (pending) ──► refresh ──► commit ──► NrtPoint { version + 1, manifest }
//!                                                          └─► listener (primary gateway activates)
//! ```
//!
//! Version numbering is owned by [`NrtPointStore`]: a refresh that changes the
//! engine's live file set produces exactly one new version, a refresh that does
//! not is a no-op.

pub mod manifest;
pub mod retention;
pub mod store;

pub use manifest::{Manifest, ManifestDelta, SegmentFile, Version};
pub use retention::{PointLease, PointRetention};
pub use store::{DeltaOutcome, NrtPointStore, PointListener, RefreshOutcome, StoreStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable record of one published index state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NrtPoint {
    /// Searcher version
    pub version: Version,
    /// Segment files making up the point
    pub manifest: Manifest,
    /// Creation time on the primary
    pub created_at: DateTime<Utc>,
}

impl NrtPoint {
    /// Create a point stamped with the current time
    pub fn new(version: Version, manifest: Manifest) -> Self {
        Self {
            version,
            manifest,
            created_at: Utc::now(),
        }
    }
}
