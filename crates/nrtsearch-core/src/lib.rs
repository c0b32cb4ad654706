//! nrtsearch core - near-real-time index replication
//!
//! This crate implements primary/replica replication of a search index with
//! versioned-read consistency:
//! - Index engine producing immutable, checksummed segment files
//! - NRT point store assigning strictly increasing versions on refresh
//! - Replication publisher and pull-based replication client
//! - Versioned search gateway serving exact versions with atomic activation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 IndexNode                    │
//! │     (identity, role: Primary | Replica)     │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │          Versioned Search Gateway            │
//! │   (active version, retained searchers)      │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   NRT Point Store  /  Replication Client     │
//! │  (versions, manifests, leases, transfers)   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │              Index Engine                    │
//! │   (segment files, commit, merge, searcher)  │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod node;
pub mod nrt;
pub mod replication;
pub mod testing;

pub use config::{NodeConfig, ReplicationConfig, Role, SearchConfig, VersionWaitPolicy};
pub use engine::{Document, IndexEngine, SegmentEngine};
pub use error::{Error, Result};
pub use gateway::{SearchGateway, SearchRequest, SearchResponse};
pub use node::{IndexNode, NodeIdentity, NodeRole, NodeStatus};
pub use nrt::{Manifest, NrtPoint, SegmentFile, Version};
pub use replication::{ReplicationServer, SearcherVersion, SyncOutcome, SyncState};
