//! NRT point replication
//!
//! Replicas pull NRT points from the primary over a framed TCP protocol:
//! - The primary publishes points through its [`ReplicationPublisher`]
//! - Each node runs a [`ReplicationServer`]; only a primary serves points
//! - A replica's [`ReplicationClient`] fetches the delta (or a full copy),
//!   verifies it, and activates the new version atomically
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   GetLatestPoint    ┌─────────────────┐
//! │     Primary     │ ◄────────────────── │    Replica 1    │
//! │                 │   TransferHeader    │                 │
//! │  writeNRTPoint  │ ──────────────────► │  stage, verify, │
//! │  publishes v+1  │   FileChunk ...     │  activate v+1   │
//! └─────────────────┘                     └─────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! All messages use bincode serialization with CRC32 validation:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```

pub mod client;
pub mod connection;
pub mod protocol;
pub mod publisher;
pub mod server;

pub use client::{ClientStats, ReplicaLocalState, ReplicationClient, SyncOutcome, SyncState};
pub use connection::{FetchedFiles, PrimaryConnection, TransferHeader};
pub use protocol::{ReplicationMessage, ReplicationMessageType};
pub use publisher::{PublisherStats, ReplicationPublisher, SearcherVersion, TransferPlan};
pub use server::ReplicationServer;
