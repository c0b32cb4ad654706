//! Testing infrastructure for nrtsearch core
//!
//! Helpers shared by unit and integration tests:
//!
//! - **TestContext**: temporary directory lifecycle with automatic cleanup
//! - **FailingEngine**: engine wrapper that fails commits on demand
//! - **TestNode**: a node plus its replication endpoint on a loopback port
//!
//! # Usage
//!
//! ```rust,no_run
//! use nrtsearch_core::testing::{TestContext, TestNode, primary_config, replica_config};
//!
//! # async fn example() -> nrtsearch_core::Result<()> {
//! let ctx = TestContext::new();
//! let primary = TestNode::start(primary_config(&ctx, "primary")).await?;
//! let replica = TestNode::start(replica_config(&ctx, "replica", primary.replication_addr())).await?;
//! // ...
//! replica.shutdown().await?;
//! primary.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod cluster;
mod context;
mod engine;

pub use cluster::{
    TEST_INDEX, TestNode, primary_config, replica_config, sample_documents, wait_for_version,
};
pub use context::TestContext;
pub use engine::FailingEngine;
