//! Primary/replica fixtures over loopback TCP

use super::TestContext;
use crate::config::{NodeConfig, VersionWaitPolicy};
use crate::engine::{Document, IndexEngine};
use crate::node::IndexNode;
use crate::nrt::Version;
use crate::replication::ReplicationServer;
use crate::Result;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Index name used by the fixtures
pub const TEST_INDEX: &str = "test_index";

/// A node with its replication endpoint serving on a background task
pub struct TestNode {
    /// The node
    pub node: Arc<IndexNode>,
    /// Its replication endpoint
    pub server: Arc<ReplicationServer>,
    task: JoinHandle<Result<()>>,
}

impl TestNode {
    /// Open a node over a [`crate::engine::SegmentEngine`] and start serving
    pub async fn start(config: NodeConfig) -> Result<Self> {
        Self::serve(IndexNode::open(config)?).await
    }

    /// Open a node over `engine` and start serving
    pub async fn start_with_engine(config: NodeConfig, engine: Arc<dyn IndexEngine>) -> Result<Self> {
        Self::serve(IndexNode::open_with_engine(config, engine)?).await
    }

    async fn serve(node: Arc<IndexNode>) -> Result<Self> {
        let bind_addr = node.config().replication.bind_addr;
        let server = Arc::new(ReplicationServer::bind(bind_addr, node.clone()).await?);
        let task = server.spawn();
        node.start_background();
        Ok(Self { node, server, task })
    }

    /// Bound replication address
    pub fn replication_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Stop serving and close the node
    pub async fn shutdown(self) -> Result<()> {
        self.server.stop();
        let _ = self.task.await;
        self.node.close().await
    }
}

/// Primary configuration rooted under `ctx`
pub fn primary_config(ctx: &TestContext, name: &str) -> NodeConfig {
    NodeConfig::primary(name, TEST_INDEX, ctx.subdir(name), loopback())
        .with_wait_policy(VersionWaitPolicy::Wait {
            timeout: Duration::from_secs(5),
        })
}

/// Replica configuration rooted under `ctx` with short timeouts
pub fn replica_config(ctx: &TestContext, name: &str, primary_addr: SocketAddr) -> NodeConfig {
    let mut config = NodeConfig::replica(name, TEST_INDEX, ctx.subdir(name), primary_addr)
        .with_poll_interval(Duration::from_millis(50))
        .with_wait_policy(VersionWaitPolicy::Wait {
            timeout: Duration::from_secs(5),
        });
    config.replication.bind_addr = loopback();
    config.replication.connect_timeout = Duration::from_secs(2);
    config.replication.read_timeout = Duration::from_secs(5);
    config.replication.transfer_timeout = Duration::from_secs(10);
    config.replication.initial_backoff = Duration::from_millis(20);
    config.replication.max_backoff = Duration::from_millis(200);
    config
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Documents `doc-<n>` for `ids`, each with a `body` and a `group` field
pub fn sample_documents(ids: Range<usize>) -> Vec<Document> {
    ids.map(|i| {
        Document::new(format!("doc-{i}"))
            .with_field("body", format!("sample document number {i}"))
            .with_field("group", if i % 2 == 0 { "even" } else { "odd" })
    })
    .collect()
}

/// Poll until `node` serves at least `version`; false on timeout
pub async fn wait_for_version(node: &IndexNode, version: Version, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while node.current_version() < version {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
