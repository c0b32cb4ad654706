//! Index node: one index hosted in one role
//!
//! An [`IndexNode`] owns the index engine, the search gateway and the
//! role-specific replication component. Role-dependent operations dispatch on
//! [`NodeRole`]; a write directed at a replica fails with
//! [`Error::RoleMismatch`] before touching any state.
//!
//! ```text
//!            ┌──────────── IndexNode ────────────┐
//!            │  NodeIdentity   SearchGateway     │
//!  Primary:  │  NrtPointStore ─► ReplicationPublisher
//!  Replica:  │  ReplicationClient ─► activate    │
//!            └───────────────────────────────────┘
//! ```

use crate::config::{NodeConfig, Role};
use crate::engine::{Document, IndexEngine, SegmentEngine};
use crate::gateway::{GatewayStats, SearchGateway, SearchRequest, SearchResponse};
use crate::nrt::{NrtPointStore, StoreStats, Version};
use crate::replication::{
    ClientStats, PublisherStats, ReplicationClient, ReplicationPublisher, SearcherVersion,
    SyncOutcome, SyncState, TransferPlan,
};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Who a node is and where it can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Node name
    pub node_name: String,
    /// Hosted index
    pub index_name: String,
    /// Role for the index
    pub role: Role,
    /// Search endpoint, if advertised
    pub search_endpoint: Option<String>,
    /// Bound replication endpoint, once the server is listening
    pub replication_endpoint: Option<SocketAddr>,
}

/// Role-specific capability
pub enum NodeRole {
    /// Originates NRT points
    Primary {
        /// Publisher over the node's point store
        publisher: Arc<ReplicationPublisher>,
    },
    /// Mirrors the primary's NRT points
    Replica {
        /// Client pulling points from the primary
        client: Arc<ReplicationClient>,
    },
}

impl NodeRole {
    /// Plain role tag
    pub fn role(&self) -> Role {
        match self {
            Self::Primary { .. } => Role::Primary,
            Self::Replica { .. } => Role::Replica,
        }
    }
}

/// Replication status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node identity
    pub identity: NodeIdentity,
    /// Version served by default
    pub active_version: Version,
    /// Versions with a retained searcher
    pub retained_versions: Vec<Version>,
    /// Replica sync state
    pub sync_state: Option<SyncState>,
    /// Version being assembled on a replica
    pub pending_version: Option<Version>,
    /// Latest version known on the primary
    pub primary_version: Option<Version>,
    /// Search counters
    pub gateway: GatewayStats,
    /// Refresh counters (primary)
    pub store: Option<StoreStats>,
    /// Transfer counters (primary)
    pub publisher: Option<PublisherStats>,
    /// Sync counters (replica)
    pub client: Option<ClientStats>,
}

/// One index hosted by this process
pub struct IndexNode {
    config: NodeConfig,
    replication_endpoint: RwLock<Option<SocketAddr>>,
    engine: Arc<dyn IndexEngine>,
    gateway: Arc<SearchGateway>,
    role: NodeRole,
    closed: AtomicBool,
}

impl IndexNode {
    /// Open a node over a [`SegmentEngine`] in `config.data_dir`
    pub fn open(config: NodeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let engine = Arc::new(SegmentEngine::open(&config.data_dir, config.engine.clone())?);
        Self::open_with_engine(config, engine)
    }

    /// Open a node over a caller-provided engine
    pub fn open_with_engine(config: NodeConfig, engine: Arc<dyn IndexEngine>) -> Result<Arc<Self>> {
        config.validate()?;

        let (gateway, role) = match config.role {
            Role::Primary => {
                let store = Arc::new(NrtPointStore::open(
                    engine.clone(),
                    &config.data_dir,
                    config.replication.retained_points,
                )?);
                let latest = store.latest_point();
                let searcher = engine.open_point(&latest.manifest)?;
                let gateway = Arc::new(SearchGateway::new(
                    config.index_name.clone(),
                    &config.search,
                    latest.version,
                    Arc::new(searcher),
                ));
                store.set_listener(gateway.clone());
                let publisher = Arc::new(ReplicationPublisher::new(
                    config.index_name.clone(),
                    store,
                    config.replication.clone(),
                ));
                (gateway, NodeRole::Primary { publisher })
            }
            Role::Replica => {
                let primary_addr = config
                    .replication
                    .primary_addr
                    .ok_or_else(|| Error::config("replica requires replication.primary_addr"))?;
                let restored = ReplicationClient::restore(&engine, &config.data_dir)?;
                let gateway = Arc::new(SearchGateway::new(
                    config.index_name.clone(),
                    &config.search,
                    restored.state.active_version,
                    Arc::new(restored.searcher),
                ));
                let client = Arc::new(ReplicationClient::new(
                    config.node_name.clone(),
                    config.index_name.clone(),
                    primary_addr,
                    config.replication.clone(),
                    engine.clone(),
                    gateway.clone(),
                    &config.data_dir,
                    restored.state,
                    restored.force_full,
                ));
                gateway.set_sync_trigger(client.trigger());
                (gateway, NodeRole::Replica { client })
            }
        };

        tracing::info!(
            "Opened {} node {} for index {} at version {}",
            config.role,
            config.node_name,
            config.index_name,
            gateway.active_version()
        );

        Ok(Arc::new(Self {
            config,
            replication_endpoint: RwLock::new(None),
            engine,
            gateway,
            role,
            closed: AtomicBool::new(false),
        }))
    }

    /// Node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Node name
    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// Hosted index
    pub fn index_name(&self) -> &str {
        &self.config.index_name
    }

    /// Role for the hosted index
    pub fn role(&self) -> Role {
        self.role.role()
    }

    /// Whether this node is the primary
    pub fn is_primary(&self) -> bool {
        matches!(self.role, NodeRole::Primary { .. })
    }

    /// Current identity
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_name: self.config.node_name.clone(),
            index_name: self.config.index_name.clone(),
            role: self.role(),
            search_endpoint: self.config.search_endpoint.clone(),
            replication_endpoint: *self.replication_endpoint.read(),
        }
    }

    /// Record the bound replication address
    pub fn set_replication_endpoint(&self, addr: SocketAddr) {
        *self.replication_endpoint.write() = Some(addr);
    }

    /// Active version of the search gateway
    pub fn current_version(&self) -> Version {
        self.gateway.active_version()
    }

    /// Search gateway
    pub fn gateway(&self) -> &Arc<SearchGateway> {
        &self.gateway
    }

    /// Index engine
    pub fn engine(&self) -> &Arc<dyn IndexEngine> {
        &self.engine
    }

    /// Publisher, or a role error naming `operation`
    pub fn publisher(&self, operation: &str) -> Result<&Arc<ReplicationPublisher>> {
        match &self.role {
            NodeRole::Primary { publisher } => Ok(publisher),
            NodeRole::Replica { .. } => Err(Error::role_mismatch(operation, Role::Replica)),
        }
    }

    /// Replication client, or a role error naming `operation`
    pub fn client(&self, operation: &str) -> Result<&Arc<ReplicationClient>> {
        match &self.role {
            NodeRole::Replica { client } => Ok(client),
            NodeRole::Primary { .. } => Err(Error::role_mismatch(operation, Role::Primary)),
        }
    }

    fn check(&self, index_name: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::shutdown(format!("Node {} is closed", self.config.node_name)));
        }
        if index_name != self.config.index_name {
            return Err(Error::IndexNotFound(index_name.to_string()));
        }
        Ok(())
    }

    /// Buffer documents for the next refresh; returns the pending count
    pub fn add_documents(&self, index_name: &str, docs: Vec<Document>) -> Result<usize> {
        self.check(index_name)?;
        self.publisher("addDocuments")?;
        let count = docs.len();
        let pending = self.engine.add_documents(docs)?;
        tracing::debug!("Added {} documents to {} ({} pending)", count, index_name, pending);
        Ok(pending)
    }

    /// Make pending changes searchable.
    ///
    /// On a primary this publishes a new point; on a replica it runs one sync
    /// with the primary. Either way the result is the node's version afterwards.
    pub async fn refresh(&self, index_name: &str) -> Result<Version> {
        self.check(index_name)?;
        match &self.role {
            NodeRole::Primary { publisher } => Ok(publisher.write_nrt_point(index_name).await?.version),
            NodeRole::Replica { client } => Ok(client.sync_now().await?.version()),
        }
    }

    /// Publish a new NRT point (primary only)
    pub async fn write_nrt_point(&self, index_name: &str) -> Result<SearcherVersion> {
        self.check(index_name)?;
        let result = self.publisher("writeNRTPoint")?.write_nrt_point(index_name).await?;
        if result.did_refresh {
            tracing::info!("Index {} published version {}", index_name, result.version);
        }
        Ok(result)
    }

    /// Plan a transfer for a replica at `since_version` (primary only)
    pub fn get_segment_files(&self, index_name: &str, since_version: Option<Version>) -> Result<TransferPlan> {
        self.check(index_name)?;
        Ok(self.publisher("getSegmentFiles")?.get_segment_files(since_version))
    }

    /// Search the active or a pinned version
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        self.check(&request.index_name)?;
        self.gateway.search(request).await
    }

    /// Sync with the primary now (replica only)
    pub async fn sync_now(&self, index_name: &str) -> Result<SyncOutcome> {
        self.check(index_name)?;
        self.client("sync")?.sync_now().await
    }

    /// Replication status snapshot
    pub fn status(&self) -> NodeStatus {
        let mut status = NodeStatus {
            identity: self.identity(),
            active_version: self.gateway.active_version(),
            retained_versions: self.gateway.retained_versions(),
            sync_state: None,
            pending_version: None,
            primary_version: None,
            gateway: self.gateway.stats(),
            store: None,
            publisher: None,
            client: None,
        };

        match &self.role {
            NodeRole::Primary { publisher } => {
                status.primary_version = Some(publisher.latest_point().version);
                status.store = Some(publisher.store().stats());
                status.publisher = Some(publisher.stats());
            }
            NodeRole::Replica { client } => {
                let stats = client.stats();
                status.sync_state = Some(client.sync_state());
                status.pending_version = client.local_state().pending_version;
                status.primary_version = stats.primary_version;
                status.client = Some(stats);
            }
        }
        status
    }

    /// Start the background refresh scheduler or the replica sync loop
    pub fn start_background(&self) {
        match &self.role {
            NodeRole::Primary { publisher } => publisher.start(),
            NodeRole::Replica { client } => client.start(),
        }
    }

    /// Stop background work, release searchers and close the engine
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Closing {} node {}", self.role(), self.config.node_name);

        match &self.role {
            NodeRole::Primary { publisher } => {
                publisher.stop().await;
                publisher.store().close();
            }
            NodeRole::Replica { client } => client.stop().await,
        }
        self.gateway.close();
        self.engine.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    fn primary(ctx: &TestContext) -> Arc<IndexNode> {
        let config = NodeConfig::primary("primary", "idx", ctx.subdir("primary"), "127.0.0.1:0".parse().unwrap());
        IndexNode::open(config).unwrap()
    }

    #[tokio::test]
    async fn test_primary_refresh_and_search() {
        let ctx = TestContext::new();
        let node = primary(&ctx);

        node.add_documents("idx", vec![Document::new("a").with_field("body", "hello world")])
            .unwrap();
        assert_eq!(node.refresh("idx").await.unwrap(), 1);

        let response = node.search(SearchRequest::new("idx", "hello")).await.unwrap();
        assert_eq!(response.total_hits, 1);
        assert_eq!(response.version_served, 1);
        assert_eq!(node.current_version(), 1);
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_index_rejected() {
        let ctx = TestContext::new();
        let node = primary(&ctx);
        assert!(matches!(
            node.add_documents("other", vec![Document::new("a")]),
            Err(Error::IndexNotFound(_))
        ));
        assert!(matches!(
            node.search(SearchRequest::new("other", "*")).await,
            Err(Error::IndexNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_primary_has_no_replication_client() {
        let ctx = TestContext::new();
        let node = primary(&ctx);
        assert!(matches!(node.sync_now("idx").await, Err(Error::RoleMismatch { .. })));
        assert!(node.status().sync_state.is_none());
        assert_eq!(node.status().identity.role, Role::Primary);
    }

    #[tokio::test]
    async fn test_replica_rejects_writes() {
        let ctx = TestContext::new();
        let config = NodeConfig::replica("replica", "idx", ctx.subdir("replica"), "127.0.0.1:9".parse().unwrap());
        let node = IndexNode::open(config).unwrap();

        let err = node.add_documents("idx", vec![Document::new("a")]).unwrap_err();
        assert!(matches!(err, Error::RoleMismatch { ref role, .. } if role == "replica"));
        assert!(matches!(
            node.write_nrt_point("idx").await,
            Err(Error::RoleMismatch { .. })
        ));
        assert!(matches!(
            node.get_segment_files("idx", None),
            Err(Error::RoleMismatch { .. })
        ));
        assert_eq!(node.current_version(), 0);
        assert_eq!(node.status().sync_state, Some(SyncState::Disconnected));
    }

    #[tokio::test]
    async fn test_closed_node_rejects_operations() {
        let ctx = TestContext::new();
        let node = primary(&ctx);
        node.close().await.unwrap();
        node.close().await.unwrap();
        assert!(matches!(node.refresh("idx").await, Err(Error::Shutdown(_))));
    }
}
