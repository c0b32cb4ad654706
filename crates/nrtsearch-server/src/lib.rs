//! nrtsearch server - HTTP API for one index node
//!
//! Provides REST endpoints for:
//! - GET /health - Node health
//! - POST /v1/indexes/{index}/documents - Add documents (primary)
//! - POST /v1/indexes/{index}/refresh - Refresh (primary) or sync (replica)
//! - POST /v1/indexes/{index}/nrt_point - Publish an NRT point (primary)
//! - POST /v1/indexes/{index}/search - Search the active or a pinned version
//! - GET /v1/indexes/{index}/replication - Replication status
//! - POST /v1/indexes/{index}/sync - Sync with the primary now (replica)

use axum::Router;
use axum::routing::{get, post};
use nrtsearch_core::IndexNode;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

pub mod api;
pub mod config;

/// Shared handler state
pub struct NodeServer {
    /// Hosted node
    pub node: Arc<IndexNode>,
    /// Process start, for uptime
    pub started_at: Instant,
}

impl NodeServer {
    /// Wrap a node
    pub fn new(node: Arc<IndexNode>) -> Self {
        Self {
            node,
            started_at: Instant::now(),
        }
    }
}

/// Build the HTTP router
pub fn router(server: Arc<NodeServer>) -> Router {
    Router::new()
        .route("/health", get(api::health::health_check))
        .route("/v1/indexes/{index}/documents", post(api::indexes::add_documents))
        .route("/v1/indexes/{index}/refresh", post(api::indexes::refresh))
        .route("/v1/indexes/{index}/nrt_point", post(api::indexes::write_nrt_point))
        .route("/v1/indexes/{index}/search", post(api::indexes::search))
        .route("/v1/indexes/{index}/replication", get(api::replication::get_status))
        .route("/v1/indexes/{index}/sync", post(api::replication::sync_now))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(server)
}
