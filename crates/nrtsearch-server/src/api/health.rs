//! Health check endpoint

use crate::NodeServer;
use axum::extract::{Json, State};
use nrtsearch_protocol::HealthResponse;
use std::sync::Arc;

/// `GET /health`
pub async fn health_check(State(server): State<Arc<NodeServer>>) -> Json<HealthResponse> {
    let node = &server.node;
    tracing::trace!("Health check after {:?} uptime", server.started_at.elapsed());
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_name: node.node_name().to_string(),
        index_name: node.index_name().to_string(),
        role: node.role().to_string(),
        active_version: node.current_version(),
    })
}
