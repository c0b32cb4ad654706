//! Replication status and manual sync

use super::ApiError;
use crate::NodeServer;
use axum::extract::{Json, Path, State};
use nrtsearch_core::SyncOutcome;
use nrtsearch_protocol::{ReplicationStatusResponse, SyncResponse};
use std::sync::Arc;

/// `GET /v1/indexes/{index}/replication`
pub async fn get_status(
    State(server): State<Arc<NodeServer>>,
    Path(index): Path<String>,
) -> Result<Json<ReplicationStatusResponse>, ApiError> {
    let node = &server.node;
    if index != node.index_name() {
        return Err(nrtsearch_core::Error::IndexNotFound(index).into());
    }

    let status = node.status();
    let stats = serde_json::json!({
        "gateway": status.gateway,
        "store": status.store,
        "publisher": status.publisher,
        "client": status.client,
        "uptime_secs": server.started_at.elapsed().as_secs(),
    });

    Ok(Json(ReplicationStatusResponse {
        node_name: status.identity.node_name,
        index_name: status.identity.index_name,
        role: status.identity.role.to_string(),
        active_version: status.active_version,
        retained_versions: status.retained_versions,
        sync_state: status.sync_state.map(|state| state.to_string()),
        pending_version: status.pending_version,
        primary_version: status.primary_version,
        replication_endpoint: status
            .identity
            .replication_endpoint
            .map(|addr| addr.to_string()),
        stats,
    }))
}

/// `POST /v1/indexes/{index}/sync`
pub async fn sync_now(
    State(server): State<Arc<NodeServer>>,
    Path(index): Path<String>,
) -> Result<Json<SyncResponse>, ApiError> {
    let response = match server.node.sync_now(&index).await? {
        SyncOutcome::UpToDate { version } => SyncResponse {
            version,
            activated: false,
            files_fetched: 0,
            bytes: 0,
        },
        SyncOutcome::Activated {
            version,
            files_fetched,
            bytes,
            ..
        } => SyncResponse {
            version,
            activated: true,
            files_fetched,
            bytes,
        },
    };
    Ok(Json(response))
}
