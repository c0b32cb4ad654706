//! JSON bodies of the node HTTP API

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_top_hits() -> usize {
    10
}

/// Document as sent by ingestion clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Document id
    pub id: String,
    /// Field values
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl DocumentPayload {
    /// Document with no fields
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// `POST /v1/indexes/{index}/documents`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDocumentsRequest {
    /// Documents to buffer until the next refresh
    pub documents: Vec<DocumentPayload>,
}

/// Ack for an ingested batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDocumentsResponse {
    /// Success flag
    pub success: bool,
    /// Documents accepted in this request
    pub accepted: usize,
    /// Documents waiting for the next refresh
    pub pending: usize,
}

/// Ack for `POST /v1/indexes/{index}/refresh`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResponse {
    /// Success flag
    pub success: bool,
    /// Version the node serves after the refresh
    pub version: u64,
}

/// Result of `POST /v1/indexes/{index}/nrt_point`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteNrtPointResponse {
    /// Latest version
    pub version: u64,
    /// False when nothing changed since the previous point
    pub did_refresh: bool,
}

/// `POST /v1/indexes/{index}/search`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequestBody {
    /// Pinned version; the active version when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Query string; empty or `*` matches everything
    #[serde(default)]
    pub query: String,
    /// Offset of the first hit
    #[serde(default)]
    pub start_hit: usize,
    /// Page size
    #[serde(default = "default_top_hits")]
    pub top_hits: usize,
    /// Stored fields to return
    #[serde(default)]
    pub retrieve_fields: Vec<String>,
}

impl SearchRequestBody {
    /// Query the active version
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            version: None,
            query: query.into(),
            start_hit: 0,
            top_hits: default_top_hits(),
            retrieve_fields: Vec::new(),
        }
    }

    /// Pin to a version
    pub fn at_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

/// One hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitPayload {
    /// Document id
    pub id: String,
    /// Score
    pub score: f32,
    /// Requested stored fields
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponseBody {
    /// Matching documents at `version_served`
    pub total_hits: u64,
    /// Ranked hits
    pub hits: Vec<HitPayload>,
    /// Version the search ran against
    pub version_served: u64,
}

/// Result of `POST /v1/indexes/{index}/sync`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Active version after the sync
    pub version: u64,
    /// Whether a newer version was activated
    pub activated: bool,
    /// Files fetched from the primary
    pub files_fetched: usize,
    /// Bytes received
    pub bytes: u64,
}

/// `GET /v1/indexes/{index}/replication`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStatusResponse {
    /// Node name
    pub node_name: String,
    /// Index name
    pub index_name: String,
    /// `primary` or `replica`
    pub role: String,
    /// Version served by default
    pub active_version: u64,
    /// Versions available to pinned searches
    pub retained_versions: Vec<u64>,
    /// Replica sync state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<String>,
    /// Version being assembled on a replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_version: Option<u64>,
    /// Latest version known on the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_version: Option<u64>,
    /// Replication endpoint address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_endpoint: Option<String>,
    /// Component counters
    #[serde(default)]
    pub stats: serde_json::Value,
}

/// `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok` while the node serves
    pub status: String,
    /// Server version
    pub version: String,
    /// Node name
    pub node_name: String,
    /// Index name
    pub index_name: String,
    /// `primary` or `replica`
    pub role: String,
    /// Version served by default
    pub active_version: u64,
}

/// Error body returned with every non-2xx status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false
    pub success: bool,
    /// Stable machine-readable code, e.g. `ROLE_MISMATCH`
    pub code: String,
    /// Human-readable message
    pub message: String,
}
