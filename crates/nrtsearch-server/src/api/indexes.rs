//! Index endpoints: ingestion, refresh, NRT points and search

use super::ApiError;
use crate::NodeServer;
use axum::extract::{Json, Path, State};
use nrtsearch_core::{Document, SearchRequest};
use nrtsearch_protocol::{
    AddDocumentsRequest, AddDocumentsResponse, HitPayload, RefreshResponse, SearchRequestBody,
    SearchResponseBody, WriteNrtPointResponse,
};
use std::sync::Arc;

/// `POST /v1/indexes/{index}/documents`
pub async fn add_documents(
    State(server): State<Arc<NodeServer>>,
    Path(index): Path<String>,
    Json(request): Json<AddDocumentsRequest>,
) -> Result<Json<AddDocumentsResponse>, ApiError> {
    let accepted = request.documents.len();
    let docs = request
        .documents
        .into_iter()
        .map(|payload| Document {
            id: payload.id,
            fields: payload.fields,
        })
        .collect();

    let pending = server.node.add_documents(&index, docs)?;
    Ok(Json(AddDocumentsResponse {
        success: true,
        accepted,
        pending,
    }))
}

/// `POST /v1/indexes/{index}/refresh`
pub async fn refresh(
    State(server): State<Arc<NodeServer>>,
    Path(index): Path<String>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let version = server.node.refresh(&index).await?;
    Ok(Json(RefreshResponse {
        success: true,
        version,
    }))
}

/// `POST /v1/indexes/{index}/nrt_point`
pub async fn write_nrt_point(
    State(server): State<Arc<NodeServer>>,
    Path(index): Path<String>,
) -> Result<Json<WriteNrtPointResponse>, ApiError> {
    let result = server.node.write_nrt_point(&index).await?;
    Ok(Json(WriteNrtPointResponse {
        version: result.version,
        did_refresh: result.did_refresh,
    }))
}

/// `POST /v1/indexes/{index}/search`
pub async fn search(
    State(server): State<Arc<NodeServer>>,
    Path(index): Path<String>,
    Json(body): Json<SearchRequestBody>,
) -> Result<Json<SearchResponseBody>, ApiError> {
    let mut request = SearchRequest::new(index, body.query)
        .page(body.start_hit, body.top_hits)
        .with_fields(body.retrieve_fields);
    if let Some(version) = body.version {
        request = request.at_version(version);
    }

    let response = server.node.search(request).await?;
    Ok(Json(SearchResponseBody {
        total_hits: response.total_hits,
        hits: response
            .hits
            .into_iter()
            .map(|hit| HitPayload {
                id: hit.id,
                score: hit.score,
                fields: hit.fields,
            })
            .collect(),
        version_served: response.version_served,
    }))
}
