//! REST API handlers
//!
//! Every handler returns `Result<Json<_>, ApiError>`; [`ApiError`] maps core
//! errors to an HTTP status and an [`ErrorResponse`] body.

pub mod health;
pub mod indexes;
pub mod replication;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use nrtsearch_core::Error;
use nrtsearch_protocol::ErrorResponse;

/// Core error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Status and stable error code for the wrapped error
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::IndexNotFound(_) => (StatusCode::NOT_FOUND, "INDEX_NOT_FOUND"),
            Error::RoleMismatch { .. } => (StatusCode::CONFLICT, "ROLE_MISMATCH"),
            Error::VersionNotAvailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "VERSION_NOT_AVAILABLE")
            }
            Error::VersionPruned { .. } => (StatusCode::SERVICE_UNAVAILABLE, "VERSION_PRUNED"),
            Error::Shutdown(_) => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            Error::QueryParse(_) => (StatusCode::BAD_REQUEST, "INVALID_QUERY"),
            Error::Commit(_) => (StatusCode::INTERNAL_SERVER_ERROR, "COMMIT_FAILED"),
            Error::ChecksumMismatch { .. } | Error::Replication(_) | Error::Remote { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "REPLICATION_FAILED")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::warn!("Request failed ({}): {}", code, self.0);
        } else {
            tracing::debug!("Request rejected ({}): {}", code, self.0);
        }
        (
            status,
            Json(ErrorResponse {
                success: false,
                code: code.to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::IndexNotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::role_mismatch("addDocuments", "replica"), StatusCode::CONFLICT),
            (
                Error::VersionNotAvailable {
                    requested: 4,
                    active: 2,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::VersionPruned {
                    requested: 1,
                    oldest: 3,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::timeout("sync"), StatusCode::GATEWAY_TIMEOUT),
            (Error::commit("disk full"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status_and_code().0, status);
        }
    }
}
