//! REST client for a node's HTTP API

use crate::types::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

/// REST client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport failure or undecodable body
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The node answered with an error body
    #[error("{code} ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error code from the body
        code: String,
        /// Error message from the body
        message: String,
    },
}

impl ClientError {
    /// Error code sent by the node, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            Self::Http(_) => None,
        }
    }
}

/// REST client for one node
#[derive(Debug, Clone)]
pub struct RestClient {
    /// Base URL
    base_url: String,
    http: reqwest::Client,
}

impl RestClient {
    /// Create a new REST client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    /// Create a client with a per-request timeout
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build full URL for a path
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Send a POST request
    pub async fn post<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, ClientError> {
        let url = self.build_url(path);
        tracing::debug!("POST {}", url);
        let response = self.http.post(url).json(body).send().await?;
        Self::decode(response).await
    }

    /// Send a GET request
    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, ClientError> {
        let url = self.build_url(path);
        tracing::debug!("GET {}", url);
        let response = self.http.get(url).send().await?;
        Self::decode(response).await
    }

    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await?;
        let (code, message) = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(error) => (error.code, error.message),
            Err(_) => ("HTTP_ERROR".to_string(), body),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    fn index_path(index: &str, operation: &str) -> String {
        format!("/v1/indexes/{}/{}", index, operation)
    }

    /// Node health
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get("/health").await
    }

    /// Buffer documents on the primary
    pub async fn add_documents(
        &self,
        index: &str,
        documents: Vec<DocumentPayload>,
    ) -> Result<AddDocumentsResponse, ClientError> {
        self.post(&Self::index_path(index, "documents"), &AddDocumentsRequest { documents })
            .await
    }

    /// Refresh (primary) or sync (replica)
    pub async fn refresh(&self, index: &str) -> Result<RefreshResponse, ClientError> {
        self.post(&Self::index_path(index, "refresh"), &serde_json::json!({}))
            .await
    }

    /// Publish a new NRT point on the primary
    pub async fn write_nrt_point(&self, index: &str) -> Result<WriteNrtPointResponse, ClientError> {
        self.post(&Self::index_path(index, "nrt_point"), &serde_json::json!({}))
            .await
    }

    /// Search the active or a pinned version
    pub async fn search(
        &self,
        index: &str,
        request: &SearchRequestBody,
    ) -> Result<SearchResponseBody, ClientError> {
        self.post(&Self::index_path(index, "search"), request).await
    }

    /// Replication status
    pub async fn replication_status(&self, index: &str) -> Result<ReplicationStatusResponse, ClientError> {
        self.get(&Self::index_path(index, "replication")).await
    }

    /// Trigger a sync on a replica
    pub async fn sync(&self, index: &str) -> Result<SyncResponse, ClientError> {
        self.post(&Self::index_path(index, "sync"), &serde_json::json!({}))
            .await
    }
}
