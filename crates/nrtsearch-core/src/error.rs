//! Error types for nrtsearch core

use thiserror::Error;

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication and search layers
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from segment, staging and state files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary (bincode) encoding errors
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// JSON encoding errors for persisted manifests and state
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors surfaced by the tantivy searcher
    #[error("Search engine error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    /// Query string could not be parsed
    #[error("Query parse error: {0}")]
    QueryParse(#[from] tantivy::query::QueryParserError),

    /// Index engine errors (segment format, missing files)
    #[error("Index engine error: {0}")]
    Engine(String),

    /// Commit of pending mutations failed; no version was published
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Replication protocol or transfer errors
    #[error("Replication error: {0}")]
    Replication(String),

    /// A transferred or local file does not match its manifest checksum
    #[error("Checksum mismatch for {file}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Segment file name
        file: String,
        /// Checksum recorded in the manifest
        expected: u32,
        /// Checksum computed over the received bytes
        actual: u32,
    },

    /// Pinned search version has not been activated on this node yet
    #[error("Version {requested} not yet available (active version {active})")]
    VersionNotAvailable {
        /// Requested version
        requested: u64,
        /// Currently active version
        active: u64,
    },

    /// Pinned search version is older than any retained searcher
    #[error("Version {requested} is no longer retained (oldest retained {oldest})")]
    VersionPruned {
        /// Requested version
        requested: u64,
        /// Oldest version still retained
        oldest: u64,
    },

    /// Operation not allowed for this node's role
    #[error("Role mismatch: {operation} is not allowed on a {role} node")]
    RoleMismatch {
        /// Rejected operation
        operation: String,
        /// Role of the node that rejected it
        role: String,
    },

    /// Request addressed an index this node does not host
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Operation did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Node or component has been closed
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// Error frame received from the remote peer
    #[error("Remote error (code {code}): {message}")]
    Remote {
        /// Wire error code
        code: u32,
        /// Message sent by the peer
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an index engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create a commit error
    pub fn commit(msg: impl Into<String>) -> Self {
        Self::Commit(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a role mismatch error
    pub fn role_mismatch(operation: impl Into<String>, role: impl std::fmt::Display) -> Self {
        Self::RoleMismatch {
            operation: operation.into(),
            role: role.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::Shutdown(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Copy of this error for callers sharing one failed operation.
    ///
    /// Keeps the variant (and so the status a caller maps it to); wrapped
    /// library errors that cannot be cloned keep their message.
    pub fn shared(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Encoding(_) | Self::Json(_) => Self::Replication(self.to_string()),
            Self::Tantivy(_) => Self::Engine(self.to_string()),
            Self::QueryParse(e) => Self::Internal(e.to_string()),
            Self::Engine(m) => Self::Engine(m.clone()),
            Self::Commit(m) => Self::Commit(m.clone()),
            Self::Replication(m) => Self::Replication(m.clone()),
            Self::ChecksumMismatch {
                file,
                expected,
                actual,
            } => Self::ChecksumMismatch {
                file: file.clone(),
                expected: *expected,
                actual: *actual,
            },
            Self::VersionNotAvailable { requested, active } => Self::VersionNotAvailable {
                requested: *requested,
                active: *active,
            },
            Self::VersionPruned { requested, oldest } => Self::VersionPruned {
                requested: *requested,
                oldest: *oldest,
            },
            Self::RoleMismatch { operation, role } => Self::RoleMismatch {
                operation: operation.clone(),
                role: role.clone(),
            },
            Self::IndexNotFound(m) => Self::IndexNotFound(m.clone()),
            Self::Timeout(m) => Self::Timeout(m.clone()),
            Self::Shutdown(m) => Self::Shutdown(m.clone()),
            Self::Remote { code, message } => Self::Remote {
                code: *code,
                message: message.clone(),
            },
            Self::Config(m) => Self::Config(m.clone()),
            Self::Internal(m) => Self::Internal(m.clone()),
        }
    }

    /// Errors that mean local state may be inconsistent with the primary.
    ///
    /// These are never patched over: the replica's next attempt requests a
    /// full copy instead of a delta.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::Engine(_))
    }

    /// Transient errors worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout(_) | Self::Replication(_) | Self::Remote { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_is_consistency_violation() {
        let err = Error::ChecksumMismatch {
            file: "seg_0000000001.sgm".into(),
            expected: 1,
            actual: 2,
        };
        assert!(err.is_consistency_violation());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("seg_0000000001.sgm"));
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(Error::timeout("read").is_retryable());
        assert!(Error::replication("connection reset").is_retryable());
        assert!(!Error::role_mismatch("addDocuments", "replica").is_retryable());
    }

    #[test]
    fn test_role_mismatch_message() {
        let err = Error::role_mismatch("writeNRTPoint", "replica");
        assert_eq!(
            err.to_string(),
            "Role mismatch: writeNRTPoint is not allowed on a replica node"
        );
    }

    #[test]
    fn test_shared_keeps_variant() {
        assert!(matches!(Error::timeout("sync").shared(), Error::Timeout(m) if m == "sync"));
        assert!(matches!(Error::shutdown("stopped").shared(), Error::Shutdown(_)));

        let mismatch = Error::ChecksumMismatch {
            file: "seg_0000000002.sgm".into(),
            expected: 7,
            actual: 9,
        };
        let copy = mismatch.shared();
        assert!(copy.is_consistency_violation());
        assert_eq!(copy.to_string(), mismatch.to_string());

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        match io.shared() {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("expected io error, got {:?}", other),
        }
    }
}
