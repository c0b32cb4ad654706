//! Node and replication configuration
//!
//! The configuration object is constructed once at startup and handed to each
//! component explicitly; nothing here is global.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default replication port
pub const DEFAULT_REPLICATION_PORT: u16 = 15475;

/// Default transfer chunk size (1MB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Node role for an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts writes and originates NRT points
    Primary,
    /// Read-only mirror of the primary's NRT points
    Replica,
}

impl Default for Role {
    fn default() -> Self {
        Self::Primary
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Replica => f.write_str("replica"),
        }
    }
}

/// What a search pinned to a not-yet-active version does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VersionWaitPolicy {
    /// Block until the version is activated, up to `timeout`
    Wait {
        /// Upper bound on the wait
        #[serde(with = "serde_millis")]
        timeout: Duration,
    },
    /// Fail immediately with `VersionNotAvailable`
    Fail,
}

impl Default for VersionWaitPolicy {
    fn default() -> Self {
        Self::Wait {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Address the replication endpoint binds to
    pub bind_addr: SocketAddr,

    /// Primary replication address (replicas only)
    pub primary_addr: Option<SocketAddr>,

    /// Connection timeout
    #[serde(with = "serde_millis")]
    pub connect_timeout: Duration,

    /// Timeout for a single frame read
    #[serde(with = "serde_millis")]
    pub read_timeout: Duration,

    /// Upper bound on one complete sync attempt
    #[serde(with = "serde_millis")]
    pub transfer_timeout: Duration,

    /// How often an ACTIVE replica checks for newer points
    #[serde(with = "serde_millis")]
    pub poll_interval: Duration,

    /// First retry delay after a failed sync
    #[serde(with = "serde_millis")]
    pub initial_backoff: Duration,

    /// Retry delay ceiling
    #[serde(with = "serde_millis")]
    pub max_backoff: Duration,

    /// Segment transfer chunk size in bytes
    pub chunk_size: usize,

    /// Number of NRT points the primary retains for delta transfers
    pub retained_points: usize,

    /// Background refresh interval on the primary (disabled when unset)
    #[serde(with = "optional_millis")]
    pub refresh_interval: Option<Duration>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_REPLICATION_PORT)),
            primary_addr: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retained_points: 8,
            refresh_interval: None,
        }
    }
}

/// Versioned search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Behaviour for searches pinned ahead of the active version
    pub wait_policy: VersionWaitPolicy,
    /// Number of recently activated searchers kept for pinned reads
    pub retained_searchers: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            wait_policy: VersionWaitPolicy::default(),
            retained_searchers: 8,
        }
    }
}

/// Segment engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Live segment count above which a commit merges everything into one
    pub max_segments: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_segments: 16 }
    }
}

/// Complete configuration of one index node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name, unique in the cluster
    pub node_name: String,
    /// Index hosted by this node
    pub index_name: String,
    /// Role of this node for the index
    pub role: Role,
    /// Root directory for segments, manifests and staging
    pub data_dir: PathBuf,
    /// Advertised search endpoint (informational)
    pub search_endpoint: Option<String>,
    /// Replication settings
    pub replication: ReplicationConfig,
    /// Search settings
    pub search: SearchConfig,
    /// Engine settings
    pub engine: EngineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            index_name: "default".to_string(),
            role: Role::Primary,
            data_dir: PathBuf::from("./data"),
            search_endpoint: None,
            replication: ReplicationConfig::default(),
            search: SearchConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a primary configuration
    pub fn primary(
        node_name: impl Into<String>,
        index_name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        bind_addr: SocketAddr,
    ) -> Self {
        let mut config = Self {
            node_name: node_name.into(),
            index_name: index_name.into(),
            role: Role::Primary,
            data_dir: data_dir.into(),
            ..Default::default()
        };
        config.replication.bind_addr = bind_addr;
        config
    }

    /// Create a replica configuration
    pub fn replica(
        node_name: impl Into<String>,
        index_name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        primary_addr: SocketAddr,
    ) -> Self {
        let mut config = Self {
            node_name: node_name.into(),
            index_name: index_name.into(),
            role: Role::Replica,
            data_dir: data_dir.into(),
            ..Default::default()
        };
        config.replication.primary_addr = Some(primary_addr);
        config
    }

    /// Set the version wait policy
    pub fn with_wait_policy(mut self, policy: VersionWaitPolicy) -> Self {
        self.search.wait_policy = policy;
        self
    }

    /// Enable background refresh on the primary
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.replication.refresh_interval = Some(interval);
        self
    }

    /// Set the number of retained NRT points
    pub fn with_retained_points(mut self, retained: usize) -> Self {
        self.replication.retained_points = retained;
        self
    }

    /// Set the replica poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.replication.poll_interval = interval;
        self
    }

    /// Set the merge threshold
    pub fn with_max_segments(mut self, max_segments: usize) -> Self {
        self.engine.max_segments = max_segments;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::config("node_name must not be empty"));
        }
        if self.index_name.trim().is_empty() {
            return Err(Error::config("index_name must not be empty"));
        }
        if self.role == Role::Replica && self.replication.primary_addr.is_none() {
            return Err(Error::config("replica requires replication.primary_addr"));
        }
        if self.replication.chunk_size == 0 {
            return Err(Error::config("chunk_size must be at least 1"));
        }
        if self.replication.retained_points == 0 {
            return Err(Error::config("retained_points must be at least 1"));
        }
        if self.search.retained_searchers == 0 {
            return Err(Error::config("retained_searchers must be at least 1"));
        }
        if self.engine.max_segments == 0 {
            return Err(Error::config("max_segments must be at least 1"));
        }
        if self.replication.initial_backoff > self.replication.max_backoff {
            return Err(Error::config("initial_backoff exceeds max_backoff"));
        }
        Ok(())
    }
}

/// `Option<Duration>` as optional milliseconds
mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.role, Role::Primary);
        assert_eq!(config.replication.bind_addr.port(), DEFAULT_REPLICATION_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_primary_config() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let config = NodeConfig::primary("primary", "test_index", "/tmp/p", addr);
        assert_eq!(config.role, Role::Primary);
        assert_eq!(config.replication.bind_addr, addr);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replica_config() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let config = NodeConfig::replica("replica", "test_index", "/tmp/r", addr);
        assert_eq!(config.role, Role::Replica);
        assert_eq!(config.replication.primary_addr, Some(addr));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replica_without_primary() {
        let mut config = NodeConfig::default();
        config.role = Role::Replica;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backoff_bounds() {
        let mut config = NodeConfig::default();
        config.replication.initial_backoff = Duration::from_secs(60);
        config.replication.max_backoff = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wait_policy_json() {
        let policy: VersionWaitPolicy =
            serde_json::from_str(r#"{"mode":"wait","timeout":250}"#).unwrap();
        assert_eq!(
            policy,
            VersionWaitPolicy::Wait {
                timeout: Duration::from_millis(250)
            }
        );

        let policy: VersionWaitPolicy = serde_json::from_str(r#"{"mode":"fail"}"#).unwrap();
        assert_eq!(policy, VersionWaitPolicy::Fail);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"node_name":"r1","role":"replica","replication":{"primary_addr":"10.0.0.1:15475","refresh_interval":500}}"#,
        )
        .unwrap();
        assert_eq!(config.role, Role::Replica);
        assert_eq!(config.index_name, "default");
        assert_eq!(
            config.replication.refresh_interval,
            Some(Duration::from_millis(500))
        );
        assert_eq!(config.replication.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.validate().is_ok());
    }
}
