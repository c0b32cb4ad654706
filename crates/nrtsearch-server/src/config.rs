//! Server configuration

use anyhow::Context;
use nrtsearch_core::config::{NodeConfig, Role, VersionWaitPolicy};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 15480;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address
    pub addr: SocketAddr,
    /// Hosted index node
    pub node: NodeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_HTTP_PORT)),
            node: NodeConfig::default(),
        }
    }
}

/// Configuration file structure
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    addr: Option<SocketAddr>,
    #[serde(default)]
    node: Option<NodeConfig>,
}

impl Config {
    /// Load configuration
    /// Priority: Environment variables > config file > defaults
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.node.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse TOML configuration; missing sections take their defaults
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        let defaults = Self::default();
        Ok(Self {
            addr: file.addr.unwrap_or(defaults.addr),
            node: file.node.unwrap_or(defaults.node),
        })
    }

    /// Apply `NRTSEARCH_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(addr) = lookup("NRTSEARCH_ADDR") {
            self.addr = addr.parse().context("Invalid NRTSEARCH_ADDR")?;
        }
        if let Some(name) = lookup("NRTSEARCH_NODE_NAME") {
            self.node.node_name = name;
        }
        if let Some(index) = lookup("NRTSEARCH_INDEX") {
            self.node.index_name = index;
        }
        if let Some(role) = lookup("NRTSEARCH_ROLE") {
            self.node.role = match role.to_lowercase().as_str() {
                "primary" => Role::Primary,
                "replica" => Role::Replica,
                other => anyhow::bail!("Invalid NRTSEARCH_ROLE: {}", other),
            };
        }
        if let Some(data_dir) = lookup("NRTSEARCH_DATA_DIR") {
            self.node.data_dir = PathBuf::from(data_dir);
        }
        if let Some(addr) = lookup("NRTSEARCH_REPLICATION_ADDR") {
            self.node.replication.bind_addr =
                addr.parse().context("Invalid NRTSEARCH_REPLICATION_ADDR")?;
        }
        if let Some(addr) = lookup("NRTSEARCH_PRIMARY_ADDR") {
            self.node.replication.primary_addr =
                Some(addr.parse().context("Invalid NRTSEARCH_PRIMARY_ADDR")?);
        }
        if let Some(ms) = lookup("NRTSEARCH_REFRESH_INTERVAL_MS") {
            let ms: u64 = ms.parse().context("Invalid NRTSEARCH_REFRESH_INTERVAL_MS")?;
            self.node.replication.refresh_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = lookup("NRTSEARCH_POLL_INTERVAL_MS") {
            let ms: u64 = ms.parse().context("Invalid NRTSEARCH_POLL_INTERVAL_MS")?;
            self.node.replication.poll_interval = Duration::from_millis(ms);
        }
        if let Some(policy) = lookup("NRTSEARCH_WAIT_POLICY") {
            self.node.search.wait_policy = match policy.to_lowercase().as_str() {
                "fail" => VersionWaitPolicy::Fail,
                "wait" => VersionWaitPolicy::default(),
                other => anyhow::bail!("Invalid NRTSEARCH_WAIT_POLICY: {}", other),
            };
        }
        if let Some(ms) = lookup("NRTSEARCH_WAIT_TIMEOUT_MS") {
            let ms: u64 = ms.parse().context("Invalid NRTSEARCH_WAIT_TIMEOUT_MS")?;
            if let VersionWaitPolicy::Wait { timeout } = &mut self.node.search.wait_policy {
                *timeout = Duration::from_millis(ms);
            }
        }
        Ok(())
    }
}
