//! GitQuorum Configuration
//!
//! This module provides configuration structures for a GitQuorum node.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::state::NodeInfo;

/// Main GitQuorum configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitQuorumConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// Local storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Data directory for objects and refs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// A configured peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Every other node of the cluster. Fixed for the life of the process.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat probe timeout in milliseconds
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Deadline for collecting quorum acknowledgements
    #[serde(default = "default_replication_timeout_ms")]
    pub replication_timeout_ms: u64,

    /// How long a replica waits for its own ref locks before refusing
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Periodic anti-entropy interval
    #[serde(default = "default_anti_entropy_interval_ms")]
    pub anti_entropy_interval_ms: u64,

    /// TCP connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Enable LZ4 compression for stored objects
    #[serde(default = "default_true")]
    pub compression: bool,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP status API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_heartbeat_timeout_ms() -> u64 {
    1000
}

fn default_replication_timeout_ms() -> u64 {
    5000
}

fn default_lock_wait_ms() -> u64 {
    1000
}

fn default_anti_entropy_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/gitquorum")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { compression: true }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl GitQuorumConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: GitQuorumConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.cluster.peers {
            if peer.id == self.node.id {
                return Err(crate::Error::Config(format!(
                    "cluster.peers must not contain this node ({})",
                    peer.id
                )));
            }
            if peer.address.is_empty() {
                return Err(crate::Error::Config(format!("peer {} has no address", peer.id)));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(crate::Error::Config(format!("duplicate peer id {}", peer.id)));
            }
        }

        let cluster = &self.cluster;
        if cluster.heartbeat_interval_ms == 0
            || cluster.heartbeat_timeout_ms == 0
            || cluster.replication_timeout_ms == 0
            || cluster.anti_entropy_interval_ms == 0
            || cluster.connect_timeout_ms == 0
        {
            return Err(crate::Error::Config("cluster timeouts must be non-zero".into()));
        }

        if cluster.lock_wait_ms >= cluster.replication_timeout_ms {
            return Err(crate::Error::Config(
                "cluster.lock_wait_ms must be smaller than cluster.replication_timeout_ms".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Directory holding loose objects
    pub fn objects_dir(&self) -> PathBuf {
        self.node.data_dir.join("objects")
    }

    /// Path of the ref database
    pub fn refs_db_path(&self) -> PathBuf {
        self.node.data_dir.join("refs.db")
    }

    /// Configured peers as membership entries
    pub fn peer_nodes(&self) -> Vec<NodeInfo> {
        self.cluster
            .peers
            .iter()
            .map(|p| NodeInfo::new(p.id.clone(), p.address.clone()))
            .collect()
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    /// Configured cluster size, including this node
    pub fn cluster_size(&self) -> usize {
        self.cluster.peers.len() + 1
    }

    /// Calculate quorum size from the configured node count
    pub fn quorum_size(&self) -> usize {
        (self.cluster_size() / 2) + 1
    }
}
