//! Configuration management for Cumulus storage nodes
//!
//! Supports loading from TOML files and environment variables. The loaded
//! `NodeConfig` is built once at startup and handed to each component.

use cumulus_core::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_VALUE_FILE_SIZE, MIN_SEGMENTS, NUM_SEGMENTS};
use cumulus_network::{ClientConfig, NetworkConfig, ServerConfig, TcpConfig};
use cumulus_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity
    #[serde(default)]
    pub node: NodeIdentity,

    /// Cluster membership and erasure coding parameters
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSettings,

    /// Resilient channel timeouts
    #[serde(default)]
    pub network: NetworkSettings,

    /// Write coordinator
    #[serde(default)]
    pub archive: ArchiveSettings,

    /// Read coordinator
    #[serde(default)]
    pub retrieve: RetrieveSettings,

    /// Handoff forwarding
    #[serde(default)]
    pub handoff: HandoffSettings,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsSettings,

    /// Logging
    #[serde(default)]
    pub log: LogSettings,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cluster = &self.cluster;
        if cluster.min_segments == 0 || cluster.min_segments >= cluster.num_segments {
            return Err(ConfigError::ValidationError(format!(
                "min_segments ({}) must be between 1 and num_segments ({})",
                cluster.min_segments, cluster.num_segments
            )));
        }
        if cluster.nodes.len() != cluster.num_segments {
            return Err(ConfigError::ValidationError(format!(
                "cluster lists {} nodes but num_segments is {}",
                cluster.nodes.len(),
                cluster.num_segments
            )));
        }
        if cluster.min_connected < cluster.min_segments || cluster.min_connected > cluster.num_segments {
            return Err(ConfigError::ValidationError(format!(
                "min_connected ({}) must be between min_segments and num_segments",
                cluster.min_connected
            )));
        }

        let mut names = HashSet::new();
        for node in &cluster.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "node {} is listed twice",
                    node.name
                )));
            }
        }
        if self.segment_num().is_none() {
            return Err(ConfigError::ValidationError(format!(
                "node {} is not in the cluster node list",
                self.node.name
            )));
        }

        if self.archive.block_size == 0 || self.archive.block_size % cluster.min_segments != 0 {
            return Err(ConfigError::ValidationError(format!(
                "block_size ({}) must be a positive multiple of min_segments ({})",
                self.archive.block_size, cluster.min_segments
            )));
        }
        if self.storage.max_value_file_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_value_file_size cannot be 0".to_string(),
            ));
        }
        if self.network.ack_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "ack_timeout_ms cannot be 0".to_string(),
            ));
        }
        if self.retrieve.idle_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "retrieve idle_timeout_ms cannot be 0".to_string(),
            ));
        }
        if !matches!(self.log.format.as_str(), "text" | "json") {
            return Err(ConfigError::ValidationError(format!(
                "log format must be \"text\" or \"json\", not {:?}",
                self.log.format
            )));
        }

        // Validate storage path is writable
        if !self.storage.data_dir.exists() {
            std::fs::create_dir_all(&self.storage.data_dir).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Cannot create data directory {:?}: {}",
                    self.storage.data_dir, e
                ))
            })?;
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, node_name: Option<String>, data_dir: Option<PathBuf>) -> Self {
        if let Some(name) = node_name {
            self.node.name = name;
        }
        if let Some(dir) = data_dir {
            self.storage.data_dir = dir;
        }
        self
    }

    /// Apply `CUMULUS_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(name) = std::env::var("CUMULUS_NODE_NAME") {
            self.node.name = name;
        }
        if let Ok(dir) = std::env::var("CUMULUS_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(size) = std::env::var("CUMULUS_MAX_VALUE_FILE_SIZE") {
            if let Ok(bytes) = size.parse::<u64>() {
                self.storage.max_value_file_size = bytes;
            }
        }
        if let Ok(level) = std::env::var("CUMULUS_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(port) = std::env::var("CUMULUS_METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }
        self
    }

    /// 1-based position of this node in the cluster list
    pub fn segment_num(&self) -> Option<u8> {
        self.cluster
            .nodes
            .iter()
            .position(|n| n.name == self.node.name)
            .map(|i| (i + 1) as u8)
    }

    /// This node's own entry in the cluster list
    pub fn local_node(&self) -> Option<&ClusterNode> {
        self.cluster.nodes.iter().find(|n| n.name == self.node.name)
    }

    pub fn to_storage_config(&self) -> StorageConfig {
        StorageConfig::new(self.storage.data_dir.clone())
            .with_max_value_file_size(self.storage.max_value_file_size)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            client: ClientConfig {
                ack_timeout: Duration::from_millis(self.network.ack_timeout_ms),
                handshake_retry_interval: Duration::from_millis(self.network.handshake_retry_ms),
                max_idle: Duration::from_millis(self.network.max_idle_ms),
            },
            server: ServerConfig {
                dedup_window: self.network.dedup_window,
                ..ServerConfig::default()
            },
            tcp: TcpConfig {
                connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
                max_frame_length: self.network.max_frame_mb * 1024 * 1024,
            },
        }
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Name of this node; must appear in the cluster node list
    #[serde(default = "default_node_name")]
    pub name: String,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            name: default_node_name(),
        }
    }
}

fn default_node_name() -> String {
    "node-01".to_string()
}

/// One member of the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub name: String,
    /// Data writer service
    pub writer_address: String,
    /// Data reader service
    pub reader_address: String,
    /// Where this node listens for replies
    pub reply_address: String,
}

/// Cluster membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Shares needed to reconstruct (K)
    #[serde(default = "default_min_segments")]
    pub min_segments: usize,

    /// Shares produced, one per node (N)
    #[serde(default = "default_num_segments")]
    pub num_segments: usize,

    /// Fewer connected writers than this rejects new archives
    #[serde(default = "default_min_segments")]
    pub min_connected: usize,

    /// Cluster nodes in segment-number order
    #[serde(default = "default_nodes")]
    pub nodes: Vec<ClusterNode>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            min_segments: MIN_SEGMENTS,
            num_segments: NUM_SEGMENTS,
            min_connected: MIN_SEGMENTS,
            nodes: default_nodes(),
        }
    }
}

fn default_min_segments() -> usize {
    MIN_SEGMENTS
}

fn default_num_segments() -> usize {
    NUM_SEGMENTS
}

/// Ten local nodes on consecutive ports
fn default_nodes() -> Vec<ClusterNode> {
    (1..=NUM_SEGMENTS)
        .map(|i| ClusterNode {
            name: format!("node-{:02}", i),
            writer_address: format!("127.0.0.1:{}", 8100 + i),
            reader_address: format!("127.0.0.1:{}", 8200 + i),
            reply_address: format!("127.0.0.1:{}", 8300 + i),
        })
        .collect()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory holding the catalog and the value-file repository
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Value files roll over once the next write would exceed this size
    #[serde(default = "default_max_value_file_size")]
    pub max_value_file_size: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_value_file_size: DEFAULT_MAX_VALUE_FILE_SIZE,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_value_file_size() -> u64 {
    DEFAULT_MAX_VALUE_FILE_SIZE
}

/// Resilient channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_handshake_retry")]
    pub handshake_retry_ms: u64,

    #[serde(default = "default_max_idle")]
    pub max_idle_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Recent requests remembered per server for duplicate suppression
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,

    /// Maximum frame size in MB
    #[serde(default = "default_max_frame")]
    pub max_frame_mb: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            handshake_retry_ms: default_handshake_retry(),
            max_idle_ms: default_max_idle(),
            connect_timeout_ms: default_connect_timeout(),
            dedup_window: default_dedup_window(),
            max_frame_mb: default_max_frame(),
        }
    }
}

fn default_ack_timeout() -> u64 {
    600_000
}

fn default_handshake_retry() -> u64 {
    60_000
}

fn default_max_idle() -> u64 {
    1_800_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_dedup_window() -> usize {
    10_000
}

fn default_max_frame() -> usize {
    64
}

/// Write coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSettings {
    /// Unencoded block size; must be a multiple of min_segments
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Deadline for every node to answer one archive call
    #[serde(default = "default_archive_timeout")]
    pub timeout_ms: u64,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout_ms: default_archive_timeout(),
        }
    }
}

impl ArchiveSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_archive_timeout() -> u64 {
    60_000
}

/// Read coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveSettings {
    /// Deadline for a quorum of replies to one sequence request
    #[serde(default = "default_retrieve_timeout")]
    pub timeout_ms: u64,

    /// Data readers drop a retrieve not advanced within this long
    #[serde(default = "default_retrieve_idle_timeout")]
    pub idle_timeout_ms: u64,
}

impl Default for RetrieveSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_retrieve_timeout(),
            idle_timeout_ms: default_retrieve_idle_timeout(),
        }
    }
}

impl RetrieveSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

fn default_retrieve_timeout() -> u64 {
    30_000
}

fn default_retrieve_idle_timeout() -> u64 {
    30 * 60 * 1000
}

/// Handoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffSettings {
    /// Run the discovery/forwarding loop in the background
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pause between discovery rounds
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,

    /// Handoffs remembered as already forwarded
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Deadline for each request made while forwarding
    #[serde(default = "default_handoff_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            polling_interval_ms: default_polling_interval(),
            cache_size: default_cache_size(),
            request_timeout_ms: default_handoff_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_polling_interval() -> u64 {
    60_000
}

fn default_cache_size() -> usize {
    10_000
}

fn default_handoff_timeout() -> u64 {
    60_000
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Enable Prometheus metrics endpoint
    #[serde(default)]
    pub enabled: bool,

    /// Metrics HTTP server port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config(dir: &TempDir) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.cluster.min_segments, 8);
        assert_eq!(config.cluster.num_segments, 10);
        assert_eq!(config.cluster.nodes.len(), 10);
        assert_eq!(config.archive.block_size, 32 * 1024);
        assert_eq!(config.network.ack_timeout_ms, 600_000);
        assert_eq!(config.segment_num(), Some(1));
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [node]
            name = "node-03"

            [storage]
            max_value_file_size = 1048576

            [network]
            ack_timeout_ms = 1000

            [archive]
            block_size = 4096

            [log]
            format = "json"
        "#;

        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.node.name, "node-03");
        assert_eq!(config.segment_num(), Some(3));
        assert_eq!(config.storage.max_value_file_size, 1024 * 1024);
        assert_eq!(config.network_config().client.ack_timeout, Duration::from_secs(1));
        assert_eq!(config.network.handshake_retry_ms, 60_000);
        assert_eq!(config.archive.block_size, 4096);
        assert_eq!(config.retrieve.idle_timeout(), Duration::from_secs(30 * 60));
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_config_validation() {
        let temp_dir = TempDir::new().unwrap();
        assert!(valid_config(&temp_dir).validate().is_ok());

        let mut config = valid_config(&temp_dir);
        config.archive.block_size = 1001;
        assert!(config.validate().is_err());

        let mut config = valid_config(&temp_dir);
        config.node.name = "stranger".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config(&temp_dir);
        config.cluster.nodes.pop();
        assert!(config.validate().is_err());

        let mut config = valid_config(&temp_dir);
        config.cluster.nodes[1].name = "node-01".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config(&temp_dir);
        config.cluster.min_connected = 5;
        assert!(config.validate().is_err());

        let mut config = valid_config(&temp_dir);
        config.retrieve.idle_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_overrides() {
        let config = NodeConfig::default()
            .with_overrides(Some("node-07".to_string()), Some(PathBuf::from("/custom/path")));

        assert_eq!(config.node.name, "node-07");
        assert_eq!(config.segment_num(), Some(7));
        assert_eq!(config.storage.data_dir, PathBuf::from("/custom/path"));
        assert_eq!(config.to_storage_config().repository_path(), PathBuf::from("/custom/path/repository"));
    }
}
