//! Configuration management for ringlimit.
//!
//! Values are layered: built-in defaults, then an optional YAML/TOML file,
//! then `RINGLIMIT__`-prefixed environment variables
//! (`RINGLIMIT__CACHE__CACHE_SIZE=100000`). CLI flags are applied on top by
//! the binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{RingLimitError, Result};
use crate::mesh::{DiscoveryConfig, DEFAULT_VIRTUAL_NODES};
use crate::ratelimit::{LimitConfig, DEFAULT_CACHE_SIZE, MAX_DURATION_MS};

const ENV_PREFIX: &str = "RINGLIMIT";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the ringlimit service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RingLimitConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub peers: PeersConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub gossip: GossipConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Host string other peers use to reach this node; `grpc_addr` if unset
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Deadline applied to every inbound request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            advertise_addr: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// The host string this node is known by on the ring.
    pub fn advertise_host(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.grpc_addr.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_request_timeout_ms() -> u64 {
    500
}

/// Local rate limit cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of keys held in memory
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
        }
    }
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

/// Static membership and ring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeersConfig {
    /// Initial peer list; this node is always added
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            virtual_nodes: default_virtual_nodes(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PeersConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_virtual_nodes() -> usize {
    DEFAULT_VIRTUAL_NODES
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

/// Limit applied to descriptors that do not carry one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    #[serde(default = "default_duration_ms")]
    pub default_duration_ms: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_duration_ms: default_duration_ms(),
        }
    }
}

impl LimitsConfig {
    pub fn limit_config(&self) -> LimitConfig {
        LimitConfig {
            limit: self.default_limit,
            duration_ms: self.default_duration_ms,
            algorithm: Default::default(),
        }
    }
}

fn default_limit() -> u64 {
    1000
}

fn default_duration_ms() -> i64 {
    1000
}

/// Gossip discovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Gossip UDP address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Gossip addresses of nodes to join through
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Random when unset
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// How often live membership is pushed into the ring
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_gossip_addr(),
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            node_id: None,
            gossip_interval_ms: default_gossip_interval_ms(),
            sync_interval_ms: default_sync_interval_ms(),
        }
    }
}

impl GossipConfig {
    /// Discovery settings publishing `grpc_addr` as this node's address.
    pub fn discovery_config(&self, grpc_addr: String) -> DiscoveryConfig {
        let defaults = DiscoveryConfig::default();
        DiscoveryConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.listen_addr,
            grpc_addr,
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            sync_interval: Duration::from_millis(self.sync_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "ringlimit".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_sync_interval_ms() -> u64 {
    1000
}

impl RingLimitConfig {
    /// Load defaults, the optional file at `path`, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(
            path,
            config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR),
        )
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let env = env
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("peers.hosts")
            .with_list_parse_key("gossip.seed_nodes");

        let config: Self = builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RingLimitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, ignoring the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let no_env = config::Environment::default().source(Some(Default::default()));
        Self::load_with_env(Some(path.as_ref()), no_env)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| RingLimitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.cache_size == 0 {
            return Err(RingLimitError::Config("cache.cache_size must be positive".into()));
        }
        if self.peers.virtual_nodes == 0 {
            return Err(RingLimitError::Config("peers.virtual_nodes must be positive".into()));
        }
        if !(1..=MAX_DURATION_MS).contains(&self.limits.default_duration_ms) {
            return Err(RingLimitError::Config(format!(
                "limits.default_duration_ms must be between 1 and {MAX_DURATION_MS}"
            )));
        }
        if self.server.request_timeout_ms == 0 {
            return Err(RingLimitError::Config(
                "server.request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Configured peers plus this node, without duplicates.
    pub fn initial_hosts(&self) -> Vec<String> {
        let mut hosts = self.peers.hosts.clone();
        hosts.push(self.server.advertise_host());
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .source(Some(vars))
    }

    #[test]
    fn test_defaults() {
        let config = RingLimitConfig::default();
        assert_eq!(config.server.grpc_addr, "127.0.0.1:8081".parse().unwrap());
        assert_eq!(config.server.advertise_host(), "127.0.0.1:8081");
        assert_eq!(config.cache.cache_size, 50_000);
        assert_eq!(config.peers.virtual_nodes, 512);
        assert_eq!(config.limits.limit_config().limit, 1000);
        assert!(!config.gossip.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  grpc_addr: "0.0.0.0:9000"
  advertise_addr: "node-a:9000"
cache:
  cache_size: 1000
peers:
  hosts:
    - "node-b:9000"
    - "node-c:9000"
"#;
        let config = RingLimitConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.advertise_host(), "node-a:9000");
        assert_eq!(config.server.request_timeout_ms, 500);
        assert_eq!(config.cache.cache_size, 1000);
        assert_eq!(
            config.initial_hosts(),
            vec!["node-a:9000", "node-b:9000", "node-c:9000"]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RingLimitConfig::from_yaml("cache:\n  cache_size: 0\n").is_err());
        assert!(RingLimitConfig::from_yaml("limits:\n  default_duration_ms: 0\n").is_err());
        assert!(RingLimitConfig::from_yaml(&format!(
            "limits:\n  default_duration_ms: {}\n",
            i64::MAX
        ))
        .is_err());
        assert!(RingLimitConfig::from_yaml("server: [not, a, map]\n").is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile_path("env_overrides.yaml");
        writeln!(file.1, "cache:\n  cache_size: 10\npeers:\n  virtual_nodes: 64").unwrap();

        let config = RingLimitConfig::load_with_env(
            Some(&file.0),
            env(&[
                ("RINGLIMIT__CACHE__CACHE_SIZE", "20"),
                ("RINGLIMIT__PEERS__HOSTS", "a:1,b:1"),
                ("RINGLIMIT__GOSSIP__ENABLED", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(config.cache.cache_size, 20);
        assert_eq!(config.peers.virtual_nodes, 64);
        assert_eq!(config.peers.hosts, vec!["a:1", "b:1"]);
        assert!(config.gossip.enabled);

        std::fs::remove_file(&file.0).unwrap();
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = RingLimitConfig::from_file("/nonexistent/ringlimit.yaml");
        assert!(matches!(result, Err(RingLimitError::Config(_))));
    }

    #[test]
    fn test_discovery_config() {
        let gossip = GossipConfig {
            node_id: Some("node-1".to_string()),
            seed_nodes: vec!["10.0.0.2:7946".to_string()],
            ..Default::default()
        };
        let discovery = gossip.discovery_config("10.0.0.1:8081".to_string());
        assert_eq!(discovery.node_id, "node-1");
        assert_eq!(discovery.grpc_addr, "10.0.0.1:8081");
        assert_eq!(discovery.sync_interval, Duration::from_secs(1));
    }

    fn tempfile_path(name: &str) -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("ringlimit-{}-{name}", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
