//! Gossip-based peer discovery using Chitchat.
//!
//! Each node publishes the address its gRPC endpoint is reachable on. A sync
//! task turns the live membership into a host list and feeds it to the
//! [`PeerRegistry`] whenever it changes.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::PeerRegistry;

/// Node state key holding the advertised gRPC address.
pub const GRPC_ADDR_KEY: &str = "grpc_addr";

/// Errors that can occur while running discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to start gossip: {0}")]
    Start(String),
    #[error("Failed to stop gossip: {0}")]
    Shutdown(String),
}

/// Gossip settings for one node.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// Address the gossip socket binds to.
    pub listen_addr: SocketAddr,
    /// Gossip address other nodes use for this node.
    pub advertise_addr: SocketAddr,
    /// Host string other peers dial for rate limit traffic.
    pub grpc_addr: String,
    /// Gossip addresses used to join the cluster.
    pub seed_nodes: Vec<String>,
    /// Nodes only gossip with nodes sharing this id.
    pub cluster_id: String,
    pub gossip_interval: Duration,
    /// How often the live set is pushed into the registry.
    pub sync_interval: Duration,
    /// Grace period before a dead node's state is deleted.
    pub dead_node_grace_period: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            grpc_addr: "127.0.0.1:8081".to_string(),
            seed_nodes: Vec::new(),
            cluster_id: "ringlimit".to_string(),
            gossip_interval: Duration::from_millis(100),
            sync_interval: Duration::from_secs(1),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// A running gossip node.
pub struct Discovery {
    node_id: String,
    sync_interval: Duration,
    handle: ChitchatHandle,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("node_id", &self.node_id)
            .field("sync_interval", &self.sync_interval)
            .finish()
    }
}

impl Discovery {
    /// Join the gossip cluster and publish this node's gRPC address.
    pub async fn start(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            grpc_addr = %config.grpc_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting gossip discovery"
        );

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId {
                node_id: config.node_id.clone(),
                generation_id: chrono::Utc::now().timestamp_millis() as u64,
                gossip_advertise_addr: config.advertise_addr,
            },
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_key_values = vec![(GRPC_ADDR_KEY.to_string(), config.grpc_addr.clone())];
        let handle = spawn_chitchat(chitchat_config, initial_key_values, &UdpTransport)
            .await
            .map_err(|e| DiscoveryError::Start(e.to_string()))?;

        Ok(Self {
            node_id: config.node_id,
            sync_interval: config.sync_interval,
            handle,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// gRPC addresses advertised by every live node, this one included.
    pub async fn peer_hosts(&self) -> Vec<String> {
        let chitchat = self.handle.chitchat();
        let chitchat = chitchat.lock().await;

        let hosts: BTreeSet<String> = chitchat
            .live_nodes()
            .filter_map(|id| chitchat.node_state(id))
            .filter_map(|state| state.get(GRPC_ADDR_KEY))
            .map(str::to_string)
            .collect();
        hosts.into_iter().collect()
    }

    /// Push membership changes into `registry` until `shutdown` fires.
    pub fn spawn_sync(
        self: &Arc<Self>,
        registry: Arc<PeerRegistry>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(discovery.sync_interval);
            let mut applied: Vec<String> = Vec::new();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let hosts = discovery.peer_hosts().await;
                if hosts == applied {
                    continue;
                }

                debug!(hosts = ?hosts, "Live membership changed");
                let errors = registry.update(&hosts).await;
                for (host, error) in &errors {
                    warn!(host = %host, error = %error, "Discovered peer unreachable");
                }
                // Retry failed hosts on the next tick
                if errors.is_empty() {
                    applied = hosts;
                }
            }

            debug!("Discovery sync stopped");
        })
    }

    /// Leave the gossip cluster.
    pub async fn shutdown(self) -> Result<(), DiscoveryError> {
        info!(node_id = %self.node_id, "Stopping gossip discovery");
        self.handle
            .shutdown()
            .await
            .map_err(|e| DiscoveryError::Shutdown(format!("{e:?}")))
    }
}
