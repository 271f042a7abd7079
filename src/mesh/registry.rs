//! Reconciles the desired peer list with live connections.
//!
//! The registry's connection table and the hash ring are the same object: a
//! [`HashRing`] holds the `Arc<PeerInfo>` of every member. An update builds a
//! complete new ring off to the side and publishes it with a single pointer
//! swap, so readers see either the old membership or the new one, never a mix.

use arc_swap::ArcSwap;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::peer::{PeerConnector, PeerInfo};
use super::ring::{HashRing, DEFAULT_VIRTUAL_NODES};
use crate::error::RingLimitError;

/// Owns the connections to cluster members and the ring built over them.
pub struct PeerRegistry {
    /// Host string other peers use for this node
    local_host: Option<String>,
    connector: Arc<dyn PeerConnector>,
    virtual_nodes: usize,
    ring: ArcSwap<HashRing>,
    /// Serializes updates so each one reconciles against the latest ring
    updating: Mutex<()>,
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("local_host", &self.local_host)
            .field("virtual_nodes", &self.virtual_nodes)
            .field("peers", &self.ring.load().hosts())
            .finish()
    }
}

impl PeerRegistry {
    /// Create a registry with an empty ring.
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            local_host: None,
            connector,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            ring: ArcSwap::from_pointee(HashRing::empty()),
            updating: Mutex::new(()),
        }
    }

    /// Treat `host` as this node: it is never dialed and routes to the local cache.
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = Some(host.into());
        self
    }

    pub fn with_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = virtual_nodes.max(1);
        self
    }

    pub fn local_host(&self) -> Option<&str> {
        self.local_host.as_deref()
    }

    /// The current ring. Hold the returned snapshot for a whole operation.
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.load_full()
    }

    /// True iff the current ring has at least one peer.
    pub fn is_connected(&self) -> bool {
        !self.ring.load().is_empty()
    }

    /// Number of peers in the current ring.
    pub fn size(&self) -> usize {
        self.ring.load().size()
    }

    /// Replace the membership with `hosts`.
    ///
    /// Existing connections are reused, new hosts are dialed concurrently.
    /// Hosts that fail to connect are left out of the new ring and reported
    /// in the returned map; an empty map means every host is in the ring.
    /// Hosts missing from `hosts` are dropped from the ring; their
    /// connections close once no in-flight call still references them.
    pub async fn update(&self, hosts: &[String]) -> HashMap<String, RingLimitError> {
        let _updating = self.updating.lock().await;
        let current = self.ring.load_full();

        let mut seen = HashSet::new();
        let mut peers = Vec::with_capacity(hosts.len());
        let mut to_dial = Vec::new();

        for host in hosts {
            if !seen.insert(host.as_str()) {
                continue;
            }
            if self.local_host.as_deref() == Some(host.as_str()) {
                peers.push(Arc::new(PeerInfo::local(host.clone())));
                continue;
            }
            match current.get_peer(host).filter(|p| !p.is_local()) {
                Some(existing) => peers.push(existing.clone()),
                None => to_dial.push(host.clone()),
            }
        }

        let dialed = join_all(to_dial.into_iter().map(|host| async move {
            let result = self.connector.connect(&host).await;
            (host, result)
        }))
        .await;

        let mut errors = HashMap::new();
        for (host, result) in dialed {
            match result {
                Ok(client) => {
                    info!(host = %host, "Connected to peer");
                    peers.push(Arc::new(PeerInfo::remote(host, client)));
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Failed to connect to peer");
                    let err = match e {
                        e @ RingLimitError::PeerConnectionFailed { .. } => e,
                        other => RingLimitError::PeerConnectionFailed {
                            host: host.clone(),
                            reason: other.to_string(),
                        },
                    };
                    errors.insert(host, err);
                }
            }
        }

        let ring = HashRing::build(peers, self.virtual_nodes);
        for retired in current.peers().iter().filter(|p| ring.get_peer(p.host()).is_none()) {
            debug!(host = %retired.host(), "Peer removed from ring");
        }

        info!(
            peers = ring.size(),
            failed = errors.len(),
            hosts = ?ring.hosts(),
            "Published new hash ring"
        );
        self.ring.store(Arc::new(ring));

        errors
    }
}
