//! Consistent hash ring mapping keys to their owning peer.
//!
//! Each peer is placed on a 64-bit ring at several positions (virtual nodes).
//! A key belongs to the first virtual node at or after the key's own hash,
//! wrapping around to the first position. Adding or removing one of N peers
//! only moves the keys adjacent to that peer's virtual nodes, roughly 1/N of
//! the key space.
//!
//! Positions are derived from SHA-256 so every node computes the same ring
//! from the same peer list. A ring is immutable once built.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::peer::PeerInfo;
use crate::error::{RingLimitError, Result};

/// Default number of virtual nodes per peer.
pub const DEFAULT_VIRTUAL_NODES: usize = 512;

/// Position of `bytes` on the ring.
pub fn ring_position(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct VirtualNode {
    position: u64,
    /// Index into `HashRing::peers`, which is sorted by host
    peer: usize,
}

/// An immutable snapshot of peer ownership.
#[derive(Debug, Default)]
pub struct HashRing {
    vnodes: Vec<VirtualNode>,
    peers: Vec<Arc<PeerInfo>>,
}

impl HashRing {
    /// A ring with no peers; every lookup fails.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a ring over `peers` with `virtual_nodes` positions each.
    ///
    /// Peers are ordered by host and duplicate hosts are dropped, so the same
    /// set of hosts always yields the same ring. Virtual nodes that collide on
    /// a position are ordered by host as well.
    pub fn build(peers: impl IntoIterator<Item = Arc<PeerInfo>>, virtual_nodes: usize) -> Self {
        let mut peers: Vec<Arc<PeerInfo>> = peers.into_iter().collect();
        peers.sort_by(|a, b| a.host().cmp(b.host()));
        peers.dedup_by(|a, b| a.host() == b.host());

        let replicas = virtual_nodes.max(1);
        let mut vnodes = Vec::with_capacity(peers.len() * replicas);
        for (index, peer) in peers.iter().enumerate() {
            for replica in 0..replicas {
                let label = format!("{}#{}", peer.host(), replica);
                vnodes.push(VirtualNode {
                    position: ring_position(label.as_bytes()),
                    peer: index,
                });
            }
        }
        vnodes.sort_unstable();

        Self { vnodes, peers }
    }

    /// The peer that owns `key`.
    pub fn locate(&self, key: &[u8]) -> Result<&Arc<PeerInfo>> {
        self.locate_position(ring_position(key))
    }

    fn locate_position(&self, position: u64) -> Result<&Arc<PeerInfo>> {
        let index = self.vnodes.partition_point(|v| v.position < position);
        let vnode = self
            .vnodes
            .get(index)
            .or_else(|| self.vnodes.first())
            .ok_or(RingLimitError::RoutingUnavailable)?;
        Ok(&self.peers[vnode.peer])
    }

    /// Number of distinct peers.
    pub fn size(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn virtual_node_count(&self) -> usize {
        self.vnodes.len()
    }

    /// Peers sorted by host.
    pub fn peers(&self) -> &[Arc<PeerInfo>] {
        &self.peers
    }

    pub fn get_peer(&self, host: &str) -> Option<&Arc<PeerInfo>> {
        self.peers
            .binary_search_by(|p| p.host().cmp(host))
            .ok()
            .map(|index| &self.peers[index])
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.peers.iter().map(|p| p.host()).collect()
    }
}
