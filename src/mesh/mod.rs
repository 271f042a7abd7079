//! Cluster membership and key ownership.
//!
//! Peers are placed on a consistent-hash ring; the [`RequestRouter`] sends
//! every key to the peer that owns it. Membership comes from a static host
//! list or from gossip discovery through [`PeerRegistry::update`].

pub mod discovery;
mod peer;
mod registry;
mod ring;
mod router;

pub use discovery::{Discovery, DiscoveryConfig, DiscoveryError};
pub use peer::{PeerClient, PeerConnector, PeerInfo, PeerResult, PeerTransport};
pub use registry::PeerRegistry;
pub use ring::{ring_position, HashRing, DEFAULT_VIRTUAL_NODES};
pub use router::RequestRouter;
