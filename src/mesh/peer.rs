//! Cluster members and the transport seam used to reach them.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::context::RequestContext;
use crate::error::Result;
use crate::ratelimit::{RateLimitRequest, RateLimitResponse};

/// Outcome of one forwarded entry; a failed entry carries the peer's message.
pub type PeerResult = std::result::Result<RateLimitResponse, String>;

/// Request/response channel to a remote peer.
#[async_trait]
pub trait PeerClient: Send + Sync + fmt::Debug {
    /// Ask the peer to apply requests for keys it owns, one result per request.
    async fn get_peer_rate_limits(
        &self,
        ctx: &RequestContext,
        requests: Vec<RateLimitRequest>,
    ) -> Result<Vec<PeerResult>>;
}

/// Dials peers during a membership update.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Arc<dyn PeerClient>>;
}

/// How a peer is reached.
#[derive(Debug, Clone)]
pub enum PeerTransport {
    /// This node; requests go straight to the local cache
    Local,
    /// Another node reached over its client
    Remote(Arc<dyn PeerClient>),
}

/// One cluster member.
///
/// The transport handle is owned by the `PeerInfo`. Routing decisions hold an
/// `Arc<PeerInfo>` for the duration of a call, so a member dropped from the
/// registry keeps its connection until the last in-flight call releases it.
pub struct PeerInfo {
    host: String,
    transport: PeerTransport,
    healthy: AtomicBool,
}

impl PeerInfo {
    pub fn local(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            transport: PeerTransport::Local,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn remote(host: impl Into<String>, client: Arc<dyn PeerClient>) -> Self {
        Self {
            host: host.into(),
            transport: PeerTransport::Remote(client),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn transport(&self) -> &PeerTransport {
        &self.transport
    }

    pub fn is_local(&self) -> bool {
        matches!(self.transport, PeerTransport::Local)
    }

    /// Whether the last call to this peer succeeded.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerInfo")
            .field("host", &self.host)
            .field("local", &self.is_local())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl Drop for PeerInfo {
    fn drop(&mut self) {
        if !self.is_local() {
            debug!(host = %self.host, "Peer connection retired");
        }
    }
}
