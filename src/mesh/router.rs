//! Routes each rate limit check to the peer that owns its key.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

use super::peer::PeerTransport;
use super::registry::PeerRegistry;
use crate::context::RequestContext;
use crate::error::{RingLimitError, Result};
use crate::ratelimit::{
    now_ms, KeyCodec, LimitConfig, RateLimitCache, RateLimitDescriptor, RateLimitRequest,
    RateLimitResponse, RequestState,
};

/// Limit applied when no specific limit is given.
const DEFAULT_LIMIT: u64 = 1000;
/// Duration applied when no specific limit is given.
const DEFAULT_DURATION: Duration = Duration::from_secs(1);

/// Front door for rate limit checks on this node.
///
/// A descriptor is encoded into its key, the key is located on the current
/// ring, and the check runs either in the local cache or on the owning peer.
/// No retries happen here; errors go back to the caller as-is.
#[derive(Debug)]
pub struct RequestRouter {
    registry: Arc<PeerRegistry>,
    cache: Arc<RateLimitCache>,
    default_limit: LimitConfig,
}

impl RequestRouter {
    pub fn new(registry: Arc<PeerRegistry>, cache: Arc<RateLimitCache>) -> Self {
        Self {
            registry,
            cache,
            default_limit: LimitConfig::new(DEFAULT_LIMIT, DEFAULT_DURATION),
        }
    }

    /// Limit used for descriptors that carry none of their own.
    pub fn with_default_limit(mut self, limit: LimitConfig) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<RateLimitCache> {
        &self.cache
    }

    pub fn default_limit(&self) -> LimitConfig {
        self.default_limit
    }

    /// Check `descriptor` within `domain`.
    pub async fn rate_limit(
        &self,
        ctx: &RequestContext,
        domain: &str,
        descriptor: &RateLimitDescriptor,
    ) -> Result<RateLimitResponse> {
        if domain.is_empty() {
            return Err(RingLimitError::InvalidRequest("domain must not be empty".into()));
        }
        if descriptor.entries.is_empty() {
            return Err(RingLimitError::InvalidRequest(
                "descriptor must have at least one entry".into(),
            ));
        }

        let key = KeyCodec::encode(domain, &descriptor.entries);
        let config = descriptor.limit.unwrap_or(self.default_limit);
        let request = RateLimitRequest::new(key, config)
            .with_hits(descriptor.hits)
            .created_at(now_ms());

        self.route(ctx, request).await
    }

    /// Send an already-keyed request to its owner.
    #[instrument(skip(self, ctx, request), fields(key = %request.key))]
    pub async fn route(
        &self,
        ctx: &RequestContext,
        request: RateLimitRequest,
    ) -> Result<RateLimitResponse> {
        ctx.check()?;

        // One snapshot per call; the peer Arc keeps its connection alive
        // even if the ring is replaced before the hop completes.
        let ring = self.registry.ring();
        let peer = ring.locate(request.key.as_bytes())?.clone();
        drop(ring);

        let client = match peer.transport() {
            PeerTransport::Local => {
                trace!(host = %peer.host(), "Key owned locally");
                return self
                    .cache
                    .get_rate_limit(ctx, &request, RequestState::default())
                    .await;
            }
            PeerTransport::Remote(client) => client.clone(),
        };

        debug!(host = %peer.host(), "Forwarding to owning peer");
        let result = client.get_peer_rate_limits(ctx, vec![request]).await;
        peer.set_healthy(result.is_ok());

        let mut results = result.map_err(|e| {
            warn!(host = %peer.host(), error = %e, "Peer request failed");
            e
        })?;

        match results.pop() {
            Some(Ok(response)) if results.is_empty() => Ok(response),
            Some(Err(message)) if results.is_empty() => Err(RingLimitError::Remote {
                host: peer.host().to_string(),
                status: tonic::Status::internal(message),
            }),
            _ => Err(RingLimitError::Remote {
                host: peer.host().to_string(),
                status: tonic::Status::internal("peer returned an unexpected number of results"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::peer::{PeerClient, PeerConnector, PeerResult};
    use crate::ratelimit::LimitStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Peer that answers from its own cache, like a real node would.
    #[derive(Debug)]
    struct CachePeer {
        cache: RateLimitCache,
        seen: Mutex<Vec<RateLimitRequest>>,
    }

    #[async_trait]
    impl PeerClient for CachePeer {
        async fn get_peer_rate_limits(
            &self,
            ctx: &RequestContext,
            requests: Vec<RateLimitRequest>,
        ) -> Result<Vec<PeerResult>> {
            let mut results = Vec::with_capacity(requests.len());
            for request in &requests {
                let state = RequestState { forwarded: true };
                results.push(
                    self.cache
                        .get_rate_limit(ctx, request, state)
                        .await
                        .map_err(|e| e.to_string()),
                );
            }
            self.seen.lock().extend(requests);
            Ok(results)
        }
    }

    #[derive(Debug)]
    struct FailingPeer;

    #[async_trait]
    impl PeerClient for FailingPeer {
        async fn get_peer_rate_limits(
            &self,
            _ctx: &RequestContext,
            _requests: Vec<RateLimitRequest>,
        ) -> Result<Vec<PeerResult>> {
            Err(RingLimitError::Remote {
                host: "remote:1".to_string(),
                status: tonic::Status::unavailable("connection reset"),
            })
        }
    }

    struct StaticConnector(Arc<dyn PeerClient>);

    #[async_trait]
    impl PeerConnector for StaticConnector {
        async fn connect(&self, _host: &str) -> Result<Arc<dyn PeerClient>> {
            Ok(self.0.clone())
        }
    }

    fn descriptor(value: &str) -> RateLimitDescriptor {
        RateLimitDescriptor::new([("api_key", value)])
            .with_limit(LimitConfig::new(10, Duration::from_secs(60)))
    }

    async fn router_with(hosts: &[&str], remote: Arc<dyn PeerClient>) -> RequestRouter {
        let registry = PeerRegistry::new(Arc::new(StaticConnector(remote)))
            .with_local_host("local:1")
            .with_virtual_nodes(64);
        let hosts: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        assert!(registry.update(&hosts).await.is_empty());
        RequestRouter::new(Arc::new(registry), Arc::new(RateLimitCache::new(1000)))
    }

    #[tokio::test]
    async fn test_empty_ring_is_unavailable() {
        let router = router_with(&[], Arc::new(FailingPeer)).await;
        let result = router
            .rate_limit(&RequestContext::background(), "domain", &descriptor("a"))
            .await;
        assert!(matches!(result, Err(RingLimitError::RoutingUnavailable)));
    }

    #[tokio::test]
    async fn test_local_owner_uses_local_cache() {
        let router = router_with(&["local:1"], Arc::new(FailingPeer)).await;
        let ctx = RequestContext::background();

        let first = router.rate_limit(&ctx, "domain", &descriptor("a")).await.unwrap();
        let second = router.rate_limit(&ctx, "domain", &descriptor("a")).await.unwrap();

        assert_eq!(first.remaining, 9);
        assert_eq!(second.remaining, 8);
        assert_eq!(router.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_owner_is_forwarded() {
        let peer = Arc::new(CachePeer {
            cache: RateLimitCache::new(1000),
            seen: Mutex::new(Vec::new()),
        });
        let router = router_with(&["remote:1"], peer.clone()).await;
        let ctx = RequestContext::background();

        let response = router
            .rate_limit(&ctx, "domain", &descriptor("a").with_hits(4))
            .await
            .unwrap();

        assert_eq!(response.status, LimitStatus::UnderLimit);
        assert_eq!(response.remaining, 6);
        assert!(router.cache().is_empty());
        assert_eq!(peer.cache.len(), 1);

        let seen = peer.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, KeyCodec::encode("domain", &[("api_key", "a")]));
        assert_eq!(seen[0].hits, 4);
        assert!(seen[0].created_at_ms.is_some());
    }

    #[tokio::test]
    async fn test_keys_split_between_local_and_remote() {
        let peer = Arc::new(CachePeer {
            cache: RateLimitCache::new(1000),
            seen: Mutex::new(Vec::new()),
        });
        let router = router_with(&["local:1", "remote:1"], peer.clone()).await;
        let ctx = RequestContext::background();

        for i in 0..100 {
            router
                .rate_limit(&ctx, "domain", &descriptor(&format!("user-{i}")))
                .await
                .unwrap();
        }

        let local = router.cache().len();
        let remote = peer.cache.len();
        assert_eq!(local + remote, 100);
        assert!(local > 0 && remote > 0, "local={local} remote={remote}");
    }

    #[tokio::test]
    async fn test_remote_error_is_passed_through() {
        let router = router_with(&["remote:1"], Arc::new(FailingPeer)).await;
        let result = router
            .rate_limit(&RequestContext::background(), "domain", &descriptor("a"))
            .await;

        match result {
            Err(RingLimitError::Remote { status, .. }) => {
                assert_eq!(status.code(), tonic::Code::Unavailable);
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        let ring = router.registry().ring();
        assert!(!ring.get_peer("remote:1").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_invalid_descriptors_rejected() {
        let router = router_with(&["local:1"], Arc::new(FailingPeer)).await;
        let ctx = RequestContext::background();

        let empty = RateLimitDescriptor::new(Vec::<(String, String)>::new());
        assert!(matches!(
            router.rate_limit(&ctx, "domain", &empty).await,
            Err(RingLimitError::InvalidRequest(_))
        ));
        assert!(matches!(
            router.rate_limit(&ctx, "", &descriptor("a")).await,
            Err(RingLimitError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_default_limit_applies_without_override() {
        let router = router_with(&["local:1"], Arc::new(FailingPeer))
            .await
            .with_default_limit(LimitConfig::new(2, Duration::from_secs(60)));
        let ctx = RequestContext::background();
        let plain = RateLimitDescriptor::new([("ip", "10.0.0.1")]);

        assert!(router.rate_limit(&ctx, "domain", &plain).await.unwrap().is_allowed());
        assert!(router.rate_limit(&ctx, "domain", &plain).await.unwrap().is_allowed());
        assert!(!router.rate_limit(&ctx, "domain", &plain).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_expired_context_fails_before_routing() {
        let router = router_with(&["local:1"], Arc::new(FailingPeer)).await;
        let ctx = RequestContext::with_timeout(Duration::ZERO);
        let result = router.rate_limit(&ctx, "domain", &descriptor("a")).await;
        assert!(matches!(result, Err(RingLimitError::DeadlineExceeded)));
        assert!(router.cache().is_empty());
    }
}
