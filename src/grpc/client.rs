//! Peer transport over gRPC.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, trace};

use super::convert::peer_result;
use super::proto::{self, rate_limit_service_client::RateLimitServiceClient};
use crate::context::RequestContext;
use crate::error::{RingLimitError, Result};
use crate::mesh::{PeerClient, PeerConnector, PeerResult};
use crate::ratelimit::RateLimitRequest;

/// Default time allowed for dialing a peer.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Dials peers with a tonic channel.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    connect_timeout: Duration,
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl GrpcConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn endpoint(&self, host: &str) -> Result<Endpoint> {
        let uri = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };

        Endpoint::from_shared(uri)
            .map(|e| e.connect_timeout(self.connect_timeout))
            .map_err(|e| RingLimitError::PeerConnectionFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl PeerConnector for GrpcConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn PeerClient>> {
        debug!(host = %host, "Dialing peer");
        let channel = self
            .endpoint(host)?
            .connect()
            .await
            .map_err(|e| RingLimitError::PeerConnectionFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Arc::new(GrpcPeerClient::new(host, channel)))
    }
}

/// Client half of a connection to one peer.
#[derive(Clone)]
pub struct GrpcPeerClient {
    host: String,
    client: RateLimitServiceClient<Channel>,
}

impl std::fmt::Debug for GrpcPeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcPeerClient").field("host", &self.host).finish()
    }
}

impl GrpcPeerClient {
    pub fn new(host: impl Into<String>, channel: Channel) -> Self {
        Self {
            host: host.into(),
            client: RateLimitServiceClient::new(channel),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl PeerClient for GrpcPeerClient {
    async fn get_peer_rate_limits(
        &self,
        ctx: &RequestContext,
        requests: Vec<RateLimitRequest>,
    ) -> Result<Vec<PeerResult>> {
        let expected = requests.len();
        let mut request = tonic::Request::new(proto::GetPeerRateLimitsRequest {
            entries: requests.iter().map(proto::KeyRequestEntry::from).collect(),
        });
        // The owning peer gets whatever budget this caller has left
        if let Some(remaining) = ctx.remaining() {
            request.set_timeout(remaining);
        }

        trace!(host = %self.host, entries = expected, "Sending peer rate limits");
        let mut client = self.client.clone();
        let response = ctx
            .run(async move {
                client
                    .get_peer_rate_limits(request)
                    .await
                    .map_err(|status| RingLimitError::Remote {
                        host: self.host.clone(),
                        status,
                    })
            })
            .await?;

        let results = response.into_inner().results;
        if results.len() != expected {
            return Err(RingLimitError::Remote {
                host: self.host.clone(),
                status: tonic::Status::internal(format!(
                    "expected {expected} results, got {}",
                    results.len()
                )),
            });
        }

        Ok(results.into_iter().map(peer_result).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_adds_scheme() {
        let connector = GrpcConnector::default();
        let endpoint = connector.endpoint("127.0.0.1:8081").unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().host(), Some("127.0.0.1"));
        assert_eq!(endpoint.uri().port_u16(), Some(8081));

        let endpoint = connector.endpoint("https://peer.internal:443").unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("https"));
    }

    #[test]
    fn test_invalid_host_is_connection_failure() {
        let connector = GrpcConnector::default();
        assert!(matches!(
            connector.endpoint("not a host"),
            Err(RingLimitError::PeerConnectionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_to_connect() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = GrpcConnector::new(Duration::from_millis(200));
        let result = connector.connect(&addr.to_string()).await;
        match result {
            Err(RingLimitError::PeerConnectionFailed { host, .. }) => {
                assert_eq!(host, addr.to_string())
            }
            other => panic!("expected connection failure, got {other:?}"),
        }
    }
}
