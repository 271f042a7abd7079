//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::rate_limit_service_server::RateLimitServiceServer;
use super::service::RateLimitServiceImpl;
use crate::error::{RingLimitError, Result};
use crate::mesh::RequestRouter;

/// gRPC server for the rate limit service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Arc<RequestRouter>,
    request_timeout: Option<Duration>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, router: Arc<RequestRouter>) -> Self {
        Self {
            addr,
            router,
            request_timeout: None,
        }
    }

    /// Bound the time spent on any one request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    fn service(&self) -> RateLimitServiceServer<RateLimitServiceImpl> {
        let service = RateLimitServiceImpl::new(self.router.clone());
        let service = match self.request_timeout {
            Some(timeout) => service.with_request_timeout(timeout),
            None => service,
        };
        RateLimitServiceServer::new(service)
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the gRPC server, shutting down when `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(addr = %self.addr, "Starting gRPC server for RateLimitService");

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                RingLimitError::Grpc(e)
            })
    }

    /// Serve on an already bound listener, shutting down when `signal` resolves.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Starting gRPC server for RateLimitService");

        Server::builder()
            .add_service(self.service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                RingLimitError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::grpc::proto::{
        rate_limit_descriptor::Entry, rate_limit_service_client::RateLimitServiceClient,
        HealthCheckRequest, RateLimitDescriptor as ProtoDescriptor, ShouldRateLimitRequest,
    };
    use crate::grpc::GrpcConnector;
    use crate::mesh::PeerRegistry;
    use crate::ratelimit::{LimitConfig, RateLimitCache, RateLimitDescriptor};
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    struct Node {
        host: String,
        router: Arc<RequestRouter>,
        server: JoinHandle<Result<()>>,
    }

    async fn start_node(shutdown: &CancellationToken) -> Node {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();

        let registry = PeerRegistry::new(Arc::new(GrpcConnector::default()))
            .with_local_host(host.clone());
        let router = Arc::new(RequestRouter::new(
            Arc::new(registry),
            Arc::new(RateLimitCache::new(1000)),
        ));

        let server = GrpcServer::new(listener.local_addr().unwrap(), router.clone());
        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            server
                .serve_with_listener(listener, async move { signal.cancelled().await })
                .await
        });

        Node { host, router, server }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_nodes_share_key_ownership() {
        let shutdown = CancellationToken::new();
        let a = start_node(&shutdown).await;
        let b = start_node(&shutdown).await;

        let hosts = vec![a.host.clone(), b.host.clone()];
        assert!(a.router.registry().update(&hosts).await.is_empty());
        assert!(b.router.registry().update(&hosts).await.is_empty());

        let ctx = || RequestContext::with_timeout(Duration::from_secs(5));
        let limit = LimitConfig::new(10, Duration::from_secs(60));
        let shared = RateLimitDescriptor::new([("user", "shared")]).with_limit(limit);

        // The same key through either node hits the same counter
        let first = a.router.rate_limit(&ctx(), "e2e", &shared).await.unwrap();
        let second = b.router.rate_limit(&ctx(), "e2e", &shared).await.unwrap();
        assert_eq!(first.remaining, 9);
        assert_eq!(second.remaining, 8);

        for i in 0..49 {
            let descriptor =
                RateLimitDescriptor::new([("user", format!("user-{i}"))]).with_limit(limit);
            let via = if i % 2 == 0 { &a } else { &b };
            via.router.rate_limit(&ctx(), "e2e", &descriptor).await.unwrap();
        }

        let on_a = a.router.cache().len();
        let on_b = b.router.cache().len();
        assert_eq!(on_a + on_b, 50);
        assert!(on_a > 0 && on_b > 0, "a={on_a} b={on_b}");

        shutdown.cancel();
        drop((a.router, b.router));
        a.server.await.unwrap().unwrap();
        b.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_facing_rpc() {
        let shutdown = CancellationToken::new();
        let node = start_node(&shutdown).await;
        node.router.registry().update(&[node.host.clone()]).await;

        let mut client = RateLimitServiceClient::connect(format!("http://{}", node.host))
            .await
            .unwrap();

        let health = client
            .health_check(HealthCheckRequest {})
            .await
            .unwrap()
            .into_inner();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.peer_count, 1);

        let request = ShouldRateLimitRequest {
            domain: "e2e".to_string(),
            descriptors: vec![ProtoDescriptor {
                entries: vec![Entry {
                    key: "ip".to_string(),
                    value: "10.0.0.1".to_string(),
                }],
                hits: 3,
                limit: Some(LimitConfig::new(5, Duration::from_secs(60)).into()),
            }],
        };
        let response = client.should_rate_limit(request).await.unwrap().into_inner();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].remaining, 2);
        assert_eq!(node.router.cache().len(), 1);

        shutdown.cancel();
        drop(client);
        node.server.await.unwrap().unwrap();
    }
}
