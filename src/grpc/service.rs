//! Rate limit service implementation.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::convert::error_result;
use super::proto::{
    self, rate_limit_service_server::RateLimitService, GetPeerRateLimitsRequest,
    GetPeerRateLimitsResponse, HealthCheckRequest, HealthCheckResponse, ShouldRateLimitRequest,
    ShouldRateLimitResponse,
};
use crate::context::RequestContext;
use crate::error::RingLimitError;
use crate::mesh::RequestRouter;
use crate::ratelimit::{LimitStatus, RateLimitDescriptor, RateLimitRequest, RequestState};

/// Default deadline for a request that does not bring a tighter one.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Implementation of the `RateLimitService` gRPC interface.
pub struct RateLimitServiceImpl {
    router: Arc<RequestRouter>,
    /// Upper bound on the time spent on any one request
    request_timeout: Duration,
}

impl RateLimitServiceImpl {
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self {
            router,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Deadline for `request`: the configured timeout or the caller's, if shorter.
    fn context<T>(&self, request: &Request<T>) -> RequestContext {
        let timeout = request
            .metadata()
            .get("grpc-timeout")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map_or(self.request_timeout, |t| t.min(self.request_timeout));
        RequestContext::with_timeout(timeout)
    }
}

/// Parse a `grpc-timeout` header value such as `250m` or `1S`.
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: u64 = amount.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

#[tonic::async_trait]
impl RateLimitService for RateLimitServiceImpl {
    /// Check every descriptor against the node that owns its key.
    #[instrument(
        skip(self, request),
        fields(
            domain = %request.get_ref().domain,
            descriptor_count = request.get_ref().descriptors.len()
        )
    )]
    async fn should_rate_limit(
        &self,
        request: Request<ShouldRateLimitRequest>,
    ) -> Result<Response<ShouldRateLimitResponse>, Status> {
        let ctx = self.context(&request);
        let req = request.into_inner();

        if req.domain.is_empty() {
            warn!("Received rate limit request with empty domain");
            return Err(Status::invalid_argument("domain is required"));
        }
        if req.descriptors.is_empty() {
            warn!("Received rate limit request with no descriptors");
            return Err(Status::invalid_argument("at least one descriptor is required"));
        }

        let descriptors = req
            .descriptors
            .into_iter()
            .map(RateLimitDescriptor::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let outcomes = join_all(
            descriptors
                .iter()
                .map(|d| self.router.rate_limit(&ctx, &req.domain, d)),
        )
        .await;

        if outcomes
            .iter()
            .any(|o| matches!(o, Err(RingLimitError::RoutingUnavailable)))
        {
            warn!(domain = %req.domain, "No peers available");
            return Err(RingLimitError::RoutingUnavailable.into());
        }

        let mut overall = LimitStatus::UnderLimit;
        let results = outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Ok(response) => {
                    if !response.is_allowed() {
                        overall = LimitStatus::OverLimit;
                    }
                    response.into()
                }
                Err(e) => {
                    warn!(domain = %req.domain, error = %e, "Descriptor check failed");
                    error_result(e.to_string())
                }
            })
            .collect();

        debug!(domain = %req.domain, overall = ?overall, "Rate limit decision made");

        Ok(Response::new(ShouldRateLimitResponse {
            overall_status: overall.to_proto(),
            results,
        }))
    }

    /// Apply entries this node owns, reporting failures per entry.
    #[instrument(skip(self, request), fields(entries = request.get_ref().entries.len()))]
    async fn get_peer_rate_limits(
        &self,
        request: Request<GetPeerRateLimitsRequest>,
    ) -> Result<Response<GetPeerRateLimitsResponse>, Status> {
        let ctx = self.context(&request);
        let cache = self.router.cache();
        let forwarded = RequestState { forwarded: true };

        let checks = request.into_inner().entries.into_iter().map(|entry| {
            let ctx = &ctx;
            async move {
                let request = RateLimitRequest::try_from(entry)?;
                cache.get_rate_limit(ctx, &request, forwarded).await
            }
        });

        let results = join_all(checks)
            .await
            .into_iter()
            .map(|outcome| match outcome {
                Ok(response) => response.into(),
                Err(e) => {
                    debug!(error = %e, "Peer entry failed");
                    error_result(e.to_string())
                }
            })
            .collect();

        Ok(Response::new(GetPeerRateLimitsResponse { results }))
    }

    /// Report whether this node can route requests.
    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let ring = self.router.registry().ring();
        let healthy = !ring.is_empty();

        let response = HealthCheckResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            message: if healthy {
                String::new()
            } else {
                "no peers in hash ring".to_string()
            },
            peer_count: ring.size() as u32,
            cache_entries: self.router.cache().len() as u64,
        };

        if !healthy {
            info!("Health check reported unhealthy");
        }
        Ok(Response::new(response))
    }
}
