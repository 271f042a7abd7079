//! Conversions between wire messages and domain types.

use super::proto;
use crate::error::{RingLimitError, Result};
use crate::mesh::PeerResult;
use crate::ratelimit::{
    now_ms, Algorithm, LimitConfig, LimitStatus, RateLimitDescriptor, RateLimitRequest,
    RateLimitResponse, MAX_CLOCK_SKEW_MS,
};

impl From<LimitConfig> for proto::RateLimit {
    fn from(config: LimitConfig) -> Self {
        Self {
            limit: config.limit,
            duration_ms: config.duration_ms,
            algorithm: config.algorithm.to_proto(),
        }
    }
}

impl TryFrom<proto::RateLimit> for LimitConfig {
    type Error = RingLimitError;

    fn try_from(limit: proto::RateLimit) -> Result<Self> {
        let algorithm = Algorithm::from_proto(limit.algorithm).ok_or_else(|| {
            RingLimitError::InvalidRequest(format!("unknown algorithm {}", limit.algorithm))
        })?;
        let config = LimitConfig {
            limit: limit.limit,
            duration_ms: limit.duration_ms,
            algorithm,
        };
        config.validate()?;
        Ok(config)
    }
}

impl TryFrom<proto::RateLimitDescriptor> for RateLimitDescriptor {
    type Error = RingLimitError;

    fn try_from(descriptor: proto::RateLimitDescriptor) -> Result<Self> {
        let limit = descriptor.limit.map(LimitConfig::try_from).transpose()?;
        Ok(Self {
            entries: descriptor
                .entries
                .into_iter()
                .map(|e| (e.key, e.value))
                .collect(),
            hits: descriptor.hits,
            limit,
        })
    }
}

impl From<&RateLimitRequest> for proto::KeyRequestEntry {
    fn from(request: &RateLimitRequest) -> Self {
        Self {
            key: request.key.as_bytes().to_vec(),
            hits: request.hits,
            rate_limit: Some(request.config.into()),
            created_at_ms: request.created_at_ms.unwrap_or(0),
        }
    }
}

impl TryFrom<proto::KeyRequestEntry> for RateLimitRequest {
    type Error = RingLimitError;

    fn try_from(entry: proto::KeyRequestEntry) -> Result<Self> {
        if entry.key.is_empty() {
            return Err(RingLimitError::InvalidRequest("key must not be empty".into()));
        }
        let config = entry
            .rate_limit
            .ok_or_else(|| RingLimitError::InvalidRequest("rate_limit is required".into()))
            .and_then(LimitConfig::try_from)?;

        let request = RateLimitRequest::new(entry.key, config).with_hits(entry.hits);
        Ok(match entry.created_at_ms {
            0 => request,
            ts => {
                let skew = ts.abs_diff(now_ms());
                if skew > MAX_CLOCK_SKEW_MS {
                    return Err(RingLimitError::InvalidRequest(format!(
                        "created_at_ms {ts} is {skew}ms away from the local clock"
                    )));
                }
                request.created_at(ts)
            }
        })
    }
}

impl From<RateLimitResponse> for proto::RateLimitResult {
    fn from(response: RateLimitResponse) -> Self {
        Self {
            status: response.status.to_proto(),
            limit: response.limit,
            remaining: response.remaining,
            reset_time_ms: response.reset_time_ms,
            error: String::new(),
        }
    }
}

/// A result slot for an entry whose check failed.
pub(crate) fn error_result(message: impl Into<String>) -> proto::RateLimitResult {
    proto::RateLimitResult {
        error: message.into(),
        ..Default::default()
    }
}

/// Decode a peer's answer for one entry.
pub(crate) fn peer_result(result: proto::RateLimitResult) -> PeerResult {
    if !result.error.is_empty() {
        return Err(result.error);
    }
    let status = LimitStatus::from_proto(result.status)
        .ok_or_else(|| format!("unknown status {}", result.status))?;
    Ok(RateLimitResponse {
        status,
        limit: result.limit,
        remaining: result.remaining,
        reset_time_ms: result.reset_time_ms,
    })
}
