//! Counter state and the request/response types exchanged with the cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::descriptor::RateLimitKey;
use crate::error::{RingLimitError, Result};

/// Longest window or refill period a limit may use: one leap year.
pub const MAX_DURATION_MS: i64 = 366 * 24 * 60 * 60 * 1000;

/// How far a forwarded request's creation time may stray from the local clock.
pub const MAX_CLOCK_SKEW_MS: u64 = 10 * 60 * 1000;

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Quota algorithm applied to a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Continuously refilling bucket of `limit` tokens per `duration`
    #[default]
    TokenBucket,
    /// Counter that resets at every `duration` boundary
    FixedWindow,
}

impl Algorithm {
    /// Convert from the proto enum value.
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            0 => Some(Algorithm::TokenBucket),
            1 => Some(Algorithm::FixedWindow),
            _ => None,
        }
    }

    /// Convert to the proto enum value.
    pub fn to_proto(&self) -> i32 {
        match self {
            Algorithm::TokenBucket => 0,
            Algorithm::FixedWindow => 1,
        }
    }
}

/// The configured limit for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Hits allowed per duration
    pub limit: u64,
    /// Length of the window or refill period in milliseconds
    pub duration_ms: i64,
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl LimitConfig {
    pub fn new(limit: u64, duration: Duration) -> Self {
        Self {
            limit,
            duration_ms: duration.as_millis() as i64,
            algorithm: Algorithm::default(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration_ms <= 0 {
            return Err(RingLimitError::InvalidRequest(format!(
                "duration must be positive, got {}ms",
                self.duration_ms
            )));
        }
        if self.duration_ms > MAX_DURATION_MS {
            return Err(RingLimitError::InvalidRequest(format!(
                "duration must be at most {MAX_DURATION_MS}ms, got {}ms",
                self.duration_ms
            )));
        }
        Ok(())
    }
}

/// Mutable counter state for one key. Owned by its cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub algorithm: Algorithm,
    pub limit: u64,
    pub duration_ms: i64,
    pub remaining: u64,
    /// Window start for fixed windows, last refill point for token buckets
    pub anchor_ms: i64,
    pub updated_at_ms: i64,
}

impl RateLimitState {
    /// Whether this state was built for `config`.
    pub fn matches(&self, config: &LimitConfig) -> bool {
        self.algorithm == config.algorithm
            && self.limit == config.limit
            && self.duration_ms == config.duration_ms
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitStatus {
    UnderLimit,
    OverLimit,
}

impl LimitStatus {
    pub fn to_proto(&self) -> i32 {
        match self {
            LimitStatus::UnderLimit => 0,
            LimitStatus::OverLimit => 1,
        }
    }

    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            0 => Some(LimitStatus::UnderLimit),
            1 => Some(LimitStatus::OverLimit),
            _ => None,
        }
    }
}

/// A check-and-increment request against one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRequest {
    pub key: RateLimitKey,
    pub hits: u64,
    pub config: LimitConfig,
    /// Epoch milliseconds the request was created at; "now" when absent
    pub created_at_ms: Option<i64>,
}

impl RateLimitRequest {
    pub fn new(key: impl Into<RateLimitKey>, config: LimitConfig) -> Self {
        Self {
            key: key.into(),
            hits: 1,
            config,
            created_at_ms: None,
        }
    }

    pub fn with_hits(mut self, hits: u64) -> Self {
        self.hits = hits;
        self
    }

    pub fn created_at(mut self, created_at_ms: i64) -> Self {
        self.created_at_ms = Some(created_at_ms);
        self
    }

    pub fn timestamp(&self) -> i64 {
        self.created_at_ms.unwrap_or_else(now_ms)
    }
}

/// Per-call request metadata that does not affect the decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestState {
    /// The request arrived from another peer rather than a client
    pub forwarded: bool,
}

/// Result of a check: permit/deny plus remaining quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResponse {
    pub status: LimitStatus,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the quota is fully restored
    pub reset_time_ms: i64,
}

impl RateLimitResponse {
    pub fn is_allowed(&self) -> bool {
        self.status == LimitStatus::UnderLimit
    }
}
