//! Quota algorithms applied to a key's counter state.
//!
//! The cache never interprets counters itself. It hands the entry's
//! [`RateLimitState`] to a [`RateLimitAlgorithm`] while holding the entry
//! lock, so algorithms are plain synchronous functions over owned state.

use std::fmt::Debug;

use super::state::{Algorithm, LimitConfig, LimitStatus, RateLimitResponse, RateLimitState};

/// A decision function over counter state.
pub trait RateLimitAlgorithm: Send + Sync + Debug {
    /// Fresh state for a key first seen at `now_ms`.
    fn initial_state(&self, config: &LimitConfig, now_ms: i64) -> RateLimitState;

    /// Apply `hits` at `now_ms`, mutating `state` and returning the decision.
    ///
    /// `hits == 0` reports the current state without consuming quota. A
    /// request for more hits than remain is over limit and consumes nothing.
    fn apply(&self, state: &mut RateLimitState, hits: u64, now_ms: i64) -> RateLimitResponse;
}

/// Consume `hits` from `state.remaining` if they fit.
fn consume(state: &mut RateLimitState, hits: u64) -> LimitStatus {
    if hits == 0 {
        return if state.remaining == 0 {
            LimitStatus::OverLimit
        } else {
            LimitStatus::UnderLimit
        };
    }
    if hits > state.remaining {
        return LimitStatus::OverLimit;
    }
    state.remaining -= hits;
    LimitStatus::UnderLimit
}

/// Bucket of `limit` tokens refilled continuously over `duration`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucket;

impl TokenBucket {
    fn refill(state: &mut RateLimitState, now_ms: i64) {
        if state.remaining >= state.limit {
            // A full bucket does not bank refill time
            state.anchor_ms = state.anchor_ms.max(now_ms);
            return;
        }

        let elapsed = now_ms.saturating_sub(state.anchor_ms);
        if elapsed <= 0 {
            return;
        }

        let duration = state.duration_ms as u128;
        let tokens = u64::try_from(elapsed as u128 * state.limit as u128 / duration)
            .unwrap_or(u64::MAX);
        if tokens == 0 {
            return;
        }

        let refilled = state.remaining.saturating_add(tokens).min(state.limit);
        if refilled == state.limit {
            state.anchor_ms = now_ms;
        } else {
            // Advance only by the time that produced whole tokens, keeping the remainder
            let used_ms = (tokens as u128 * duration / state.limit as u128) as i64;
            state.anchor_ms += used_ms;
        }
        state.remaining = refilled;
    }

    fn reset_time(state: &RateLimitState) -> i64 {
        if state.limit == 0 || state.remaining >= state.limit {
            return state.anchor_ms;
        }
        let missing = (state.limit - state.remaining) as u128;
        let duration = state.duration_ms as u128;
        let limit = state.limit as u128;
        // At most one full duration since `missing <= limit`
        let wait_ms = (missing * duration).div_ceil(limit) as i64;
        state.anchor_ms.saturating_add(wait_ms)
    }
}

impl RateLimitAlgorithm for TokenBucket {
    fn initial_state(&self, config: &LimitConfig, now_ms: i64) -> RateLimitState {
        RateLimitState {
            algorithm: Algorithm::TokenBucket,
            limit: config.limit,
            duration_ms: config.duration_ms,
            remaining: config.limit,
            anchor_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    fn apply(&self, state: &mut RateLimitState, hits: u64, now_ms: i64) -> RateLimitResponse {
        Self::refill(state, now_ms);
        let status = consume(state, hits);
        state.updated_at_ms = state.updated_at_ms.max(now_ms);

        RateLimitResponse {
            status,
            limit: state.limit,
            remaining: state.remaining,
            reset_time_ms: Self::reset_time(state),
        }
    }
}

/// Counter that resets at every multiple of `duration` since the epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWindow;

impl FixedWindow {
    /// Floor `now_ms` to the start of its window.
    pub fn window_start(now_ms: i64, duration_ms: i64) -> i64 {
        now_ms.saturating_sub(now_ms.rem_euclid(duration_ms))
    }
}

impl RateLimitAlgorithm for FixedWindow {
    fn initial_state(&self, config: &LimitConfig, now_ms: i64) -> RateLimitState {
        RateLimitState {
            algorithm: Algorithm::FixedWindow,
            limit: config.limit,
            duration_ms: config.duration_ms,
            remaining: config.limit,
            anchor_ms: Self::window_start(now_ms, config.duration_ms),
            updated_at_ms: now_ms,
        }
    }

    fn apply(&self, state: &mut RateLimitState, hits: u64, now_ms: i64) -> RateLimitResponse {
        let window_start = Self::window_start(now_ms, state.duration_ms);
        if window_start > state.anchor_ms {
            state.remaining = state.limit;
            state.anchor_ms = window_start;
        }

        let status = consume(state, hits);
        state.updated_at_ms = state.updated_at_ms.max(now_ms);

        RateLimitResponse {
            status,
            limit: state.limit,
            remaining: state.remaining,
            reset_time_ms: state.anchor_ms.saturating_add(state.duration_ms),
        }
    }
}

/// Dispatches to the built-in algorithm named by the config or state.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinAlgorithms;

impl RateLimitAlgorithm for BuiltinAlgorithms {
    fn initial_state(&self, config: &LimitConfig, now_ms: i64) -> RateLimitState {
        match config.algorithm {
            Algorithm::TokenBucket => TokenBucket.initial_state(config, now_ms),
            Algorithm::FixedWindow => FixedWindow.initial_state(config, now_ms),
        }
    }

    fn apply(&self, state: &mut RateLimitState, hits: u64, now_ms: i64) -> RateLimitResponse {
        match state.algorithm {
            Algorithm::TokenBucket => TokenBucket.apply(state, hits, now_ms),
            Algorithm::FixedWindow => FixedWindow.apply(state, hits, now_ms),
        }
    }
}
