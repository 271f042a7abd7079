//! Rate limiting logic and state management.

mod algorithm;
mod cache;
mod descriptor;
mod state;
mod store;

pub use algorithm::{BuiltinAlgorithms, FixedWindow, RateLimitAlgorithm, TokenBucket};
pub use cache::{RateLimitCache, DEFAULT_CACHE_SIZE};
pub use descriptor::{KeyCodec, RateLimitDescriptor, RateLimitKey, KEY_SEPARATOR};
pub use state::{
    now_ms, Algorithm, LimitConfig, LimitStatus, RateLimitRequest, RateLimitResponse,
    RateLimitState, RequestState, MAX_CLOCK_SKEW_MS, MAX_DURATION_MS,
};
pub use store::{Loader, MemoryStore, Storer};
