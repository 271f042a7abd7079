//! Ringlimit - Distributed Rate Limiting Service
//!
//! Every node keeps rate limit counters for the keys it owns on a
//! consistent-hash ring and forwards checks for other keys to their owner.
//! Counters live in a bounded in-memory cache with per-key serialization and
//! optional hooks for loading and flushing state.

pub mod config;
pub mod context;
pub mod error;
pub mod grpc;
pub mod mesh;
pub mod ratelimit;
