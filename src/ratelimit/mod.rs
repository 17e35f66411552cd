//! Per-device token-bucket rate limiting
//!
//! Two interchangeable backends share the same bucket semantics: an
//! in-process limiter map for single-instance deployments and a Redis-backed
//! limiter for fleets. The distributed backend fails open — an unreachable
//! store must never take down the voice path.

mod distributed;
mod local;

pub use distributed::{DistributedRateLimiter, RateDecision};
pub use local::LocalRateLimiter;

use serde::Deserialize;

/// Which backend holds the bucket state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitMode {
    /// In-memory buckets, one process
    #[default]
    Local,
    /// Redis-coordinated buckets across instances
    Distributed,
}

/// A configured rate limiter, either backend
pub enum RateLimiter {
    /// In-process buckets
    Local(LocalRateLimiter),
    /// Redis-coordinated buckets
    Distributed(DistributedRateLimiter),
}

impl RateLimiter {
    /// Whether one request for `key` may proceed.
    ///
    /// Backend failures admit the request after an error log; rate limiting
    /// is load shedding, not an availability dependency.
    pub async fn allow(&self, key: &str) -> bool {
        match self {
            Self::Local(limiter) => limiter.allow(key),
            Self::Distributed(limiter) => match limiter.allow(key).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    tracing::error!(error = %e, key, "Failed to check rate limit");
                    true
                }
            },
        }
    }
}
