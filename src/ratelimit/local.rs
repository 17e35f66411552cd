//! In-process token-bucket limiter map

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Bucket};
use tokio_util::sync::CancellationToken;

/// Sweep cadence for idle visitors
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Visitors idle longer than this are evicted
const MAX_IDLE: Duration = Duration::from_secs(180);

type KeyBucket = Bucket<NotKeyed, InMemoryState, DefaultClock>;

/// One tracked key: its bucket and when it was last seen
struct Visitor {
    bucket: KeyBucket,
    last_seen: Mutex<Instant>,
}

/// Token-bucket limiter with one bucket per key
///
/// The visitor map sits behind a read-biased lock: the hot path (existing
/// key) takes the read side only.
pub struct LocalRateLimiter {
    visitors: RwLock<HashMap<String, Visitor>>,
    quota: Quota,
}

impl LocalRateLimiter {
    /// Create a limiter refilling `rate` tokens per second into buckets of
    /// `burst` capacity. Zero values are clamped to one.
    #[must_use]
    pub fn new(rate: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        Self {
            visitors: RwLock::new(HashMap::new()),
            quota: Quota::per_second(rate).allow_burst(burst),
        }
    }

    /// Whether one request for `key` may proceed now
    pub fn allow(&self, key: &str) -> bool {
        {
            let visitors = self.visitors.read().unwrap_or_else(|e| e.into_inner());
            if let Some(visitor) = visitors.get(key) {
                *visitor.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                return visitor.bucket.check().is_ok();
            }
        }

        let mut visitors = self.visitors.write().unwrap_or_else(|e| e.into_inner());
        let visitor = visitors.entry(key.to_string()).or_insert_with(|| Visitor {
            bucket: Bucket::direct(self.quota),
            last_seen: Mutex::new(Instant::now()),
        });
        visitor.bucket.check().is_ok()
    }

    /// Number of tracked keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.visitors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether no keys are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop visitors idle longer than `max_idle`; returns how many were removed
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut visitors = self.visitors.write().unwrap_or_else(|e| e.into_inner());
        let before = visitors.len();
        let now = Instant::now();
        visitors.retain(|_, v| {
            let last = *v.last_seen.lock().unwrap_or_else(|e| e.into_inner());
            now.duration_since(last) <= max_idle
        });
        before - visitors.len()
    }

    /// Run the idle sweep on a one-minute cadence until `shutdown` fires
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let evicted = self.evict_idle(MAX_IDLE);
                    if evicted > 0 {
                        tracing::debug!(evicted, "evicted idle rate limit visitors");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_bounds_rapid_calls() {
        let limiter = LocalRateLimiter::new(1, 5);

        let allowed = (0..100).filter(|_| limiter.allow("A0001")).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = LocalRateLimiter::new(1, 2);

        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));

        assert!(limiter.allow("b"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("b"));
    }

    #[test]
    fn zero_parameters_are_clamped() {
        let limiter = LocalRateLimiter::new(0, 0);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn eviction_forgets_idle_keys() {
        let limiter = LocalRateLimiter::new(1, 1);
        limiter.allow("a");
        limiter.allow("b");
        assert_eq!(limiter.len(), 2);

        assert_eq!(limiter.evict_idle(Duration::ZERO), 2);
        assert!(limiter.is_empty());

        // a fresh bucket after eviction grants the burst again
        assert!(limiter.allow("a"));
    }
}
