//! Redis-coordinated token-bucket limiter
//!
//! Bucket state lives in a Redis hash per key and is read, refilled, and
//! consumed by a single server-side script, so concurrent instances cannot
//! race the refill arithmetic. Keys expire after ten minutes of inactivity.

use std::time::{SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use redis::Script;

use crate::{Error, Result};

/// Key prefix for bucket hashes
const KEY_PREFIX: &str = "rate_limit:";

/// Refill, consume one token, and report the bucket state, atomically.
///
/// KEYS[1] bucket key; ARGV: capacity, refill rate (tokens/s), now (epoch
/// seconds), capacity. Returns {allowed, remaining, reset_at}.
const TOKEN_BUCKET_SCRIPT: &str = r"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local capacity = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

if not tokens or not last_refill then
    tokens = capacity
    last_refill = now
end

local elapsed = now - last_refill
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', now)
redis.call('EXPIRE', key, 600)

local time_to_full = (capacity - tokens) / refill_rate
local reset_at = now + math.floor(time_to_full)
if time_to_full > math.floor(time_to_full) then
    reset_at = reset_at + 1
end

return {allowed, math.floor(tokens), reset_at}
";

/// Outcome of one distributed bucket check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whole tokens left in the bucket
    pub remaining: i64,
    /// Epoch seconds when the bucket is full again
    pub reset_at: i64,
}

/// Token-bucket limiter backed by a shared Redis store
pub struct DistributedRateLimiter {
    conn: ConnectionManager,
    script: Script,
    rate: f64,
    burst: u32,
}

impl DistributedRateLimiter {
    /// Connect to Redis and prepare the bucket script.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be parsed or the initial
    /// connection fails.
    pub async fn connect(addr: &str, password: &str, db: i64, rate: f64, burst: u32) -> Result<Self> {
        let url = if password.is_empty() {
            format!("redis://{addr}/{db}")
        } else {
            format!("redis://:{password}@{addr}/{db}")
        };
        let client =
            redis::Client::open(url).map_err(|e| Error::RateLimit(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::RateLimit(e.to_string()))?;

        Ok(Self {
            conn,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            rate,
            burst,
        })
    }

    /// Run one bucket check for `key` and report the full decision.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable or replies with an
    /// unexpected shape; callers decide whether to fail open.
    pub async fn check(&self, key: &str) -> Result<RateDecision> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let capacity = f64::from(self.burst);

        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .script
            .key(format!("{KEY_PREFIX}{key}"))
            .arg(capacity)
            .arg(self.rate)
            .arg(now)
            .arg(capacity)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::RateLimit(e.to_string()))?;

        if reply.len() < 3 {
            return Err(Error::RateLimit(format!(
                "unexpected script reply length {}",
                reply.len()
            )));
        }

        Ok(RateDecision {
            allowed: reply[0] == 1,
            remaining: reply[1],
            reset_at: reply[2],
        })
    }

    /// Whether one request for `key` may proceed
    ///
    /// # Errors
    ///
    /// Propagates store errors; see [`DistributedRateLimiter::check`].
    pub async fn allow(&self, key: &str) -> Result<bool> {
        Ok(self.check(key).await?.allowed)
    }
}
