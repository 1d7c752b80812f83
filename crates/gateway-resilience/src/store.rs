//! Shared atomic store backing distributed rate limiting.
//!
//! Provides a store abstraction that supports:
//! - In-memory evaluation (default, single-instance and tests)
//! - Redis evaluation through server-side Lua scripts (multi-instance)
//!
//! Every rate limit algorithm runs as one atomic round-trip; there is no
//! client-side read-then-write.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Error types for atomic store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection error
    #[error("Store connection error: {0}")]
    Connection(String),

    /// Script or command failed on the server
    #[error("Store command error: {0}")]
    Command(String),

    /// Operation timeout
    #[error("Store operation timeout after {0:?}")]
    Timeout(Duration),

    /// Reply could not be interpreted
    #[error("Unexpected store reply: {0}")]
    Reply(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Connection(err.to_string())
        } else if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// An atomic rate limit evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitScript {
    /// Sliding window log
    SlidingWindow {
        /// Counter key
        key: String,
        /// Maximum admissions in the window
        limit: u32,
        /// Window length
        window: Duration,
        /// Current time, milliseconds since the Unix epoch
        now_ms: u64,
        /// Unique member recorded for an admitted sample
        member: String,
    },
    /// Token bucket
    TokenBucket {
        /// Bucket key
        key: String,
        /// Maximum tokens
        capacity: u32,
        /// Tokens added per elapsed interval
        tokens_per_interval: u32,
        /// Refill interval
        interval: Duration,
        /// Tokens the request consumes
        tokens_required: u32,
        /// Current time, milliseconds since the Unix epoch
        now_ms: u64,
    },
}

/// Reply of a [`RateLimitScript`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptReply {
    /// Sliding window outcome
    SlidingWindow {
        /// Whether a sample was admitted
        allowed: bool,
        /// Samples in the window after evaluation
        count: u32,
        /// Timestamp of the oldest sample when denied
        oldest_ms: Option<u64>,
    },
    /// Token bucket outcome
    TokenBucket {
        /// Whether tokens were consumed
        allowed: bool,
        /// Tokens left after evaluation
        tokens: u32,
    },
}

/// Store backend trait for polymorphic store implementations
#[async_trait]
pub trait AtomicStore: Send + Sync + fmt::Debug {
    /// Evaluate a rate limit algorithm atomically
    async fn evaluate(&self, script: &RateLimitScript) -> StoreResult<ScriptReply>;

    /// Add `delta` to a counter and return the new value
    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Add `delta` to a counter that expires `ttl` after it was created and
    /// return the new value.
    ///
    /// `now_ms` is the caller's clock; backends with server-side expiry
    /// ignore it.
    async fn increment_with_ttl(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
        now_ms: u64,
    ) -> StoreResult<i64>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> StoreResult<()>;

    /// Get backend name for logs
    fn name(&self) -> &'static str;

    /// Check if the backend shares state across gateway instances
    fn is_distributed(&self) -> bool;
}

/// Timed operations between two sweeps of expired keys
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<u64>,
    expires_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u64,
    last_refill_ms: u64,
    expires_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    expires_at_ms: Option<u64>,
}

impl Counter {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// In-memory store (single-instance deployments and tests).
///
/// Each key lives in one map shard; evaluation holds the shard entry for
/// the whole algorithm, so concurrent callers on a key are serialized.
/// Keys expire like their Redis counterparts: lazily on access, and in a
/// sweep every 1024 timed operations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, Window>,
    buckets: DashMap<String, Bucket>,
    counters: DashMap<String, Counter>,
    operations: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys across every key kind
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.windows.len() + self.buckets.len() + self.counters.len()
    }

    /// Drop every key expired at `now_ms`; returns how many were removed
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.key_count();
        self.windows.retain(|_, w| w.expires_at_ms > now_ms);
        self.buckets.retain(|_, b| b.expires_at_ms > now_ms);
        self.counters.retain(|_, c| !c.is_expired(now_ms));
        let removed = before.saturating_sub(self.key_count());
        if removed > 0 {
            debug!(removed = removed, "Expired memory store keys purged");
        }
        removed
    }

    /// Must be called with no map entry held
    fn maybe_sweep(&self, now_ms: u64) {
        if self.operations.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired(now_ms);
        }
    }

    fn sliding_window(&self, key: &str, limit: u32, window: Duration, now_ms: u64) -> ScriptReply {
        let window_ms = window.as_millis() as u64;
        let mut entry = self.windows.entry(key.to_string()).or_default();
        let Window {
            samples,
            expires_at_ms,
        } = &mut *entry;

        // Inclusive cutoff, matching ZREMRANGEBYSCORE in the Lua script.
        let cutoff = now_ms.saturating_sub(window_ms);
        while samples.front().is_some_and(|&ts| ts <= cutoff) {
            samples.pop_front();
        }

        let count = samples.len() as u32;
        if count < limit {
            samples.push_back(now_ms);
            *expires_at_ms = now_ms.saturating_add(window_ms);
            ScriptReply::SlidingWindow {
                allowed: true,
                count: count + 1,
                oldest_ms: None,
            }
        } else {
            ScriptReply::SlidingWindow {
                allowed: false,
                count,
                oldest_ms: samples.front().copied(),
            }
        }
    }

    fn token_bucket(
        &self,
        key: &str,
        capacity: u32,
        tokens_per_interval: u32,
        interval: Duration,
        tokens_required: u32,
        now_ms: u64,
    ) -> ScriptReply {
        let interval_ms = (interval.as_millis() as u64).max(1);
        let capacity = u64::from(capacity);
        let fresh = Bucket {
            tokens: capacity,
            last_refill_ms: now_ms,
            expires_at_ms: now_ms,
        };
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(fresh);
        if bucket.expires_at_ms < now_ms {
            *bucket = fresh;
        }

        let elapsed = now_ms.saturating_sub(bucket.last_refill_ms);
        let intervals = elapsed / interval_ms;
        if intervals > 0 {
            let refill = intervals.saturating_mul(u64::from(tokens_per_interval));
            bucket.tokens = capacity.min(bucket.tokens.saturating_add(refill));
            bucket.last_refill_ms += intervals * interval_ms;
        }
        // A lowered capacity takes effect immediately.
        bucket.tokens = bucket.tokens.min(capacity);

        let required = u64::from(tokens_required);
        let allowed = bucket.tokens >= required;
        if allowed {
            bucket.tokens -= required;
        }
        // Long enough to refill from empty, as the Lua script sets it.
        let refill_ms = capacity
            .div_ceil(u64::from(tokens_per_interval).max(1))
            .saturating_mul(interval_ms);
        bucket.expires_at_ms = now_ms.saturating_add(refill_ms.saturating_add(interval_ms));

        ScriptReply::TokenBucket {
            allowed,
            tokens: bucket.tokens as u32,
        }
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn evaluate(&self, script: &RateLimitScript) -> StoreResult<ScriptReply> {
        let reply = match script {
            RateLimitScript::SlidingWindow {
                key,
                limit,
                window,
                now_ms,
                ..
            } => self.sliding_window(key, *limit, *window, *now_ms),
            RateLimitScript::TokenBucket {
                key,
                capacity,
                tokens_per_interval,
                interval,
                tokens_required,
                now_ms,
            } => self.token_bucket(
                key,
                *capacity,
                *tokens_per_interval,
                *interval,
                *tokens_required,
                *now_ms,
            ),
        };
        let now_ms = match script {
            RateLimitScript::SlidingWindow { now_ms, .. }
            | RateLimitScript::TokenBucket { now_ms, .. } => *now_ms,
        };
        self.maybe_sweep(now_ms);
        Ok(reply)
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at_ms: None,
        });
        counter.value = counter.value.saturating_add(delta);
        Ok(counter.value)
    }

    async fn increment_with_ttl(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
        now_ms: u64,
    ) -> StoreResult<i64> {
        let value = {
            let fresh = Counter {
                value: 0,
                expires_at_ms: Some(now_ms.saturating_add(ttl.as_millis() as u64)),
            };
            let mut counter = self.counters.entry(key.to_string()).or_insert(fresh);
            if counter.is_expired(now_ms) {
                *counter = fresh;
            }
            if counter.expires_at_ms.is_none() {
                counter.expires_at_ms = fresh.expires_at_ms;
            }
            counter.value = counter.value.saturating_add(delta);
            counter.value
        };
        self.maybe_sweep(now_ms);
        Ok(value)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

const SLIDING_WINDOW_LUA: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)

if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
    return {1, count + 1, -1}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end
return {0, count, oldest_score}
";

const TOKEN_BUCKET_LUA: &str = r"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local per_interval = tonumber(ARGV[2])
local interval = tonumber(ARGV[3])
local required = tonumber(ARGV[4])
local now = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = now - last_refill
if elapsed > 0 then
    local intervals = math.floor(elapsed / interval)
    if intervals > 0 then
        tokens = math.min(capacity, tokens + intervals * per_interval)
        last_refill = last_refill + intervals * interval
    end
end
tokens = math.min(capacity, tokens)

local allowed = 0
if tokens >= required then
    tokens = tokens - required
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', last_refill)
redis.call('PEXPIRE', key, math.ceil(capacity / per_interval) * interval + interval)
return {allowed, tokens}
";

const INCREMENT_WITH_TTL_LUA: &str = r"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
";

/// Redis store (distributed, multi-instance)
pub struct RedisStore {
    conn: ConnectionManager,
    sliding_window: Script,
    token_bucket: Script,
    increment_with_ttl: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `url` - Redis connection URL
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the server is unreachable
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("Redis atomic store connected");

        Ok(Self {
            conn,
            sliding_window: Script::new(SLIDING_WINDOW_LUA),
            token_bucket: Script::new(TOKEN_BUCKET_LUA),
            increment_with_ttl: Script::new(INCREMENT_WITH_TTL_LUA),
        })
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn evaluate(&self, script: &RateLimitScript) -> StoreResult<ScriptReply> {
        let mut conn = self.conn.clone();

        match script {
            RateLimitScript::SlidingWindow {
                key,
                limit,
                window,
                now_ms,
                member,
            } => {
                let (allowed, count, oldest): (i64, i64, i64) = self
                    .sliding_window
                    .key(key)
                    .arg(*now_ms)
                    .arg(window.as_millis() as u64)
                    .arg(*limit)
                    .arg(member)
                    .invoke_async(&mut conn)
                    .await?;
                debug!(key = %key, allowed = allowed, count = count, "Sliding window evaluated");

                Ok(ScriptReply::SlidingWindow {
                    allowed: allowed == 1,
                    count: u32::try_from(count)
                        .map_err(|_| StoreError::Reply(format!("count {count}")))?,
                    oldest_ms: u64::try_from(oldest).ok(),
                })
            }
            RateLimitScript::TokenBucket {
                key,
                capacity,
                tokens_per_interval,
                interval,
                tokens_required,
                now_ms,
            } => {
                let (allowed, tokens): (i64, i64) = self
                    .token_bucket
                    .key(key)
                    .arg(*capacity)
                    .arg(*tokens_per_interval)
                    .arg((interval.as_millis() as u64).max(1))
                    .arg(*tokens_required)
                    .arg(*now_ms)
                    .invoke_async(&mut conn)
                    .await?;
                debug!(key = %key, allowed = allowed, tokens = tokens, "Token bucket evaluated");

                Ok(ScriptReply::TokenBucket {
                    allowed: allowed == 1,
                    tokens: u32::try_from(tokens)
                        .map_err(|_| StoreError::Reply(format!("tokens {tokens}")))?,
                })
            }
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn increment_with_ttl(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
        _now_ms: u64,
    ) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .increment_with_ttl
            .key(key)
            .arg(delta)
            .arg((ttl.as_millis() as u64).max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Reply(pong))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_distributed(&self) -> bool {
        true
    }
}
