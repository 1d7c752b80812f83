//! Distributed admission control.
//!
//! Counters live in an [`AtomicStore`] so every gateway instance agrees on
//! admission; nothing is cached in process. When the store is unreachable,
//! slow, or errors, the limiter fails open and logs the fault.

use crate::store::{AtomicStore, RateLimitScript, ScriptReply, StoreError};
use gateway_config::RateLimitPolicy;
use gateway_core::{Capability, GatewayError, GatewayResult, TenantId};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Wall clock used for rate limit timestamps.
///
/// Timestamps are shared across instances through the store, so they are
/// epoch-based rather than monotonic.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `now_ms`
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Set the clock
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Algorithm that produced a [`RateLimitResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAlgorithm {
    /// Sliding window log
    SlidingWindow,
    /// Token bucket
    TokenBucket,
}

/// Outcome of one admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Algorithm evaluated
    pub algorithm: RateLimitAlgorithm,
    /// Samples in the window (sliding window) or tokens left (token bucket)
    pub current: u32,
    /// Window limit or bucket capacity
    pub limit: u32,
    /// Window length or refill interval
    pub period: Duration,
    /// Suggested wait before retrying, when denied
    pub retry_after: Option<Duration>,
    /// Whether the store was bypassed (fail open)
    pub degraded: bool,
}

impl RateLimitResult {
    fn fail_open(algorithm: RateLimitAlgorithm, limit: u32, period: Duration) -> Self {
        Self {
            allowed: true,
            algorithm,
            current: 0,
            limit,
            period,
            retry_after: None,
            degraded: true,
        }
    }

    /// Admissions (or tokens) still available
    #[must_use]
    pub fn remaining(&self) -> u32 {
        match self.algorithm {
            RateLimitAlgorithm::SlidingWindow => self.limit.saturating_sub(self.current),
            RateLimitAlgorithm::TokenBucket => self.current,
        }
    }
}

/// Rate limit key for a tenant
#[must_use]
pub fn tenant_key(prefix: &str, tenant: &TenantId) -> String {
    format!("{prefix}:tenant:{tenant}")
}

/// Rate limit key for the provider pool serving a capability
#[must_use]
pub fn pool_key(prefix: &str, capability: Capability) -> String {
    format!("{prefix}:pool:{capability}")
}

/// Key of the accounting period containing `now_ms`.
///
/// Periods are aligned to the Unix epoch, so every instance derives the same
/// key for the same instant.
#[must_use]
pub fn period_key(base: &str, period: Duration, now_ms: u64) -> String {
    let period_ms = (period.as_millis() as u64).max(1);
    format!("{base}:{}", now_ms / period_ms)
}

/// Distributed rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    operation_timeout_ms: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter over `store` using the system clock
    #[must_use]
    pub fn new(store: Arc<dyn AtomicStore>, operation_timeout: Duration) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), operation_timeout)
    }

    /// Create a limiter with an explicit clock
    #[must_use]
    pub fn with_clock(
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            operation_timeout_ms: AtomicU64::new(operation_timeout.as_millis() as u64),
        }
    }

    /// Store backing this limiter
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AtomicStore> {
        &self.store
    }

    /// Replace the per-operation store timeout
    pub fn set_operation_timeout(&self, timeout: Duration) {
        self.operation_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.load(Ordering::Relaxed))
    }

    /// Run one store round-trip bounded by the operation timeout and `cancel`
    async fn round_trip<T, F>(&self, cancel: &CancellationToken, op: F) -> GatewayResult<Result<T, StoreError>>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.operation_timeout();
        tokio::select! {
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = tokio::time::timeout(timeout, op) => {
                Ok(result.unwrap_or(Err(StoreError::Timeout(timeout))))
            }
        }
    }

    /// Check a key against `policy`
    ///
    /// `tokens_required` only applies to token bucket policies.
    ///
    /// # Errors
    /// Returns `GatewayError::Cancelled` if `cancel` fires; store faults fail open
    pub async fn check(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        tokens_required: u32,
        cancel: &CancellationToken,
    ) -> GatewayResult<RateLimitResult> {
        match policy {
            RateLimitPolicy::SlidingWindow { limit, window } => {
                self.check_sliding_window(key, *limit, *window, cancel).await
            }
            RateLimitPolicy::TokenBucket {
                capacity,
                tokens_per_interval,
                interval,
            } => {
                self.check_token_bucket(
                    key,
                    *capacity,
                    *tokens_per_interval,
                    *interval,
                    tokens_required,
                    cancel,
                )
                .await
            }
        }
    }

    /// At most `limit` admissions for `key` in any trailing `window`
    ///
    /// # Errors
    /// Returns `GatewayError::Cancelled` if `cancel` fires; store faults fail open
    pub async fn check_sliding_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        cancel: &CancellationToken,
    ) -> GatewayResult<RateLimitResult> {
        let now_ms = self.clock.now_millis();
        let script = RateLimitScript::SlidingWindow {
            key: key.to_string(),
            limit,
            window,
            now_ms,
            member: format!("{now_ms}-{}", Uuid::new_v4()),
        };

        let reply = match self.round_trip(cancel, self.store.evaluate(&script)).await? {
            Ok(ScriptReply::SlidingWindow {
                allowed,
                count,
                oldest_ms,
            }) => (allowed, count, oldest_ms),
            Ok(other) => {
                warn!(key = %key, reply = ?other, "Unexpected rate limit reply, allowing request");
                return Ok(RateLimitResult::fail_open(
                    RateLimitAlgorithm::SlidingWindow,
                    limit,
                    window,
                ));
            }
            Err(e) => {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                return Ok(RateLimitResult::fail_open(
                    RateLimitAlgorithm::SlidingWindow,
                    limit,
                    window,
                ));
            }
        };

        let (allowed, count, oldest_ms) = reply;
        let retry_after = if allowed {
            None
        } else {
            let age = oldest_ms.map_or(Duration::ZERO, |oldest| {
                Duration::from_millis(now_ms.saturating_sub(oldest))
            });
            Some(window.saturating_sub(age))
        };

        debug!(key = %key, allowed = allowed, count = count, limit = limit, "Sliding window check");

        Ok(RateLimitResult {
            allowed,
            algorithm: RateLimitAlgorithm::SlidingWindow,
            current: count,
            limit,
            period: window,
            retry_after,
            degraded: false,
        })
    }

    /// Consume `tokens_required` tokens from the bucket at `key`
    ///
    /// # Errors
    /// Returns `GatewayError::Cancelled` if `cancel` fires; store faults fail open
    pub async fn check_token_bucket(
        &self,
        key: &str,
        capacity: u32,
        tokens_per_interval: u32,
        interval: Duration,
        tokens_required: u32,
        cancel: &CancellationToken,
    ) -> GatewayResult<RateLimitResult> {
        let script = RateLimitScript::TokenBucket {
            key: key.to_string(),
            capacity,
            tokens_per_interval,
            interval,
            tokens_required,
            now_ms: self.clock.now_millis(),
        };

        let (allowed, tokens) = match self.round_trip(cancel, self.store.evaluate(&script)).await? {
            Ok(ScriptReply::TokenBucket { allowed, tokens }) => (allowed, tokens),
            Ok(other) => {
                warn!(key = %key, reply = ?other, "Unexpected rate limit reply, allowing request");
                return Ok(RateLimitResult::fail_open(
                    RateLimitAlgorithm::TokenBucket,
                    capacity,
                    interval,
                ));
            }
            Err(e) => {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                return Ok(RateLimitResult::fail_open(
                    RateLimitAlgorithm::TokenBucket,
                    capacity,
                    interval,
                ));
            }
        };

        debug!(
            key = %key,
            allowed = allowed,
            tokens = tokens,
            required = tokens_required,
            "Token bucket check"
        );

        Ok(RateLimitResult {
            allowed,
            algorithm: RateLimitAlgorithm::TokenBucket,
            current: tokens,
            limit: capacity,
            period: interval,
            retry_after: (!allowed).then_some(interval),
            degraded: false,
        })
    }

    /// Best-effort counter increment; returns 0 on any store fault or cancellation
    pub async fn increment(&self, key: &str, delta: i64, cancel: &CancellationToken) -> i64 {
        match self.round_trip(cancel, self.store.increment(key, delta)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Failed to increment counter");
                0
            }
            Err(_) => 0,
        }
    }

    /// Best-effort increment of `base`'s counter for the current `period`.
    ///
    /// The counter lives under [`period_key`] and expires one period after
    /// it was created. Returns 0 on any store fault or cancellation.
    pub async fn increment_for_period(
        &self,
        base: &str,
        delta: i64,
        period: Duration,
        cancel: &CancellationToken,
    ) -> i64 {
        let now_ms = self.clock.now_millis();
        let key = period_key(base, period, now_ms);
        let op = self.store.increment_with_ttl(&key, delta, period, now_ms);
        match self.round_trip(cancel, op).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Failed to increment period counter");
                0
            }
            Err(_) => 0,
        }
    }
}
