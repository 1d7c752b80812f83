//! # Gateway Resilience
//!
//! Resilience patterns for the LLM provider gateway:
//! - Circuit breaker per provider with reserved half-open probes
//! - Retry executor with cancellable backoff
//! - Distributed rate limiting (sliding window and token bucket)
//! - Atomic store backends (in-memory and Redis)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;
pub mod store;

// Re-export main types
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
    ProbeReservation,
};
pub use gateway_config::{BackoffKind, CircuitBreakerConfig, RetryConfig};
pub use rate_limit::{
    period_key, pool_key, tenant_key, Clock, ManualClock, RateLimitAlgorithm, RateLimitResult, RateLimiter,
    SystemClock,
};
pub use retry::{RetryExecutor, RetryResult};
pub use store::{
    AtomicStore, MemoryStore, RateLimitScript, RedisStore, ScriptReply, StoreError, StoreResult,
};
