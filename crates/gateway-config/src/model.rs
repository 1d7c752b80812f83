//! Typed configuration model.
//!
//! Every section has serde defaults so a partial document is valid; the
//! whole tree is checked by [`GatewayConfig::validate_all`] before any
//! component sees it.

use crate::error::{ConfigError, ConfigResult};
use gateway_core::{Capability, ProviderDescriptor};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::{Validate, ValidationError};

fn non_zero_duration(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("non_zero_duration"));
    }
    Ok(())
}

/// Root gateway configuration
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    /// Backend providers
    pub providers: Vec<ProviderDescriptor>,

    /// Circuit breaker settings (one breaker per provider)
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry settings applied to each provider attempt
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Routing and failover settings
    #[validate(nested)]
    pub routing: RoutingConfig,

    /// Admission control settings
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,

    /// Shared atomic store settings
    #[validate(nested)]
    pub store: StoreConfig,
}

impl GatewayConfig {
    /// Validate field constraints and cross-section invariants
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` describing the first violation
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.validate()?;

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.as_str().is_empty() {
                return Err(ConfigError::Validation("provider id must not be empty".into()));
            }
            if !seen.insert(provider.id.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate provider id: {}",
                    provider.id
                )));
            }
            if provider.timeout.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "provider {} timeout must be greater than zero",
                    provider.id
                )));
            }
        }

        if let Some(policy) = &self.rate_limit.tenant {
            policy.validate_policy("rate_limit.tenant")?;
        }
        if let Some(policy) = &self.rate_limit.provider_pool {
            policy.validate_policy("rate_limit.provider_pool")?;
        }
        for (capability, policy) in &self.rate_limit.per_capability {
            policy.validate_policy(&format!("rate_limit.per_capability.{capability}"))?;
        }

        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            return Err(ConfigError::Validation(
                "store.url is required for the redis backend".into(),
            ));
        }

        Ok(())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (0, 1] that opens the circuit
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub failure_threshold: f64,

    /// Samples required in the window before the ratio is evaluated
    #[validate(range(min = 1))]
    pub minimum_throughput: u32,

    /// Length of the sampling window
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub sampling_duration: Duration,

    /// Time the circuit stays open before probing
    #[serde(with = "humantime_serde")]
    pub duration_of_break: Duration,

    /// Probe calls allowed while half-open
    #[validate(range(min = 1))]
    pub permitted_calls_in_half_open: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            minimum_throughput: 10,
            sampling_duration: Duration::from_secs(30),
            duration_of_break: Duration::from_secs(30),
            permitted_calls_in_half_open: 1,
        }
    }
}

/// Backoff curve between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum BackoffKind {
    /// Same delay before every retry
    #[serde(rename = "constant", alias = "Constant")]
    Constant,
    /// Delay grows linearly with the attempt number
    #[serde(rename = "linear", alias = "Linear")]
    Linear,
    /// Delay doubles after every attempt
    #[default]
    #[serde(rename = "exponential", alias = "Exponential")]
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(ConfigError::Validation(format!("unknown backoff kind: {other}"))),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts on one provider, including the first
    #[validate(range(min = 1, max = 10))]
    pub max_retry_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound on the backoff delay, applied before jitter
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Add uniform random jitter in `[0, delay]`
    pub use_jitter: bool,

    /// Backoff curve
    #[serde(alias = "backoff_type")]
    pub backoff: BackoffKind,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            use_jitter: true,
            backoff: BackoffKind::Exponential,
        }
    }
}

/// Candidate ordering strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum RoutingStrategy {
    /// Ascending priority, ties broken by provider id
    #[default]
    #[serde(rename = "priority_with_fallback", alias = "PriorityWithFallback")]
    PriorityWithFallback,
    /// Rotate the start of the list on every call
    #[serde(rename = "round_robin", alias = "RoundRobin")]
    RoundRobin,
    /// Uniform shuffle
    #[serde(rename = "random", alias = "Random")]
    Random,
    /// Ascending rolling average latency
    #[serde(rename = "least_latency", alias = "LeastLatency")]
    LeastLatency,
    /// Ascending in-flight request count
    #[serde(rename = "least_load", alias = "LeastLoad")]
    LeastLoad,
}

impl RoutingStrategy {
    /// Stable snake_case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriorityWithFallback => "priority_with_fallback",
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastLatency => "least_latency",
            Self::LeastLoad => "least_load",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "prioritywithfallback" | "priority" => Ok(Self::PriorityWithFallback),
            "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "leastlatency" => Ok(Self::LeastLatency),
            "leastload" => Ok(Self::LeastLoad),
            _ => Err(ConfigError::Validation(format!("unknown routing strategy: {s}"))),
        }
    }
}

/// Routing and failover configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
#[serde(default)]
pub struct RoutingConfig {
    /// Candidate ordering strategy
    pub strategy: RoutingStrategy,

    /// Consecutive failures before a provider is blacklisted
    #[validate(range(min = 1))]
    pub failover_threshold: u32,

    /// How long a blacklisted provider is excluded
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub blacklist_duration: Duration,

    /// Period of the background health probe
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub health_check_interval: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::PriorityWithFallback,
            failover_threshold: 3,
            blacklist_duration: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Admission policy for one key class
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// At most `limit` admissions in any trailing `window`
    SlidingWindow {
        /// Maximum admissions per window
        limit: u32,
        /// Window length
        #[serde(with = "humantime_serde")]
        window: Duration,
    },
    /// Bucket of `capacity` tokens refilled by `tokens_per_interval` every `interval`
    TokenBucket {
        /// Maximum tokens in the bucket
        capacity: u32,
        /// Tokens added per elapsed interval
        tokens_per_interval: u32,
        /// Refill interval
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
}

impl RateLimitPolicy {
    fn validate_policy(&self, section: &str) -> ConfigResult<()> {
        let problem = match self {
            Self::SlidingWindow { limit, window } => {
                if *limit == 0 {
                    Some("limit must be at least 1")
                } else if window.as_millis() == 0 {
                    Some("window must be at least 1ms")
                } else {
                    None
                }
            }
            Self::TokenBucket {
                capacity,
                tokens_per_interval,
                interval,
            } => {
                if *capacity == 0 {
                    Some("capacity must be at least 1")
                } else if *tokens_per_interval == 0 {
                    Some("tokens_per_interval must be at least 1")
                } else if interval.as_millis() == 0 {
                    Some("interval must be at least 1ms")
                } else {
                    None
                }
            }
        };

        match problem {
            Some(message) => Err(ConfigError::Validation(format!("{section}: {message}"))),
            None => Ok(()),
        }
    }
}

/// Admission control configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether admission control runs at all
    pub enabled: bool,

    /// Prefix of every rate limit key in the shared store
    #[validate(length(min = 1))]
    pub key_prefix: String,

    /// Per-tenant policy (`{prefix}:tenant:{tenant}`)
    pub tenant: Option<RateLimitPolicy>,

    /// Pool policy (`{prefix}:pool:{capability}`) for capabilities without
    /// an entry in `per_capability`
    pub provider_pool: Option<RateLimitPolicy>,

    /// Pool policy overrides keyed by capability
    pub per_capability: HashMap<Capability, RateLimitPolicy>,

    /// Record usage counters after successful requests
    pub usage_accounting: bool,

    /// Length of one usage accounting period; counters expire with it
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub usage_period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "ratelimit".to_string(),
            tenant: None,
            provider_pool: None,
            per_capability: HashMap::new(),
            usage_accounting: true,
            usage_period: Duration::from_secs(3600),
        }
    }
}

impl RateLimitConfig {
    /// Pool policy for `capability`: its override, else the shared pool policy
    #[must_use]
    pub fn pool_policy(&self, capability: Capability) -> Option<&RateLimitPolicy> {
        self.per_capability
            .get(&capability)
            .or(self.provider_pool.as_ref())
    }
}

/// Kind of shared store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local store (single instance, tests)
    #[default]
    Memory,
    /// Redis, shared by every gateway instance
    Redis,
}

/// Shared atomic store configuration
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct StoreConfig {
    /// Store implementation
    pub backend: StoreBackend,

    /// Connection URL (required for redis)
    pub url: Option<SecretString>,

    /// Upper bound on any single store round-trip
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub operation_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            operation_timeout: Duration::from_millis(500),
        }
    }
}
