//! Test fixtures: configurations, requests and canned errors

use gateway_config::{
    BackoffKind, CircuitBreakerConfig, GatewayConfig, RetryConfig, RoutingConfig, RoutingStrategy,
};
use gateway_core::{Capability, CapabilitySet, GatewayError, GatewayRequest, ProviderDescriptor};
use std::time::Duration;

/// Chat-only descriptor with the given priority
pub fn provider(id: &str, priority: u32) -> ProviderDescriptor {
    ProviderDescriptor::new(id, CapabilitySet::new().with(Capability::Chat))
        .with_priority(priority)
        .with_timeout(Duration::from_secs(10))
}

/// Deterministic configuration: no jitter, exponential 1s backoff, three attempts
pub fn base_config(providers: Vec<ProviderDescriptor>) -> GatewayConfig {
    GatewayConfig {
        providers,
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 0.5,
            minimum_throughput: 10,
            sampling_duration: Duration::from_secs(30),
            duration_of_break: Duration::from_secs(30),
            permitted_calls_in_half_open: 1,
        },
        retry: RetryConfig {
            max_retry_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            use_jitter: false,
            backoff: BackoffKind::Exponential,
        },
        routing: RoutingConfig {
            strategy: RoutingStrategy::PriorityWithFallback,
            failover_threshold: 3,
            blacklist_duration: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        },
        ..Default::default()
    }
}

/// Chat request for `tenant`
pub fn chat_request(tenant: &str) -> GatewayRequest {
    GatewayRequest::builder()
        .tenant(tenant)
        .model("gpt-4o")
        .payload(serde_json::json!({
            "messages": [{ "role": "user", "content": "Hello, how are you?" }]
        }))
        .build()
        .expect("Failed to build request")
}

/// Chat request pinned to `provider`
pub fn pinned_request(tenant: &str, provider: &str) -> GatewayRequest {
    GatewayRequest::builder()
        .tenant(tenant)
        .model("gpt-4o")
        .force_provider(provider)
        .build()
        .expect("Failed to build request")
}

/// Chat request carrying a token estimate
pub fn weighted_request(tenant: &str, tokens: u32) -> GatewayRequest {
    GatewayRequest::builder()
        .tenant(tenant)
        .model("gpt-4o")
        .estimated_tokens(tokens)
        .build()
        .expect("Failed to build request")
}

/// Retryable backend failure (HTTP 503)
pub fn transient(provider: &str) -> GatewayError {
    GatewayError::provider(provider, "service unavailable", Some(503), false)
}

/// Non-retryable backend failure (HTTP 400)
pub fn permanent(provider: &str) -> GatewayError {
    GatewayError::provider(provider, "invalid request", Some(400), false)
}
