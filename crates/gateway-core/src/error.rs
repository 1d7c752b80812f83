//! Error types for the gateway.
//!
//! Every failure that can cross the orchestrator boundary is a
//! [`GatewayError`]. Routing decisions are made on its [`ErrorClass`].

use crate::types::ProviderId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the gateway crates
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Coarse classification of an error, used to decide retry and failover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeout, 5xx, 429 from a backend, connection reset
    Transient,
    /// 4xx other than 429, malformed response
    Permanent,
    /// Gateway admission quota exhausted
    RateLimited,
    /// Provider excluded by its circuit breaker
    CircuitOpen,
    /// Caller cancelled the request
    Cancelled,
    /// Gateway bug or misconfiguration
    Internal,
}

impl ErrorClass {
    /// Stable lowercase label for logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider's contribution to an aggregated failure
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    /// Provider that failed
    pub provider: ProviderId,
    /// Last error observed on that provider
    pub error: GatewayError,
    /// Attempts consumed on that provider
    pub attempts: u32,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} attempt(s)): {}", self.provider, self.attempts, self.error)
    }
}

/// Main gateway error type
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Error reported by a provider backend
    #[error("Provider {provider} error: {message}")]
    Provider {
        /// Provider identifier
        provider: String,
        /// Error message
        message: String,
        /// HTTP status code, when the backend answered
        status_code: Option<u16>,
        /// Whether the provider flagged the error as retryable
        retryable: bool,
    },

    /// Provider attempt exceeded its timeout
    #[error("Request timed out after {timeout:?}")]
    Timeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Transport-level failure talking to a provider
    #[error("Connection to provider {provider} failed: {message}")]
    Connection {
        /// Provider identifier
        provider: String,
        /// Error message
        message: String,
    },

    /// Provider answered with a payload that could not be understood
    #[error("Malformed response from provider {provider}: {message}")]
    MalformedResponse {
        /// Provider identifier
        provider: String,
        /// Error message
        message: String,
    },

    /// Provider skipped because its circuit breaker is open
    #[error("Circuit breaker open for provider {provider}")]
    CircuitBreakerOpen {
        /// Provider identifier
        provider: String,
        /// Last error recorded for the provider before it was excluded
        last_error: Option<String>,
    },

    /// Gateway admission quota exhausted
    #[error("Rate limit exceeded for {key}")]
    RateLimit {
        /// Rate limit key that denied the request
        key: String,
        /// Suggested wait before retrying
        retry_after: Option<Duration>,
    },

    /// Every candidate provider failed (or none was available)
    #[error("All providers failed: {}", format_failures(.attempts))]
    AllProvidersFailed {
        /// Per-provider failures, in the order they were attempted
        attempts: Vec<ProviderFailure>,
    },

    /// Request was cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration rejected at construction time
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

fn format_failures(attempts: &[ProviderFailure]) -> String {
    if attempts.is_empty() {
        return "no provider available".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl GatewayError {
    /// Create a provider error
    #[must_use]
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
        retryable: bool,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
            retryable,
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Create a connection error
    #[must_use]
    pub fn connection(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-response error
    #[must_use]
    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a rate limit error
    #[must_use]
    pub fn rate_limit(key: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            key: key.into(),
            retry_after,
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify the error for retry and failover decisions
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Provider {
                status_code,
                retryable,
                ..
            } => match status_code {
                _ if *retryable => ErrorClass::Transient,
                Some(429) => ErrorClass::Transient,
                Some(code) if *code >= 500 => ErrorClass::Transient,
                Some(_) => ErrorClass::Permanent,
                None => ErrorClass::Permanent,
            },
            Self::Timeout { .. } | Self::Connection { .. } => ErrorClass::Transient,
            Self::MalformedResponse { .. } => ErrorClass::Permanent,
            Self::CircuitBreakerOpen { .. } => ErrorClass::CircuitOpen,
            Self::RateLimit { .. } => ErrorClass::RateLimited,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::AllProvidersFailed { .. } | Self::Configuration { .. } | Self::Internal { .. } => {
                ErrorClass::Internal
            }
        }
    }

    /// Check if the error may succeed when retried on the same provider
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if the error is a cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Retry guidance carried by rate limit errors
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status code the transport layer should answer with
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RateLimit { .. } => 429,
            Self::Timeout { .. } => 504,
            Self::AllProvidersFailed { .. }
            | Self::CircuitBreakerOpen { .. }
            | Self::Provider { .. }
            | Self::Connection { .. }
            | Self::MalformedResponse { .. } => 502,
            Self::Cancelled => 499,
            Self::Configuration { .. } | Self::Internal { .. } => 500,
        }
    }
}
