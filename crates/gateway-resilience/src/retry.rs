//! Retry executor with backoff.
//!
//! Wraps one provider call with bounded retries. The backoff sleep races the
//! caller's cancellation token; cancellation is reported as its own outcome,
//! never as retry exhaustion.

use arc_swap::ArcSwap;
use gateway_config::{BackoffKind, RetryConfig};
use gateway_core::GatewayError;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry executor
#[derive(Debug)]
pub struct RetryExecutor {
    config: ArcSwap<RetryConfig>,
}

impl RetryExecutor {
    /// Create a new executor with the given configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> Arc<RetryConfig> {
        self.config.load_full()
    }

    /// Replace the configuration
    pub fn update_config(&self, config: RetryConfig) {
        self.config.store(Arc::new(config));
    }

    /// Delay before retrying after failed attempt `attempt` (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let config = self.config.load();
        let attempt = attempt.max(1);

        let base = match config.backoff {
            BackoffKind::Constant => config.initial_delay,
            BackoffKind::Linear => config.initial_delay.saturating_mul(attempt),
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                config.initial_delay.saturating_mul(factor)
            }
        };
        let delay = base.min(config.max_delay);

        if config.use_jitter && !delay.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
            delay.saturating_add(Duration::from_millis(jitter_ms))
        } else {
            delay
        }
    }

    /// Execute `operation` with the configured attempt budget
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute<F, Fut, T, R>(
        &self,
        operation: F,
        is_retryable: R,
        cancel: &CancellationToken,
    ) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
        R: Fn(&GatewayError) -> bool,
    {
        let max_attempts = self.config.load().max_retry_attempts;
        self.execute_with_attempts(operation, is_retryable, cancel, max_attempts)
            .await
    }

    /// Execute `operation` with an explicit attempt budget
    ///
    /// A budget of zero is treated as one attempt.
    pub async fn execute_with_attempts<F, Fut, T, R>(
        &self,
        mut operation: F,
        is_retryable: R,
        cancel: &CancellationToken,
        max_attempts: u32,
    ) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
        R: Fn(&GatewayError) -> bool,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return RetryResult::Cancelled { attempts: attempt };
            }
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt = attempt, "Retry succeeded");
                    }
                    return RetryResult::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            if error.is_cancelled() || cancel.is_cancelled() {
                return RetryResult::Cancelled { attempts: attempt };
            }
            if !is_retryable(&error) {
                debug!(attempt = attempt, error = %error, "Non-retryable error");
                return RetryResult::NonRetryable {
                    error,
                    attempts: attempt,
                };
            }
            if attempt >= max_attempts {
                return RetryResult::Failed {
                    error,
                    attempts: attempt,
                };
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(attempt = attempt, "Retry backoff cancelled");
                    return RetryResult::Cancelled { attempts: attempt };
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub enum RetryResult<T> {
    /// Operation succeeded
    Success {
        /// Returned value
        value: T,
        /// Number of attempts made
        attempts: u32,
    },
    /// Operation failed after all attempts
    Failed {
        /// The final error
        error: GatewayError,
        /// Number of attempts made
        attempts: u32,
    },
    /// Operation failed with non-retryable error
    NonRetryable {
        /// The error
        error: GatewayError,
        /// Number of attempts made
        attempts: u32,
    },
    /// Caller cancelled during an attempt or a backoff sleep
    Cancelled {
        /// Number of attempts started
        attempts: u32,
    },
}

impl<T> RetryResult<T> {
    /// Convert to a Result
    ///
    /// # Errors
    /// Returns the error if the operation failed or was cancelled
    pub fn into_result(self) -> Result<T, GatewayError> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::Failed { error, .. } | Self::NonRetryable { error, .. } => Err(error),
            Self::Cancelled { .. } => Err(GatewayError::Cancelled),
        }
    }

    /// Number of attempts made
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::NonRetryable { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// Check if the operation succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Check if the operation was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
