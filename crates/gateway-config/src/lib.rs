//! # Gateway Config
//!
//! Configuration management for the LLM provider gateway.
//!
//! This crate provides:
//! - The typed configuration model for every resilience and routing section
//! - Loading from YAML, TOML or JSON files with `GATEWAY_*` environment overrides
//! - Construction-time validation (unknown strategies are rejected at load)
//! - Hot reload through a shared handle and a file watcher

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod model;
pub mod watcher;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::{apply_env_overrides, load_config, parse_config, ConfigFormat, ConfigLoader};
pub use model::{
    BackoffKind, CircuitBreakerConfig, GatewayConfig, RateLimitConfig, RateLimitPolicy,
    RetryConfig, RoutingConfig, RoutingStrategy, StoreBackend, StoreConfig,
};
pub use watcher::{ConfigHandle, ConfigWatcher};
