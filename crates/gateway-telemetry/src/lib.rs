//! # Gateway Telemetry
//!
//! Observability for the LLM provider gateway.
//!
//! This crate provides:
//! - Structured logging setup (human or JSON output)
//! - A Prometheus-backed metrics sink for the routing core

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

// Re-export main types
pub use logging::{build_filter, init_logging, LogFormat, LoggingConfig, TracingError};
pub use metrics::{MetricsError, PrometheusMetricsSink};
