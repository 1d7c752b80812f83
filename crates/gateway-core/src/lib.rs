//! # Gateway Core
//!
//! Core types, traits, and error handling for the LLM provider gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - Request and response envelopes
//! - Provider descriptors and the provider client trait
//! - The error taxonomy used by routing and resilience
//! - Validated identifier newtypes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod metrics;
pub mod provider;
pub mod request;
pub mod types;

// Re-export commonly used types
pub use error::{ErrorClass, GatewayError, GatewayResult, ProviderFailure};
pub use metrics::{MetricsSink, NoopMetricsSink, RequestRecord};
pub use provider::{ProviderClient, ProviderDescriptor};
pub use request::{GatewayRequest, GatewayRequestBuilder, GatewayResponse, RequestOutcome, Usage};
pub use types::{Capability, CapabilitySet, ProviderId, RequestId, TenantId};
pub use tokio_util::sync::CancellationToken;
