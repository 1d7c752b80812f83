//! # Gateway Routing
//!
//! Provider routing and failover for the LLM provider gateway.
//!
//! This crate provides:
//! - The provider catalog (configured descriptors joined with clients)
//! - Health tracking fed by request outcomes and a background poller
//! - Pluggable candidate ordering strategies
//! - Failover with a time-bounded blacklist layered over circuit breakers
//! - The request orchestrator tying admission, retries and failover together

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod failover;
pub mod health;
pub mod orchestrator;
pub mod selector;
pub mod strategy;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types
pub use catalog::ProviderCatalog;
pub use failover::{
    BlacklistInfo, FailoverManager, SkipReason, SkippedProvider, TryCandidate, TryOrder,
};
pub use gateway_config::RoutingStrategy;
pub use health::{
    HealthPoller, HealthSample, HealthSnapshot, InFlightGuard, ProviderHealthRegistry,
    DEFAULT_SMOOTHING,
};
pub use orchestrator::{OrchestratorBuilder, ProviderOrchestrator, ProviderStatus};
pub use selector::ProviderSelector;
pub use strategy::{
    strategy_for, LeastLatency, LeastLoad, PriorityWithFallback, RandomOrder, RoundRobin,
    SelectionContext, SelectionStrategy,
};
