//! Integration tests for the LLM provider gateway
//!
//! This crate provides cross-crate tests covering:
//! - Routing strategies and failover ordering
//! - Circuit breaking, retries and cancellation
//! - Distributed rate limiting and usage accounting
//! - End-to-end flows through the assembled gateway

pub mod fixtures;
pub mod mock_providers;

// Re-export commonly used items
pub use fixtures::*;
pub use helpers::*;
pub use mock_providers::*;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod resilience_tests;
#[cfg(test)]
mod routing_tests;
