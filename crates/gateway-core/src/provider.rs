//! Provider descriptors and the client trait implemented per backend family.

use crate::error::GatewayResult;
use crate::request::{GatewayRequest, GatewayResponse};
use crate::types::{Capability, CapabilitySet, ProviderId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn default_priority() -> u32 {
    100
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Static description of a backend provider.
///
/// Loaded from configuration and shared (behind `Arc`) by every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Provider identifier
    pub id: ProviderId,
    /// Capabilities served by the provider
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Routing priority, lower is preferred
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Whether the provider takes traffic
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Timeout applied to every attempt on this provider
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl ProviderDescriptor {
    /// Create an enabled descriptor with default priority and timeout
    #[must_use]
    pub fn new(id: impl Into<ProviderId>, capabilities: CapabilitySet) -> Self {
        Self {
            id: id.into(),
            capabilities,
            priority: default_priority(),
            enabled: true,
            timeout: default_timeout(),
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable the provider
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the provider can serve a request needing `capability`
    #[must_use]
    pub fn serves(&self, capability: Capability) -> bool {
        self.enabled && self.capabilities.supports(capability)
    }
}

/// Client for one backend provider.
///
/// Implementations translate the gateway envelope to the vendor wire format;
/// the routing core only sees success or a classified [`GatewayError`].
///
/// [`GatewayError`]: crate::GatewayError
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider this client talks to
    fn id(&self) -> &ProviderId;

    /// Capabilities the backend supports
    fn capabilities(&self) -> CapabilitySet;

    /// Execute one attempt of a request
    async fn execute(
        &self,
        request: &GatewayRequest,
        cancel: &CancellationToken,
    ) -> GatewayResult<GatewayResponse>;

    /// Lightweight liveness probe
    async fn is_healthy(&self, cancel: &CancellationToken) -> bool;
}
