//! Metrics sink consumed by the routing core.

use crate::types::{ProviderId, TenantId};
use std::time::Duration;

/// One completed logical request, as reported to metrics
#[derive(Debug, Clone)]
pub struct RequestRecord<'a> {
    /// Provider that served (or last failed) the request, if any was tried
    pub provider: Option<&'a ProviderId>,
    /// Requested model
    pub model: &'a str,
    /// Tenant issuing the request
    pub tenant: &'a TenantId,
    /// End-to-end duration inside the orchestrator
    pub duration: Duration,
    /// Whether a response was returned
    pub success: bool,
    /// Providers attempted
    pub providers_attempted: usize,
}

/// Destination for request and availability metrics.
///
/// Implementations must be cheap and non-blocking; they are called on the
/// request path.
pub trait MetricsSink: Send + Sync {
    /// Record a completed logical request
    fn record_request(&self, record: &RequestRecord<'_>);

    /// Publish the latest known availability of a provider
    fn update_provider_availability(&self, provider: &ProviderId, available: bool);
}

/// Metrics sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_request(&self, _record: &RequestRecord<'_>) {}

    fn update_provider_availability(&self, _provider: &ProviderId, _available: bool) {}
}
