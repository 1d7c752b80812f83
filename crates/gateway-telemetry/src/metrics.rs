//! Prometheus-backed metrics sink.

use gateway_core::{MetricsSink, ProviderId, RequestRecord};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::fmt;

const NO_PROVIDER: &str = "none";

/// Metrics error
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Metric could not be created or registered
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    /// Exposition output was not valid UTF-8
    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}

/// Request and availability metrics registered in a Prometheus registry
#[derive(Clone)]
pub struct PrometheusMetricsSink {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    providers_attempted: HistogramVec,
    provider_available: IntGaugeVec,
}

impl fmt::Debug for PrometheusMetricsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetricsSink").finish_non_exhaustive()
    }
}

impl PrometheusMetricsSink {
    /// Create a sink with its own registry
    ///
    /// # Errors
    /// Returns error if metric registration fails
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_registry(Registry::new())
    }

    /// Create a sink registering into `registry`
    ///
    /// # Errors
    /// Returns error if a metric with the same name is already registered
    pub fn with_registry(registry: Registry) -> Result<Self, MetricsError> {
        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Logical requests handled by the gateway"),
            &["provider", "model", "tenant", "outcome"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "End-to-end request duration inside the orchestrator",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["provider", "outcome"],
        )?;
        let providers_attempted = HistogramVec::new(
            HistogramOpts::new(
                "gateway_providers_attempted",
                "Providers attempted per logical request",
            )
            .buckets(vec![0.0, 1.0, 2.0, 3.0, 5.0, 8.0]),
            &["outcome"],
        )?;
        let provider_available = IntGaugeVec::new(
            Opts::new(
                "gateway_provider_available",
                "Latest known provider availability (1 = available)",
            ),
            &["provider"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(providers_attempted.clone()))?;
        registry.register(Box::new(provider_available.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            providers_attempted,
            provider_available,
        })
    }

    /// Registry holding the gateway metrics
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the text exposition format
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn gather_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn record_request(&self, record: &RequestRecord<'_>) {
        let provider = record.provider.map_or(NO_PROVIDER, ProviderId::as_str);
        let outcome = if record.success { "success" } else { "failure" };

        self.requests_total
            .with_label_values(&[provider, record.model, record.tenant.as_str(), outcome])
            .inc();
        self.request_duration
            .with_label_values(&[provider, outcome])
            .observe(record.duration.as_secs_f64());
        self.providers_attempted
            .with_label_values(&[outcome])
            .observe(record.providers_attempted as f64);
    }

    fn update_provider_availability(&self, provider: &ProviderId, available: bool) {
        self.provider_available
            .with_label_values(&[provider.as_str()])
            .set(i64::from(available));
    }
}
