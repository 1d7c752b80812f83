//! Provider health tracking.
//!
//! The registry is fed by call outcomes on the request path and by the
//! background [`HealthPoller`]. The request path only ever reads snapshots;
//! it never triggers a probe.

use crate::catalog::ProviderCatalog;
use dashmap::DashMap;
use gateway_core::{ErrorClass, MetricsSink, ProviderId, RequestOutcome};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default EWMA weight of the newest latency sample
pub const DEFAULT_SMOOTHING: f64 = 0.2;

/// Point-in-time health of one provider
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    /// Exponentially weighted average latency; `None` before the first sample
    pub rolling_avg_latency: Option<Duration>,
    /// Requests currently executing against the provider
    pub in_flight: u32,
    /// Result of the latest call or probe
    pub last_known_available: bool,
    /// Completed calls observed
    pub total_requests: u64,
    /// Failed calls observed
    pub total_failures: u64,
    /// Time since the last outcome or probe
    pub last_updated: Option<Duration>,
}

impl Default for HealthSample {
    fn default() -> Self {
        Self {
            rolling_avg_latency: None,
            in_flight: 0,
            last_known_available: true,
            total_requests: 0,
            total_failures: 0,
            last_updated: None,
        }
    }
}

/// Health samples for a set of providers, taken at one instant
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    samples: HashMap<ProviderId, HealthSample>,
}

impl HealthSnapshot {
    /// Sample for `provider`
    #[must_use]
    pub fn get(&self, provider: &ProviderId) -> Option<&HealthSample> {
        self.samples.get(provider)
    }

    /// Rolling latency of `provider`, if any sample exists
    #[must_use]
    pub fn latency(&self, provider: &ProviderId) -> Option<Duration> {
        self.get(provider).and_then(|s| s.rolling_avg_latency)
    }

    /// In-flight count of `provider` (zero if unknown)
    #[must_use]
    pub fn in_flight(&self, provider: &ProviderId) -> u32 {
        self.get(provider).map_or(0, |s| s.in_flight)
    }

    /// Number of providers in the snapshot
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the snapshot is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl FromIterator<(ProviderId, HealthSample)> for HealthSnapshot {
    fn from_iter<I: IntoIterator<Item = (ProviderId, HealthSample)>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug)]
struct Stats {
    avg_latency: Option<Duration>,
    available: bool,
    updated_at: Option<Instant>,
}

#[derive(Debug)]
struct ProviderHealth {
    in_flight: Arc<AtomicU32>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    stats: Mutex<Stats>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU32::new(0)),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            stats: Mutex::new(Stats {
                avg_latency: None,
                available: true,
                updated_at: None,
            }),
        }
    }

    fn sample(&self) -> HealthSample {
        let stats = self.stats.lock();
        HealthSample {
            rolling_avg_latency: stats.avg_latency,
            in_flight: self.in_flight.load(Ordering::Acquire),
            last_known_available: stats.available,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            last_updated: stats.updated_at.map(|at| at.elapsed()),
        }
    }
}

/// Decrements a provider's in-flight count when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Rolling latency and availability per provider
#[derive(Debug)]
pub struct ProviderHealthRegistry {
    providers: DashMap<ProviderId, Arc<ProviderHealth>>,
    smoothing: f64,
}

impl Default for ProviderHealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderHealthRegistry {
    /// Create a registry with the default smoothing factor
    #[must_use]
    pub fn new() -> Self {
        Self::with_smoothing(DEFAULT_SMOOTHING)
    }

    /// Create a registry with an explicit EWMA weight in `(0, 1]`
    #[must_use]
    pub fn with_smoothing(smoothing: f64) -> Self {
        Self {
            providers: DashMap::new(),
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
        }
    }

    fn entry(&self, provider: &ProviderId) -> Arc<ProviderHealth> {
        if let Some(health) = self.providers.get(provider) {
            return Arc::clone(health.value());
        }
        Arc::clone(
            self.providers
                .entry(provider.clone())
                .or_insert_with(|| Arc::new(ProviderHealth::new()))
                .value(),
        )
    }

    /// Mark a request as started; the returned guard ends it
    pub fn begin_request(&self, provider: &ProviderId) -> InFlightGuard {
        let counter = Arc::clone(&self.entry(provider).in_flight);
        counter.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { counter }
    }

    /// Fold a call outcome into the provider's health
    pub fn record_outcome(&self, outcome: &RequestOutcome) {
        if outcome.error_class == Some(ErrorClass::Cancelled) {
            return;
        }

        let health = self.entry(&outcome.provider);
        health.total_requests.fetch_add(1, Ordering::Relaxed);
        if !outcome.success {
            health.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut stats = health.stats.lock();
        stats.avg_latency = Some(match stats.avg_latency {
            None => outcome.latency,
            Some(avg) => {
                let avg = avg.as_secs_f64();
                let next = avg + self.smoothing * (outcome.latency.as_secs_f64() - avg);
                Duration::from_secs_f64(next.max(0.0))
            }
        });
        // Permanent errors say nothing about reachability.
        if outcome.success {
            stats.available = true;
        } else if outcome.error_class == Some(ErrorClass::Transient) {
            stats.available = false;
        }
        stats.updated_at = Some(Instant::now());
    }

    /// Record the result of an out-of-band health probe
    pub fn record_probe(&self, provider: &ProviderId, available: bool) {
        let health = self.entry(provider);
        let mut stats = health.stats.lock();
        stats.available = available;
        stats.updated_at = Some(Instant::now());
    }

    /// Current sample for `provider`
    #[must_use]
    pub fn sample(&self, provider: &ProviderId) -> Option<HealthSample> {
        self.providers.get(provider).map(|h| h.value().sample())
    }

    /// Samples for every known provider
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        self.providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().sample()))
            .collect()
    }

    /// Drop providers no longer configured
    pub fn retain(&self, providers: &[ProviderId]) {
        self.providers.retain(|id, _| providers.contains(id));
    }
}

/// Periodically probes every active provider and publishes availability.
///
/// Runs as an independent task, off the request path.
pub struct HealthPoller {
    catalog: Arc<ProviderCatalog>,
    registry: Arc<ProviderHealthRegistry>,
    metrics: Arc<dyn MetricsSink>,
    interval_ms: AtomicU64,
}

impl fmt::Debug for HealthPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthPoller")
            .field("interval", &self.interval())
            .finish_non_exhaustive()
    }
}

impl HealthPoller {
    /// Create a poller
    #[must_use]
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        registry: Arc<ProviderHealthRegistry>,
        metrics: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Self {
        Self {
            catalog,
            registry,
            metrics,
            interval_ms: AtomicU64::new(interval.as_millis() as u64),
        }
    }

    /// Change the polling period; takes effect after the current wait
    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed).max(1))
    }

    /// Probe every active provider once, concurrently
    pub async fn poll_once(&self, cancel: &CancellationToken) {
        let probes = self.catalog.active().into_iter().map(|(descriptor, client)| {
            let cancel = cancel.child_token();
            async move {
                let healthy = tokio::time::timeout(descriptor.timeout, client.is_healthy(&cancel))
                    .await
                    .unwrap_or(false);
                (descriptor.id.clone(), healthy)
            }
        });

        for (provider, healthy) in futures::future::join_all(probes).await {
            if cancel.is_cancelled() {
                return;
            }
            if !healthy {
                warn!(provider = %provider, "Health probe failed");
            }
            self.registry.record_probe(&provider, healthy);
            self.metrics.update_provider_availability(&provider, healthy);
        }
    }

    /// Poll until `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval().as_millis() as u64, "Health poller started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = self.poll_once(&cancel) => {}
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.interval()) => {}
                }
            }
            debug!("Health poller stopped");
        })
    }
}
