//! Failover management.
//!
//! Turns the selector's ordering into the try order for one request by
//! removing blacklisted providers and providers whose circuit breaker
//! refuses the call. The blacklist is fed by a consecutive-failure counter
//! kept independently of the breaker.

use crate::catalog::ProviderCatalog;
use crate::health::ProviderHealthRegistry;
use crate::selector::ProviderSelector;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use gateway_config::RoutingConfig;
use gateway_core::{Capability, GatewayError, GatewayRequest, ProviderDescriptor, ProviderId};
use gateway_resilience::{CallPermit, CircuitBreakerRegistry};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a provider was left out of a try order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Blacklist entry has not expired
    Blacklisted,
    /// Circuit breaker refused the call
    CircuitOpen,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Blacklisted => "blacklisted",
            Self::CircuitOpen => "circuit_open",
        })
    }
}

/// A provider excluded from a try order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedProvider {
    /// Provider excluded
    pub provider: ProviderId,
    /// Exclusion reason
    pub reason: SkipReason,
    /// Last error recorded for the provider
    pub last_error: Option<String>,
}

/// One provider to try, with the breaker permit that admitted it
#[derive(Debug)]
pub struct TryCandidate {
    /// Provider descriptor
    pub descriptor: Arc<ProviderDescriptor>,
    /// Breaker admission; a half-open probe gets a single attempt
    pub permit: CallPermit,
}

impl TryCandidate {
    /// Provider id
    #[must_use]
    pub fn provider_id(&self) -> &ProviderId {
        &self.descriptor.id
    }

    /// Whether this candidate is a half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.permit.is_probe()
    }

    /// Attempt budget given the configured retry budget
    #[must_use]
    pub fn max_attempts(&self, configured: u32) -> u32 {
        if self.is_probe() {
            1
        } else {
            configured
        }
    }
}

/// Ordered candidates for one request, computed once and consumed in order.
///
/// Dropping unconsumed candidates returns any reserved probe slots.
#[derive(Debug, Default)]
pub struct TryOrder {
    candidates: Vec<TryCandidate>,
    skipped: Vec<SkippedProvider>,
}

impl TryOrder {
    /// Whether no provider can be tried
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Number of candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Candidate ids in try order
    #[must_use]
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.candidates.iter().map(|c| c.descriptor.id.clone()).collect()
    }

    /// Providers filtered out
    #[must_use]
    pub fn skipped(&self) -> &[SkippedProvider] {
        &self.skipped
    }

    /// Split into candidates and skipped providers
    #[must_use]
    pub fn into_parts(self) -> (Vec<TryCandidate>, Vec<SkippedProvider>) {
        (self.candidates, self.skipped)
    }
}

#[derive(Debug, Clone)]
struct BlacklistEntry {
    until: Instant,
    reason: String,
}

#[derive(Debug, Default)]
struct FailureRecord {
    consecutive: u32,
    last_error: Option<String>,
}

/// Snapshot of one blacklist entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistInfo {
    /// Provider excluded
    pub provider: ProviderId,
    /// Time until the entry expires
    pub remaining: Duration,
    /// Why the provider was blacklisted
    pub reason: String,
}

/// Builds try orders and maintains the failover blacklist
#[derive(Debug)]
pub struct FailoverManager {
    catalog: Arc<ProviderCatalog>,
    selector: Arc<ProviderSelector>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<ProviderHealthRegistry>,
    blacklist: DashMap<ProviderId, BlacklistEntry>,
    failures: DashMap<ProviderId, FailureRecord>,
    config: ArcSwap<RoutingConfig>,
}

impl FailoverManager {
    /// Create a failover manager
    #[must_use]
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        selector: Arc<ProviderSelector>,
        breakers: Arc<CircuitBreakerRegistry>,
        health: Arc<ProviderHealthRegistry>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            catalog,
            selector,
            breakers,
            health,
            blacklist: DashMap::new(),
            failures: DashMap::new(),
            config: ArcSwap::from_pointee(config),
        }
    }

    /// Replace the routing configuration; live blacklist entries are kept
    pub fn update_config(&self, config: RoutingConfig) {
        self.selector.set_strategy(config.strategy);
        self.config.store(Arc::new(config));
    }

    /// Selector used for ordering
    #[must_use]
    pub fn selector(&self) -> &Arc<ProviderSelector> {
        &self.selector
    }

    /// Compute the try order for `request`.
    ///
    /// An empty result means no provider is available; it is not an error.
    #[must_use]
    pub fn build_try_order(&self, request: &GatewayRequest, capability: Capability) -> TryOrder {
        let mut candidates = self.catalog.candidates(capability);
        if let Some(forced) = &request.force_provider {
            candidates.retain(|d| &d.id == forced);
            debug!(provider = %forced, found = !candidates.is_empty(), "Routing pinned to provider");
        }

        let snapshot = self.health.snapshot();
        let ordered = self.selector.select(candidates, capability, &snapshot);

        let now = Instant::now();
        let mut order = TryOrder::default();
        for descriptor in ordered {
            let id = descriptor.id.clone();

            if self.is_blacklisted_at(&id, now) {
                order.skipped.push(SkippedProvider {
                    last_error: self.last_error(&id),
                    provider: id,
                    reason: SkipReason::Blacklisted,
                });
                continue;
            }

            match self.breakers.get_or_create(&id).try_acquire() {
                Some(permit) => order.candidates.push(TryCandidate { descriptor, permit }),
                None => order.skipped.push(SkippedProvider {
                    last_error: self.last_error(&id),
                    provider: id,
                    reason: SkipReason::CircuitOpen,
                }),
            }
        }

        debug!(
            request_id = %request.id,
            candidates = order.len(),
            skipped = order.skipped.len(),
            "Try order built"
        );
        order
    }

    fn is_blacklisted_at(&self, provider: &ProviderId, now: Instant) -> bool {
        let expired = match self.blacklist.get(provider) {
            None => return false,
            Some(entry) => now >= entry.until,
        };
        if expired {
            self.blacklist.remove_if(provider, |_, entry| now >= entry.until);
            info!(provider = %provider, "Provider blacklist expired");
        }
        !expired
    }

    /// Whether `provider` is currently blacklisted
    #[must_use]
    pub fn is_blacklisted(&self, provider: &ProviderId) -> bool {
        self.is_blacklisted_at(provider, Instant::now())
    }

    /// Time until `provider` leaves the blacklist
    #[must_use]
    pub fn blacklist_remaining(&self, provider: &ProviderId) -> Option<Duration> {
        let now = Instant::now();
        self.blacklist
            .get(provider)
            .filter(|entry| entry.until > now)
            .map(|entry| entry.until - now)
    }

    /// Reset the consecutive-failure count after a success
    pub fn record_success(&self, provider: &ProviderId) {
        self.failures.remove(provider);
    }

    /// Count a failure; returns true if it blacklisted the provider
    pub fn record_failure(&self, provider: &ProviderId, error: &GatewayError) -> bool {
        let config = self.config.load();
        let reached = {
            let mut record = self.failures.entry(provider.clone()).or_default();
            record.consecutive = record.consecutive.saturating_add(1);
            record.last_error = Some(error.to_string());
            debug!(
                provider = %provider,
                consecutive = record.consecutive,
                threshold = config.failover_threshold,
                "Provider failure recorded"
            );
            record.consecutive >= config.failover_threshold
        };

        if reached {
            self.insert_blacklist(
                provider,
                config.blacklist_duration,
                format!("{} consecutive failures", config.failover_threshold),
            );
        }
        reached
    }

    /// Consecutive failures since the last success
    #[must_use]
    pub fn consecutive_failures(&self, provider: &ProviderId) -> u32 {
        self.failures.get(provider).map_or(0, |r| r.consecutive)
    }

    /// Last error recorded for `provider`
    #[must_use]
    pub fn last_error(&self, provider: &ProviderId) -> Option<String> {
        self.failures
            .get(provider)
            .and_then(|r| r.last_error.clone())
    }

    fn insert_blacklist(&self, provider: &ProviderId, duration: Duration, reason: String) {
        warn!(
            provider = %provider,
            duration_secs = duration.as_secs(),
            reason = %reason,
            "Provider blacklisted"
        );
        self.blacklist.insert(
            provider.clone(),
            BlacklistEntry {
                until: Instant::now() + duration,
                reason,
            },
        );
        // Keep the last error for diagnostics, restart the count.
        if let Some(mut record) = self.failures.get_mut(provider) {
            record.consecutive = 0;
        }
    }

    /// Blacklist `provider` manually
    pub fn blacklist(&self, provider: &ProviderId, duration: Duration, reason: impl Into<String>) {
        self.insert_blacklist(provider, duration, reason.into());
    }

    /// Remove `provider` from the blacklist and reset its failure count
    pub fn unblacklist(&self, provider: &ProviderId) {
        if self.blacklist.remove(provider).is_some() {
            info!(provider = %provider, "Provider removed from blacklist");
        }
        self.failures.remove(provider);
    }

    /// Live blacklist entries; expired entries are pruned
    #[must_use]
    pub fn blacklisted(&self) -> Vec<BlacklistInfo> {
        let now = Instant::now();
        self.blacklist.retain(|_, entry| entry.until > now);

        let mut entries: Vec<_> = self
            .blacklist
            .iter()
            .map(|entry| BlacklistInfo {
                provider: entry.key().clone(),
                remaining: entry.until - now,
                reason: entry.reason.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.provider.cmp(&b.provider));
        entries
    }
}
