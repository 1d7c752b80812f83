//! Request orchestration.
//!
//! One call to [`ProviderOrchestrator::execute`] walks
//! `Admitting -> Selecting -> Trying(i) -> {Succeeded | NextCandidate | Exhausted | RateLimited}`.
//! Candidates are tried strictly one after another in the order the
//! failover manager produced.

use crate::catalog::ProviderCatalog;
use crate::failover::{FailoverManager, SkipReason, SkippedProvider, TryCandidate};
use crate::health::{HealthSample, ProviderHealthRegistry};
use crate::selector::ProviderSelector;
use arc_swap::ArcSwap;
use gateway_config::{GatewayConfig, RateLimitConfig, RateLimitPolicy};
use gateway_core::{
    Capability, GatewayError, GatewayRequest, GatewayResponse, GatewayResult, MetricsSink,
    NoopMetricsSink, ProviderClient, ProviderDescriptor, ProviderFailure, ProviderId,
    RequestOutcome, RequestRecord,
};
use gateway_resilience::{
    pool_key, tenant_key, CircuitBreakerRegistry, CircuitState,
    RateLimiter, RetryExecutor, RetryResult,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time view of one configured provider
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    /// Provider id
    pub id: ProviderId,
    /// Whether the provider takes traffic
    pub enabled: bool,
    /// Routing priority
    pub priority: u32,
    /// Circuit breaker state
    pub circuit: CircuitState,
    /// Time left on the failover blacklist
    pub blacklisted_for: Option<Duration>,
    /// Latest health sample
    pub health: Option<HealthSample>,
    /// Consecutive failures counted toward the blacklist
    pub consecutive_failures: u32,
}

/// How one candidate ended when it did not return a response
enum CandidateError {
    Failed(ProviderFailure),
    Cancelled,
}

/// Routes requests across providers with admission control, retries,
/// circuit breaking and failover
pub struct ProviderOrchestrator {
    catalog: Arc<ProviderCatalog>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<ProviderHealthRegistry>,
    failover: Arc<FailoverManager>,
    retry: Arc<RetryExecutor>,
    rate_limiter: Option<Arc<RateLimiter>>,
    rate_limit: ArcSwap<RateLimitConfig>,
    metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for ProviderOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderOrchestrator")
            .field("catalog", &self.catalog)
            .field("strategy", &self.failover.selector().kind())
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl ProviderOrchestrator {
    /// Start building an orchestrator from `config`
    #[must_use]
    pub fn builder(config: GatewayConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Provider catalog
    #[must_use]
    pub fn catalog(&self) -> &Arc<ProviderCatalog> {
        &self.catalog
    }

    /// Circuit breaker registry
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Health registry
    #[must_use]
    pub fn health(&self) -> &Arc<ProviderHealthRegistry> {
        &self.health
    }

    /// Failover manager
    #[must_use]
    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    /// Rate limiter, when admission control is wired
    #[must_use]
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Execute `request` against the providers serving `capability`.
    ///
    /// # Errors
    /// - `GatewayError::RateLimit` when admission is denied; no provider is called
    /// - `GatewayError::AllProvidersFailed` when no candidate returned a response
    /// - `GatewayError::Cancelled` when `cancel` fires
    pub async fn execute(
        &self,
        request: &GatewayRequest,
        capability: Capability,
        cancel: &CancellationToken,
    ) -> GatewayResult<GatewayResponse> {
        let started = Instant::now();
        debug!(
            request_id = %request.id,
            tenant = %request.tenant,
            model = %request.model,
            capability = %capability,
            "Request started"
        );

        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        if let Err(error) = self.admit(request, capability, cancel).await {
            self.report(request, None, started, false, 0);
            return Err(error);
        }

        let (candidates, skipped) = self
            .failover
            .build_try_order(request, capability)
            .into_parts();
        if candidates.is_empty() {
            warn!(
                request_id = %request.id,
                capability = %capability,
                skipped = skipped.len(),
                "No provider available"
            );
            self.report(request, None, started, false, 0);
            return Err(all_providers_failed(Vec::new(), &skipped));
        }

        let mut failures: Vec<ProviderFailure> = Vec::with_capacity(candidates.len());
        let mut candidates = candidates.into_iter();
        while let Some(candidate) = candidates.next() {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            let provider = candidate.provider_id().clone();
            match self.try_candidate(request, candidate, cancel).await {
                Ok(response) => {
                    self.account_usage(request, &response, cancel).await;
                    self.report(request, Some(&provider), started, true, failures.len() + 1);
                    info!(
                        request_id = %request.id,
                        provider = %provider,
                        failovers = failures.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Request completed"
                    );
                    return Ok(response);
                }
                Err(CandidateError::Cancelled) => {
                    debug!(request_id = %request.id, provider = %provider, "Request cancelled");
                    return Err(GatewayError::Cancelled);
                }
                Err(CandidateError::Failed(failure)) => {
                    warn!(
                        request_id = %request.id,
                        provider = %provider,
                        attempts = failure.attempts,
                        error = %failure.error,
                        remaining = candidates.len(),
                        "Provider failed, moving to next candidate"
                    );
                    failures.push(failure);
                }
            }
        }

        let last = failures.last().map(|f| f.provider.clone());
        self.report(request, last.as_ref(), started, false, failures.len());
        warn!(
            request_id = %request.id,
            attempted = failures.len(),
            "All providers failed"
        );
        Err(all_providers_failed(failures, &skipped))
    }

    async fn admit(
        &self,
        request: &GatewayRequest,
        capability: Capability,
        cancel: &CancellationToken,
    ) -> GatewayResult<()> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        let config = self.rate_limit.load();
        if !config.enabled {
            return Ok(());
        }

        if let Some(policy) = &config.tenant {
            let key = tenant_key(&config.key_prefix, &request.tenant);
            check_key(limiter, &key, policy, request, cancel).await?;
        }
        if let Some(policy) = config.pool_policy(capability) {
            let key = pool_key(&config.key_prefix, capability);
            check_key(limiter, &key, policy, request, cancel).await?;
        }
        Ok(())
    }

    async fn try_candidate(
        &self,
        request: &GatewayRequest,
        candidate: TryCandidate,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, CandidateError> {
        let TryCandidate { descriptor, permit } = candidate;
        let provider = descriptor.id.clone();
        let breaker = self.breakers.get_or_create(&provider);

        let Some(client) = self.catalog.client(&provider) else {
            // Client unregistered after the try order was built.
            let error = GatewayError::internal(format!("no client registered for {provider}"));
            return Err(CandidateError::Failed(ProviderFailure {
                provider,
                error,
                attempts: 0,
            }));
        };

        let max_attempts = if permit.is_probe() {
            1
        } else {
            self.retry.config().max_retry_attempts
        };
        let _in_flight = self.health.begin_request(&provider);

        let (client, descriptor, health) = (&client, &descriptor, &*self.health);
        let result = self
            .retry
            .execute_with_attempts(
                move |attempt| attempt_once(client, descriptor, health, request, attempt, cancel),
                GatewayError::is_retryable,
                cancel,
                max_attempts,
            )
            .await;

        match result {
            RetryResult::Success { value, attempts } => {
                permit.complete(&breaker, true);
                self.failover.record_success(&provider);
                debug!(provider = %provider, attempts = attempts, "Provider succeeded");
                Ok(value)
            }
            RetryResult::Failed { error, attempts } | RetryResult::NonRetryable { error, attempts } => {
                permit.complete(&breaker, false);
                self.failover.record_failure(&provider, &error);
                Err(CandidateError::Failed(ProviderFailure {
                    provider,
                    error,
                    attempts,
                }))
            }
            // The permit drops here; an unused probe slot is returned.
            RetryResult::Cancelled { .. } => Err(CandidateError::Cancelled),
        }
    }

    async fn account_usage(
        &self,
        request: &GatewayRequest,
        response: &GatewayResponse,
        cancel: &CancellationToken,
    ) {
        let Some(limiter) = &self.rate_limiter else {
            return;
        };
        let config = self.rate_limit.load();
        if !config.enabled || !config.usage_accounting {
            return;
        }

        let tenant = &request.tenant;
        let period = config.usage_period;
        limiter
            .increment_for_period(&format!("usage:requests:{tenant}"), 1, period, cancel)
            .await;
        if let Some(usage) = response.usage.filter(|u| u.total_tokens > 0) {
            limiter
                .increment_for_period(
                    &format!("usage:tokens:{tenant}"),
                    i64::from(usage.total_tokens),
                    period,
                    cancel,
                )
                .await;
        }
    }

    fn report(
        &self,
        request: &GatewayRequest,
        provider: Option<&ProviderId>,
        started: Instant,
        success: bool,
        providers_attempted: usize,
    ) {
        self.metrics.record_request(&RequestRecord {
            provider,
            model: &request.model,
            tenant: &request.tenant,
            duration: started.elapsed(),
            success,
            providers_attempted,
        });
    }

    /// Status of every configured provider, in configuration order
    #[must_use]
    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.catalog
            .descriptors()
            .iter()
            .map(|d| ProviderStatus {
                id: d.id.clone(),
                enabled: d.enabled,
                priority: d.priority,
                circuit: self.breakers.state(&d.id),
                blacklisted_for: self.failover.blacklist_remaining(&d.id),
                health: self.health.sample(&d.id),
                consecutive_failures: self.failover.consecutive_failures(&d.id),
            })
            .collect()
    }

    /// Apply a reloaded configuration.
    ///
    /// Live breaker, blacklist and health state is kept for providers that
    /// remain configured.
    pub fn apply_config(&self, config: &GatewayConfig) {
        let ids: Vec<ProviderId> = config.providers.iter().map(|p| p.id.clone()).collect();

        self.catalog.update_descriptors(config.providers.clone());
        self.breakers.update_config(config.circuit_breaker.clone());
        self.breakers.retain(&ids);
        self.health.retain(&ids);
        self.retry.update_config(config.retry.clone());
        self.failover.update_config(config.routing.clone());
        self.rate_limit.store(Arc::new(config.rate_limit.clone()));
        if let Some(limiter) = &self.rate_limiter {
            limiter.set_operation_timeout(config.store.operation_timeout);
        }

        info!(
            providers = ids.len(),
            strategy = %config.routing.strategy,
            "Configuration applied"
        );
    }
}

async fn check_key(
    limiter: &RateLimiter,
    key: &str,
    policy: &RateLimitPolicy,
    request: &GatewayRequest,
    cancel: &CancellationToken,
) -> GatewayResult<()> {
    let result = limiter
        .check(key, policy, request.tokens_required(), cancel)
        .await?;
    if result.allowed {
        return Ok(());
    }
    warn!(
        request_id = %request.id,
        key = %key,
        limit = result.limit,
        retry_after_ms = result.retry_after.map(|d| d.as_millis() as u64),
        "Rate limit exceeded"
    );
    Err(GatewayError::rate_limit(key, result.retry_after))
}

/// One provider call bounded by the provider timeout and `cancel`
async fn attempt_once(
    client: &Arc<dyn ProviderClient>,
    descriptor: &ProviderDescriptor,
    health: &ProviderHealthRegistry,
    request: &GatewayRequest,
    attempt: u32,
    cancel: &CancellationToken,
) -> GatewayResult<GatewayResponse> {
    let started = Instant::now();
    debug!(provider = %descriptor.id, attempt = attempt, "Calling provider");

    let result = tokio::select! {
        () = cancel.cancelled() => Err(GatewayError::Cancelled),
        outcome = tokio::time::timeout(descriptor.timeout, client.execute(request, cancel)) => {
            outcome.unwrap_or_else(|_| Err(GatewayError::timeout(descriptor.timeout)))
        }
    };

    let latency = started.elapsed();
    let outcome = match &result {
        Ok(_) => RequestOutcome::success(descriptor.id.clone(), latency),
        Err(error) => RequestOutcome::failure(descriptor.id.clone(), latency, error.class()),
    };
    health.record_outcome(&outcome);
    result
}

/// Aggregate failure; skipped providers are folded in only when nothing
/// was attempted
fn all_providers_failed(mut attempts: Vec<ProviderFailure>, skipped: &[SkippedProvider]) -> GatewayError {
    if attempts.is_empty() {
        attempts = skipped
            .iter()
            .map(|s| ProviderFailure {
                provider: s.provider.clone(),
                error: GatewayError::CircuitBreakerOpen {
                    provider: s.provider.to_string(),
                    last_error: match s.reason {
                        SkipReason::CircuitOpen => s.last_error.clone(),
                        SkipReason::Blacklisted => Some(s.last_error.clone().map_or_else(
                            || "blacklisted".to_string(),
                            |e| format!("blacklisted: {e}"),
                        )),
                    },
                },
                attempts: 0,
            })
            .collect();
    }
    GatewayError::AllProvidersFailed { attempts }
}

/// Builder for [`ProviderOrchestrator`]
pub struct OrchestratorBuilder {
    config: GatewayConfig,
    clients: Vec<Arc<dyn ProviderClient>>,
    health: Option<Arc<ProviderHealthRegistry>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl OrchestratorBuilder {
    /// Create a builder from `config`
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            clients: Vec::new(),
            health: None,
            rate_limiter: None,
            metrics: None,
        }
    }

    /// Register a provider client
    #[must_use]
    pub fn client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.push(client);
        self
    }

    /// Register several provider clients
    #[must_use]
    pub fn clients(mut self, clients: impl IntoIterator<Item = Arc<dyn ProviderClient>>) -> Self {
        self.clients.extend(clients);
        self
    }

    /// Share an existing health registry (e.g. with a health poller)
    #[must_use]
    pub fn health_registry(mut self, health: Arc<ProviderHealthRegistry>) -> Self {
        self.health = Some(health);
        self
    }

    /// Enable admission control and usage accounting
    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Set the metrics sink
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the orchestrator
    ///
    /// # Errors
    /// Returns `GatewayError::Configuration` if the configuration is invalid
    pub fn build(self) -> GatewayResult<ProviderOrchestrator> {
        self.config
            .validate_all()
            .map_err(|e| GatewayError::configuration(e.to_string()))?;

        let GatewayConfig {
            providers,
            circuit_breaker,
            retry,
            routing,
            rate_limit,
            store,
        } = self.config;

        let catalog = Arc::new(ProviderCatalog::new(providers));
        for client in self.clients {
            catalog.register_client(client);
        }

        let breakers = Arc::new(CircuitBreakerRegistry::new(circuit_breaker));
        let health = self
            .health
            .unwrap_or_else(|| Arc::new(ProviderHealthRegistry::new()));
        let failover = Arc::new(FailoverManager::new(
            Arc::clone(&catalog),
            Arc::new(ProviderSelector::new(routing.strategy)),
            Arc::clone(&breakers),
            Arc::clone(&health),
            routing,
        ));
        if let Some(limiter) = &self.rate_limiter {
            limiter.set_operation_timeout(store.operation_timeout);
        }

        Ok(ProviderOrchestrator {
            catalog,
            breakers,
            health,
            failover,
            retry: Arc::new(RetryExecutor::new(retry)),
            rate_limiter: self.rate_limiter,
            rate_limit: ArcSwap::from_pointee(rate_limit),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetricsSink)),
        })
    }
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("providers", &self.config.providers.len())
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}
