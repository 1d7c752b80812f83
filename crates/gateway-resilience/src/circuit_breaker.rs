//! Circuit breaker pattern implementation.
//!
//! The circuit breaker prevents cascading failures by stopping requests
//! to a failing provider and allowing it time to recover.
//!
//! All counter mutation for one provider happens under that breaker's own
//! mutex; breakers for different providers never contend. The current phase
//! is mirrored into an atomic so `state()` reads are lock-free.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use gateway_config::CircuitBreakerConfig;
use gateway_core::ProviderId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed = 0,
    /// Circuit is open, requests are rejected
    Open = 1,
    /// Circuit is half-open, a limited number of probes test recovery
    HalfOpen = 2,
}

impl CircuitState {
    /// Stable lowercase label for logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Mutable breaker state, guarded by the breaker mutex
#[derive(Debug)]
struct BreakerState {
    phase: CircuitState,
    window_start: Instant,
    request_count: u32,
    failure_count: u32,
    half_open_probes_issued: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    /// Bumped on every phase transition so outcomes of calls admitted in an
    /// earlier phase are ignored
    generation: u64,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            phase: CircuitState::Closed,
            window_start: now,
            request_count: 0,
            failure_count: 0,
            half_open_probes_issued: 0,
            half_open_successes: 0,
            opened_at: None,
            generation: 0,
        }
    }

    fn roll_window(&mut self, now: Instant, sampling: Duration) {
        if now.saturating_duration_since(self.window_start) >= sampling {
            self.window_start = now;
            self.request_count = 0;
            self.failure_count = 0;
        }
    }
}

/// Outcome of a successful admission check
#[derive(Debug)]
pub enum CallPermit {
    /// Breaker is closed; carries the generation the call was admitted under
    Normal {
        /// Breaker generation at admission
        generation: u64,
    },
    /// Breaker is half-open and one probe slot was reserved
    Probe(ProbeReservation),
}

impl CallPermit {
    /// Whether this permit is a half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        matches!(self, Self::Probe(_))
    }

    /// Report the call outcome to `breaker`.
    ///
    /// Outcomes of calls admitted before the breaker last changed phase are
    /// dropped.
    pub fn complete(self, breaker: &CircuitBreaker, success: bool) {
        match self {
            Self::Normal { generation } => breaker.complete_call(generation, success),
            Self::Probe(probe) if success => probe.record_success(),
            Self::Probe(probe) => probe.record_failure(),
        }
    }
}

/// Result of the admission check
enum Admission {
    Normal(u64),
    Probe(u64),
}

/// A reserved half-open probe slot.
///
/// Recording an outcome consumes the reservation. Dropping it unused
/// (candidate never tried, request cancelled) returns the slot.
#[derive(Debug)]
pub struct ProbeReservation {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    completed: bool,
}

impl ProbeReservation {
    /// Provider the probe belongs to
    #[must_use]
    pub fn provider_id(&self) -> &ProviderId {
        &self.breaker.provider_id
    }

    /// Record a successful probe
    pub fn record_success(mut self) {
        self.completed = true;
        self.breaker.complete_call(self.generation, true);
    }

    /// Record a failed probe
    pub fn record_failure(mut self) {
        self.completed = true;
        self.breaker.complete_call(self.generation, false);
    }
}

impl Drop for ProbeReservation {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.release_probe(self.generation);
        }
    }
}

/// Circuit breaker for a single provider
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Provider identifier
    provider_id: ProviderId,
    /// Configuration (replaceable at runtime)
    config: ArcSwap<CircuitBreakerConfig>,
    /// Current phase (atomic for lock-free reads)
    phase: AtomicU8,
    /// Counters, serialized per provider
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(provider_id: impl Into<ProviderId>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config: ArcSwap::from_pointee(config),
            phase: AtomicU8::new(CircuitState::Closed as u8),
            state: Mutex::new(BreakerState::new(Instant::now())),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(provider_id: impl Into<ProviderId>) -> Self {
        Self::new(provider_id, CircuitBreakerConfig::default())
    }

    /// Get the provider ID
    #[must_use]
    pub fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.phase.load(Ordering::Acquire))
    }

    /// Replace the configuration; live counters are kept
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        self.config.store(Arc::new(config));
    }

    /// Check whether a call may proceed.
    ///
    /// Open transitions to HalfOpen once `duration_of_break` has elapsed.
    /// In HalfOpen a probe slot is reserved as part of the check; the caller
    /// owes the breaker an outcome for every `true` returned in that phase.
    /// Prefer [`CircuitBreaker::try_acquire`], which tracks the slot for you.
    pub fn allow_request(&self) -> bool {
        self.admit().is_some()
    }

    /// Check whether a call may proceed, returning a permit that tracks any
    /// reserved half-open probe slot
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        match self.admit()? {
            Admission::Normal(generation) => Some(CallPermit::Normal { generation }),
            Admission::Probe(generation) => Some(CallPermit::Probe(ProbeReservation {
                breaker: Arc::clone(self),
                generation,
                completed: false,
            })),
        }
    }

    fn admit(&self) -> Option<Admission> {
        let config = self.config.load();
        let now = Instant::now();
        let mut state = self.state.lock();

        match state.phase {
            CircuitState::Closed => Some(Admission::Normal(state.generation)),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                if elapsed < config.duration_of_break {
                    return None;
                }
                self.transition(&mut state, CircuitState::HalfOpen, now);
                state.half_open_probes_issued = 1;
                Some(Admission::Probe(state.generation))
            }
            CircuitState::HalfOpen => {
                if state.half_open_probes_issued < config.permitted_calls_in_half_open {
                    state.half_open_probes_issued += 1;
                    debug!(
                        provider = %self.provider_id,
                        issued = state.half_open_probes_issued,
                        permitted = config.permitted_calls_in_half_open,
                        "Circuit breaker probe reserved"
                    );
                    Some(Admission::Probe(state.generation))
                } else {
                    None
                }
            }
        }
    }

    /// Record a successful request in the current phase
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        self.on_success(&mut state, Instant::now());
    }

    /// Record a failed request in the current phase
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        self.on_failure(&mut state, Instant::now());
    }

    fn on_success(&self, state: &mut BreakerState, now: Instant) {
        match state.phase {
            CircuitState::Closed => {
                state.roll_window(now, self.config.load().sampling_duration);
                state.request_count = state.request_count.saturating_add(1);
            }
            CircuitState::HalfOpen => {
                state.half_open_successes += 1;
                self.maybe_close(state, now);
            }
            CircuitState::Open => {
                // Outcome of a call admitted before the circuit opened
            }
        }
    }

    fn on_failure(&self, state: &mut BreakerState, now: Instant) {
        match state.phase {
            CircuitState::Closed => {
                let config = self.config.load();
                state.roll_window(now, config.sampling_duration);
                state.request_count = state.request_count.saturating_add(1);
                state.failure_count = state.failure_count.saturating_add(1);

                if state.request_count >= config.minimum_throughput {
                    let ratio = f64::from(state.failure_count) / f64::from(state.request_count);
                    if ratio >= config.failure_threshold {
                        debug!(
                            provider = %self.provider_id,
                            failures = state.failure_count,
                            requests = state.request_count,
                            threshold = config.failure_threshold,
                            "Circuit breaker failure threshold reached"
                        );
                        self.transition(state, CircuitState::Open, now);
                    }
                }
            }
            CircuitState::HalfOpen => {
                debug!(
                    provider = %self.provider_id,
                    "Circuit breaker half-open failure, reopening"
                );
                self.transition(state, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Record the outcome of a call admitted under `generation`.
    ///
    /// A call admitted while Closed may finish after the breaker opened and
    /// went half-open; its outcome is not a probe result and is ignored.
    pub fn complete_call(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(
                provider = %self.provider_id,
                phase = state.phase.as_str(),
                "Ignoring outcome from an earlier breaker phase"
            );
            return;
        }
        if success {
            self.on_success(&mut state, now);
        } else {
            self.on_failure(&mut state, now);
        }
    }

    fn release_probe(&self, generation: u64) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.generation != generation || state.phase != CircuitState::HalfOpen {
            return;
        }
        state.half_open_probes_issued = state.half_open_probes_issued.saturating_sub(1);
        debug!(
            provider = %self.provider_id,
            issued = state.half_open_probes_issued,
            "Circuit breaker probe released unused"
        );
        self.maybe_close(&mut state, now);
    }

    fn maybe_close(&self, state: &mut BreakerState, now: Instant) {
        if state.half_open_probes_issued > 0
            && state.half_open_successes >= state.half_open_probes_issued
        {
            self.transition(state, CircuitState::Closed, now);
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = state.phase;
        state.phase = to;
        state.generation = state.generation.wrapping_add(1);
        state.half_open_probes_issued = 0;
        state.half_open_successes = 0;
        self.phase.store(to as u8, Ordering::Release);

        match to {
            CircuitState::Open => {
                state.opened_at = Some(now);
                warn!(
                    provider = %self.provider_id,
                    from = from.as_str(),
                    failures = state.failure_count,
                    requests = state.request_count,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(provider = %self.provider_id, "Circuit breaker half-open, testing");
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.window_start = now;
                state.request_count = 0;
                state.failure_count = 0;
                info!(provider = %self.provider_id, "Circuit breaker closed");
            }
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.transition(&mut state, CircuitState::Closed, Instant::now());
    }

    /// Force the circuit open (for manual intervention)
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        self.transition(&mut state, CircuitState::Open, Instant::now());
    }

    /// Get current statistics
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            state: state.phase,
            failure_count: state.failure_count,
            request_count: state.request_count,
            half_open_probes_issued: state.half_open_probes_issued,
            half_open_successes: state.half_open_successes,
            open_for: state
                .opened_at
                .map(|at| Instant::now().saturating_duration_since(at)),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Failures in the current sampling window
    pub failure_count: u32,
    /// Requests in the current sampling window
    pub request_count: u32,
    /// Probe slots reserved in the current half-open phase
    pub half_open_probes_issued: u32,
    /// Successful probes in the current half-open phase
    pub half_open_successes: u32,
    /// Time since the circuit last opened, if open or half-open
    pub open_for: Option<Duration>,
}

impl CircuitBreakerStats {
    /// Calculate failure rate
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            f64::from(self.failure_count) / f64::from(self.request_count)
        }
    }
}

/// Registry of per-provider circuit breakers.
///
/// Owned by the composition root; breakers are created on first use and
/// live for the life of the registry.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<ProviderId, Arc<CircuitBreaker>>,
    config: ArcSwap<CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config: ArcSwap::from_pointee(config),
        }
    }

    /// Breaker for `provider`, created on first use
    pub fn get_or_create(&self, provider: &ProviderId) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(provider) {
            return Arc::clone(breaker.value());
        }
        let breaker = self
            .breakers
            .entry(provider.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider.clone(),
                    CircuitBreakerConfig::clone(&self.config.load()),
                ))
            });
        Arc::clone(breaker.value())
    }

    /// Breaker for `provider`, if one exists
    #[must_use]
    pub fn get(&self, provider: &ProviderId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(provider).map(|b| Arc::clone(b.value()))
    }

    /// Current state of `provider` (Closed if never seen)
    #[must_use]
    pub fn state(&self, provider: &ProviderId) -> CircuitState {
        self.get(provider)
            .map_or(CircuitState::Closed, |breaker| breaker.state())
    }

    /// Apply a new configuration to every breaker
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        for breaker in &self.breakers {
            breaker.value().update_config(config.clone());
        }
        self.config.store(Arc::new(config));
    }

    /// Statistics for every known breaker
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ProviderId, CircuitBreakerStats)> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Drop breakers for providers no longer configured
    pub fn retain(&self, providers: &[ProviderId]) {
        self.breakers.retain(|id, _| providers.contains(id));
    }
}
