//! Provider selector: applies the configured strategy to a candidate set.

use crate::health::HealthSnapshot;
use crate::strategy::{strategy_for, SelectionContext, SelectionStrategy};
use arc_swap::ArcSwap;
use gateway_config::RoutingStrategy;
use gateway_core::{Capability, ProviderDescriptor, ProviderId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Orders candidates with a swappable strategy
#[derive(Debug)]
pub struct ProviderSelector {
    strategy: ArcSwap<Box<dyn SelectionStrategy>>,
}

impl ProviderSelector {
    /// Create a selector for `kind`
    #[must_use]
    pub fn new(kind: RoutingStrategy) -> Self {
        Self {
            strategy: ArcSwap::from_pointee(strategy_for(kind)),
        }
    }

    /// Create a selector around a custom strategy
    #[must_use]
    pub fn with_strategy(strategy: Box<dyn SelectionStrategy>) -> Self {
        Self {
            strategy: ArcSwap::from_pointee(strategy),
        }
    }

    /// Active strategy tag
    #[must_use]
    pub fn kind(&self) -> RoutingStrategy {
        self.strategy.load().kind()
    }

    /// Switch strategy; a no-op when unchanged so round robin keeps its cursor
    pub fn set_strategy(&self, kind: RoutingStrategy) {
        if self.kind() != kind {
            info!(strategy = %kind, "Routing strategy changed");
            self.strategy.store(Arc::new(strategy_for(kind)));
        }
    }

    /// Order `candidates` for a request needing `capability`.
    ///
    /// Duplicate provider ids are dropped (first occurrence wins). Health
    /// state is only read.
    #[must_use]
    pub fn select(
        &self,
        candidates: Vec<Arc<ProviderDescriptor>>,
        capability: Capability,
        health: &HealthSnapshot,
    ) -> Vec<Arc<ProviderDescriptor>> {
        let mut seen: HashSet<ProviderId> = HashSet::with_capacity(candidates.len());
        let unique: Vec<_> = candidates
            .into_iter()
            .filter(|d| seen.insert(d.id.clone()))
            .collect();

        let strategy = self.strategy.load();
        let ctx = SelectionContext { capability, health };
        let ordered = strategy.order(unique, &ctx);

        debug!(
            strategy = %strategy.kind(),
            capability = %capability,
            candidates = ordered.len(),
            "Candidates ordered"
        );
        ordered
    }
}

impl Default for ProviderSelector {
    fn default() -> Self {
        Self::new(RoutingStrategy::default())
    }
}
