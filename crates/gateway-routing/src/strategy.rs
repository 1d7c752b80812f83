//! Candidate ordering strategies.
//!
//! Every strategy is a pure ordering over the candidate set and a health
//! snapshot. Only round robin keeps state (its per-pool cursor).

use crate::health::HealthSnapshot;
use dashmap::DashMap;
use gateway_config::RoutingStrategy;
use gateway_core::{Capability, ProviderDescriptor};
use rand::seq::SliceRandom;
use std::cmp::Ordering as CmpOrdering;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Inputs shared by every strategy for one selection
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Capability the request needs; names the provider pool
    pub capability: Capability,
    /// Latest health samples
    pub health: &'a HealthSnapshot,
}

/// Orders candidates for one request
pub trait SelectionStrategy: Send + Sync + Debug {
    /// Strategy tag
    fn kind(&self) -> RoutingStrategy;

    /// Return `candidates` in try order
    fn order(
        &self,
        candidates: Vec<Arc<ProviderDescriptor>>,
        ctx: &SelectionContext<'_>,
    ) -> Vec<Arc<ProviderDescriptor>>;
}

/// Build the strategy for a configuration tag
#[must_use]
pub fn strategy_for(kind: RoutingStrategy) -> Box<dyn SelectionStrategy> {
    match kind {
        RoutingStrategy::PriorityWithFallback => Box::new(PriorityWithFallback),
        RoutingStrategy::RoundRobin => Box::new(RoundRobin::default()),
        RoutingStrategy::Random => Box::new(RandomOrder),
        RoutingStrategy::LeastLatency => Box::new(LeastLatency),
        RoutingStrategy::LeastLoad => Box::new(LeastLoad),
    }
}

fn by_priority(a: &ProviderDescriptor, b: &ProviderDescriptor) -> CmpOrdering {
    a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id))
}

/// Ascending priority, ties broken by provider id
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityWithFallback;

impl SelectionStrategy for PriorityWithFallback {
    fn kind(&self) -> RoutingStrategy {
        RoutingStrategy::PriorityWithFallback
    }

    fn order(
        &self,
        mut candidates: Vec<Arc<ProviderDescriptor>>,
        _ctx: &SelectionContext<'_>,
    ) -> Vec<Arc<ProviderDescriptor>> {
        candidates.sort_by(|a, b| by_priority(a, b));
        candidates
    }
}

/// Priority order rotated by a shared per-pool cursor
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: DashMap<Capability, AtomicUsize>,
}

impl RoundRobin {
    fn next_cursor(&self, capability: Capability) -> usize {
        self.cursors
            .entry(capability)
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl SelectionStrategy for RoundRobin {
    fn kind(&self) -> RoutingStrategy {
        RoutingStrategy::RoundRobin
    }

    fn order(
        &self,
        mut candidates: Vec<Arc<ProviderDescriptor>>,
        ctx: &SelectionContext<'_>,
    ) -> Vec<Arc<ProviderDescriptor>> {
        if candidates.is_empty() {
            return candidates;
        }
        candidates.sort_by(|a, b| by_priority(a, b));
        let offset = self.next_cursor(ctx.capability) % candidates.len();
        candidates.rotate_left(offset);
        candidates
    }
}

/// Uniform shuffle
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomOrder;

impl SelectionStrategy for RandomOrder {
    fn kind(&self) -> RoutingStrategy {
        RoutingStrategy::Random
    }

    fn order(
        &self,
        mut candidates: Vec<Arc<ProviderDescriptor>>,
        _ctx: &SelectionContext<'_>,
    ) -> Vec<Arc<ProviderDescriptor>> {
        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }
}

/// Ascending rolling latency; providers without samples sort last
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastLatency;

impl SelectionStrategy for LeastLatency {
    fn kind(&self) -> RoutingStrategy {
        RoutingStrategy::LeastLatency
    }

    fn order(
        &self,
        mut candidates: Vec<Arc<ProviderDescriptor>>,
        ctx: &SelectionContext<'_>,
    ) -> Vec<Arc<ProviderDescriptor>> {
        candidates.sort_by(|a, b| {
            match (ctx.health.latency(&a.id), ctx.health.latency(&b.id)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            }
            .then_with(|| by_priority(a, b))
        });
        candidates
    }
}

/// Ascending in-flight request count
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastLoad;

impl SelectionStrategy for LeastLoad {
    fn kind(&self) -> RoutingStrategy {
        RoutingStrategy::LeastLoad
    }

    fn order(
        &self,
        mut candidates: Vec<Arc<ProviderDescriptor>>,
        ctx: &SelectionContext<'_>,
    ) -> Vec<Arc<ProviderDescriptor>> {
        candidates.sort_by(|a, b| {
            ctx.health
                .in_flight(&a.id)
                .cmp(&ctx.health.in_flight(&b.id))
                .then_with(|| by_priority(a, b))
        });
        candidates
    }
}
