//! Routing and failover integration tests
//!
//! Tests for candidate ordering, breaker and blacklist filtering, forced
//! providers and aggregated failures.

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use gateway_config::RoutingStrategy;
use gateway_core::{Capability, ErrorClass, GatewayError, ProviderId};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Open breaker on the preferred provider routes to the next one
#[tokio::test(start_paused = true)]
async fn test_open_breaker_provider_is_skipped() {
    let p1 = ScriptedProvider::healthy("p1").arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(
        base_config(vec![provider("p1", 1), provider("p2", 2)]),
        &[p1.clone(), p2.clone()],
    )
    .await;
    gateway
        .orchestrator()
        .breakers()
        .get_or_create(&ProviderId::new("p1"))
        .force_open();

    let response = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect("p2 serves");

    assert_eq!(response.provider.as_str(), "p2");
    assert_eq!(p1.calls(), 0);
    assert_eq!(p2.calls(), 1);
}

/// Failover walks providers in non-decreasing priority order
#[tokio::test(start_paused = true)]
async fn test_failover_follows_priority_order() {
    let providers = [
        ScriptedProvider::failing("c", permanent("c")).arc(),
        ScriptedProvider::failing("a", permanent("a")).arc(),
        ScriptedProvider::failing("b", permanent("b")).arc(),
    ];
    let gateway = gateway(
        base_config(vec![provider("c", 30), provider("a", 10), provider("b", 20)]),
        &providers,
    )
    .await;

    let error = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect_err("every provider fails");

    assert_eq!(
        failed_attempts(&error),
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 1),
            ("c".to_string(), 1)
        ]
    );
}

/// Every candidate failing yields an aggregated error, never a panic
#[tokio::test(start_paused = true)]
async fn test_all_unhealthy_returns_all_providers_failed() {
    let providers = [
        ScriptedProvider::failing("p1", transient("p1")).arc(),
        ScriptedProvider::failing("p2", GatewayError::connection("p2", "reset")).arc(),
    ];
    let gateway = gateway(
        base_config(vec![provider("p1", 1), provider("p2", 2)]),
        &providers,
    )
    .await;

    let error = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect_err("every provider fails");

    assert_eq!(error.class(), ErrorClass::Internal);
    assert_eq!(
        failed_attempts(&error),
        vec![("p1".to_string(), 3), ("p2".to_string(), 3)]
    );
    assert!(error.to_string().contains("service unavailable"));
}

/// A provider reaching the failover threshold is blacklisted, then returns
#[tokio::test(start_paused = true)]
async fn test_blacklist_excludes_until_expiry() {
    let mut config = base_config(vec![provider("p1", 1), provider("p2", 2)]);
    config.routing.failover_threshold = 2;
    config.routing.blacklist_duration = Duration::from_secs(60);

    let p1 = ScriptedProvider::failing("p1", permanent("p1")).arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(config, &[p1.clone(), p2.clone()]).await;
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        gateway
            .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
            .await
            .expect("p2 serves");
    }
    assert_eq!(p1.calls(), 2);
    assert!(gateway.orchestrator().failover().is_blacklisted(&ProviderId::new("p1")));

    gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
        .await
        .expect("p2 serves");
    assert_eq!(p1.calls(), 2, "blacklisted provider must not be called");

    tokio::time::advance(Duration::from_secs(60)).await;
    p1.set_default(Reply::Ok);
    let response = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
        .await
        .expect("p1 is back");
    assert_eq!(response.provider.as_str(), "p1");
    assert_eq!(p1.calls(), 3);
}

/// Round robin spreads consecutive requests across the pool
#[tokio::test(start_paused = true)]
async fn test_round_robin_distribution() {
    let mut config = base_config(vec![provider("p1", 1), provider("p2", 1), provider("p3", 1)]);
    config.routing.strategy = RoutingStrategy::RoundRobin;
    let providers = [
        ScriptedProvider::healthy("p1").arc(),
        ScriptedProvider::healthy("p2").arc(),
        ScriptedProvider::healthy("p3").arc(),
    ];
    let gateway = gateway(config, &providers).await;

    for _ in 0..6 {
        gateway
            .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
            .await
            .expect("served");
    }

    let calls: Vec<u32> = providers.iter().map(|p| p.calls()).collect();
    assert_eq!(calls, vec![2, 2, 2]);
}

/// Least latency prefers the provider with the lower rolling latency
#[tokio::test(start_paused = true)]
async fn test_least_latency_prefers_faster_provider() {
    let mut config = base_config(vec![provider("slow", 1), provider("fast", 2)]);
    config.routing.strategy = RoutingStrategy::LeastLatency;
    let slow = ScriptedProvider::healthy("slow")
        .with_latency(Duration::from_millis(400))
        .arc();
    let fast = ScriptedProvider::healthy("fast")
        .with_latency(Duration::from_millis(50))
        .arc();
    let gateway = gateway(config, &[slow.clone(), fast.clone()]).await;
    let cancel = CancellationToken::new();

    // Warm up both providers' latency samples
    gateway
        .execute(&pinned_request("tenant-a", "slow"), Capability::Chat, &cancel)
        .await
        .expect("slow serves");
    gateway
        .execute(&pinned_request("tenant-a", "fast"), Capability::Chat, &cancel)
        .await
        .expect("fast serves");

    let response = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
        .await
        .expect("served");
    assert_eq!(response.provider.as_str(), "fast");
}

/// A forced provider is still subject to its circuit breaker
#[tokio::test(start_paused = true)]
async fn test_forced_provider_respects_breaker() {
    let p1 = ScriptedProvider::healthy("p1").arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(
        base_config(vec![provider("p1", 1), provider("p2", 2)]),
        &[p1.clone(), p2.clone()],
    )
    .await;
    gateway
        .orchestrator()
        .breakers()
        .get_or_create(&ProviderId::new("p2"))
        .force_open();

    let error = gateway
        .execute(&pinned_request("tenant-a", "p2"), Capability::Chat, &CancellationToken::new())
        .await
        .expect_err("only candidate is open");

    let GatewayError::AllProvidersFailed { attempts } = error else {
        panic!("expected AllProvidersFailed");
    };
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].error.class(), ErrorClass::CircuitOpen);
    assert_eq!(p1.calls() + p2.calls(), 0);
}

/// Providers without the requested capability are never candidates
#[tokio::test(start_paused = true)]
async fn test_capability_filtering() {
    let chat_only = ScriptedProvider::healthy("chat-only").arc();
    let gateway = gateway(base_config(vec![provider("chat-only", 1)]), &[chat_only.clone()]).await;

    let error = gateway
        .execute(&chat_request("tenant-a"), Capability::Embeddings, &CancellationToken::new())
        .await
        .expect_err("no embeddings provider");

    assert!(failed_attempts(&error).is_empty());
    assert!(error.to_string().contains("no provider available"));
    assert_eq!(chat_only.calls(), 0);
}
