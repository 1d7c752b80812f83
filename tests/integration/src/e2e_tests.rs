//! End-to-end tests through the assembled gateway
//!
//! Covers metrics, usage accounting, health polling, provider status and
//! hot configuration reload.

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use gateway_config::{GatewayConfig, RoutingStrategy};
use gateway_core::{Capability, MetricsSink, ProviderClient, ProviderId};
use gateway_resilience::{period_key, AtomicStore, CircuitState, Clock, ManualClock, MemoryStore};
use llm_provider_gateway::{Gateway, PrometheusMetricsSink};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_complete_request_flow() {
    let p1 = ScriptedProvider::healthy("p1").with_usage(42).arc();
    let gateway = gateway(base_config(vec![provider("p1", 1)]), &[p1.clone()]).await;

    let request = chat_request("tenant-a");
    let response = gateway
        .execute(&request, Capability::Chat, &CancellationToken::new())
        .await
        .expect("served");

    assert_eq!(response.provider.as_str(), "p1");
    assert_eq!(response.model, "gpt-4o");
    assert_eq!(response.usage.map(|u| u.total_tokens), Some(42));
    assert_eq!(response.payload["choices"][0]["message"]["content"], "ok");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_prometheus_metrics_recorded() {
    let sink = Arc::new(PrometheusMetricsSink::new().expect("metrics registry"));
    let p1 = ScriptedProvider::healthy("p1").arc();
    let p2 = ScriptedProvider::failing("p2", permanent("p2")).arc();
    let gateway = Gateway::builder(base_config(vec![provider("p1", 1), provider("p2", 2)]))
        .clients([
            Arc::clone(&p1) as Arc<dyn ProviderClient>,
            Arc::clone(&p2) as Arc<dyn ProviderClient>,
        ])
        .store(Arc::new(MemoryStore::new()))
        .metrics(Arc::clone(&sink) as Arc<dyn MetricsSink>)
        .build()
        .await
        .expect("Failed to build gateway");
    let cancel = CancellationToken::new();

    gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
        .await
        .expect("p1 serves");
    gateway
        .execute(&pinned_request("tenant-a", "p2"), Capability::Chat, &cancel)
        .await
        .expect_err("p2 fails");

    assert!(
        eventually(Duration::from_secs(2), || {
            sink.gather_text()
                .is_ok_and(|text| text.contains("gateway_provider_available{provider=\"p2\"} 0"))
        })
        .await,
        "health poller should publish availability"
    );

    let text = sink.gather_text().expect("encode metrics");
    assert!(has_sample(
        &text,
        "gateway_requests_total{",
        &["provider=\"p1\"", "outcome=\"success\"", "tenant=\"tenant-a\""],
        "1"
    ));
    assert!(has_sample(
        &text,
        "gateway_requests_total{",
        &["provider=\"p2\"", "outcome=\"failure\"", "model=\"gpt-4o\""],
        "1"
    ));
    assert!(has_sample(
        &text,
        "gateway_request_duration_seconds_count{",
        &["provider=\"p1\""],
        "1"
    ));
    assert!(text.contains("gateway_provider_available{provider=\"p1\"} 1"));
}

/// Whether `text` holds a `metric` sample carrying every label with `value`
fn has_sample(text: &str, metric: &str, labels: &[&str], value: &str) -> bool {
    text.lines().any(|line| {
        line.starts_with(metric)
            && labels.iter().all(|label| line.contains(label))
            && line.rsplit(' ').next() == Some(value)
    })
}

const USAGE_START_MS: u64 = 1_700_000_000_000;

/// Gateway over `store` whose rate limit clock is `clock`
async fn clocked_gateway(
    config: GatewayConfig,
    provider: &Arc<ScriptedProvider>,
    store: &Arc<MemoryStore>,
    clock: &Arc<ManualClock>,
) -> Gateway {
    Gateway::builder(config)
        .client(Arc::clone(provider) as Arc<dyn ProviderClient>)
        .store(Arc::clone(store) as Arc<dyn AtomicStore>)
        .clock(Arc::clone(clock) as Arc<dyn Clock>)
        .build()
        .await
        .expect("Failed to build gateway")
}

/// Usage counter for `base` in the period containing `now_ms`
async fn usage(store: &MemoryStore, base: &str, period: Duration, now_ms: u64) -> i64 {
    store
        .increment_with_ttl(&period_key(base, period, now_ms), 0, period, now_ms)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_usage_accounting_in_shared_store() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(USAGE_START_MS));
    let p1 = ScriptedProvider::healthy("p1").with_usage(120).arc();
    let mut config = base_config(vec![provider("p1", 1)]);
    config.rate_limit.usage_period = Duration::from_secs(60);
    let period = config.rate_limit.usage_period;
    let gateway = clocked_gateway(config, &p1, &store, &clock).await;
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        gateway
            .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
            .await
            .expect("served");
    }

    let now = USAGE_START_MS;
    assert_eq!(usage(&store, "usage:requests:tenant-a", period, now).await, 2);
    assert_eq!(usage(&store, "usage:tokens:tenant-a", period, now).await, 240);
    assert_eq!(usage(&store, "usage:requests:tenant-b", period, now).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_usage_counters_roll_over_and_expire() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(USAGE_START_MS));
    let p1 = ScriptedProvider::healthy("p1").arc();
    let mut config = base_config(vec![provider("p1", 1)]);
    config.rate_limit.usage_period = Duration::from_secs(60);
    let period = config.rate_limit.usage_period;
    let gateway = clocked_gateway(config, &p1, &store, &clock).await;
    let cancel = CancellationToken::new();

    gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
        .await
        .expect("served");
    clock.advance(period);
    gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
        .await
        .expect("served");

    let next = USAGE_START_MS + 60_000;
    assert_eq!(usage(&store, "usage:requests:tenant-a", period, next).await, 1);
    assert_eq!(store.key_count(), 2);

    // The first period's counter expires as the second begins
    assert_eq!(store.purge_expired(next), 1);
    assert_eq!(store.purge_expired(next + 60_000), 1);
    assert_eq!(store.key_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_request_is_not_accounted() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(USAGE_START_MS));
    let p1 = ScriptedProvider::failing("p1", permanent("p1")).arc();
    let config = base_config(vec![provider("p1", 1)]);
    let period = config.rate_limit.usage_period;
    let gateway = clocked_gateway(config, &p1, &store, &clock).await;

    gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect_err("p1 fails");

    assert_eq!(store.key_count(), 0);
    assert_eq!(usage(&store, "usage:requests:tenant-a", period, USAGE_START_MS).await, 0);
}

#[tokio::test]
async fn test_health_poller_marks_unavailable_provider() {
    let p1 = ScriptedProvider::healthy("p1").arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let mut config = base_config(vec![provider("p1", 1), provider("p2", 2)]);
    config.routing.health_check_interval = Duration::from_millis(50);
    let gateway = gateway(config, &[p1.clone(), p2.clone()]).await;
    let p2_id = ProviderId::new("p2");

    p2.set_healthy(false);
    let marked = eventually(Duration::from_secs(2), || {
        gateway
            .orchestrator()
            .health()
            .sample(&p2_id)
            .is_some_and(|s| !s.last_known_available)
    })
    .await;
    assert!(marked, "p2 should be reported unavailable");

    p2.set_healthy(true);
    let recovered = eventually(Duration::from_secs(2), || {
        gateway
            .orchestrator()
            .health()
            .sample(&p2_id)
            .is_some_and(|s| s.last_known_available)
    })
    .await;
    assert!(recovered, "p2 should be reported available again");
}

#[tokio::test(start_paused = true)]
async fn test_provider_status_reports_breaker_and_blacklist() {
    let mut config = base_config(vec![provider("p1", 1), provider("p2", 2), provider("p3", 3)]);
    config.routing.failover_threshold = 1;
    let p1 = ScriptedProvider::failing("p1", permanent("p1")).arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let p3 = ScriptedProvider::healthy("p3").arc();
    let gateway = gateway(config, &[p1.clone(), p2.clone(), p3.clone()]).await;
    gateway
        .orchestrator()
        .breakers()
        .get_or_create(&ProviderId::new("p3"))
        .force_open();

    gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect("p2 serves");

    let status = gateway.provider_status();
    let ids: Vec<&str> = status.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3"]);

    assert_eq!(status[0].blacklisted_for, Some(Duration::from_secs(300)));
    assert_eq!(status[0].circuit, CircuitState::Closed);
    assert_eq!(status[1].blacklisted_for, None);
    assert_eq!(
        status[1].health.as_ref().map(|h| h.total_requests),
        Some(1)
    );
    assert_eq!(status[2].circuit, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_reload_through_handle_is_applied() {
    let providers = [
        ScriptedProvider::healthy("p1").arc(),
        ScriptedProvider::healthy("p2").arc(),
        ScriptedProvider::healthy("p3").arc(),
    ];
    let gateway = gateway(
        base_config(vec![provider("p1", 1), provider("p2", 2), provider("p3", 3)]),
        &providers,
    )
    .await;
    let p1 = ProviderId::new("p1");
    gateway.orchestrator().breakers().get_or_create(&p1).force_open();

    let mut updated = base_config(vec![provider("p1", 1), provider("p2", 2)]);
    updated.routing.strategy = RoutingStrategy::RoundRobin;
    gateway
        .config_handle()
        .update(updated)
        .expect("valid config");

    let applied = eventually(Duration::from_secs(1), || {
        gateway.orchestrator().failover().selector().kind() == RoutingStrategy::RoundRobin
            && gateway.provider_status().len() == 2
    })
    .await;
    assert!(applied, "listener should apply the new configuration");

    // Live breaker state survives a reload for retained providers.
    assert_eq!(gateway.orchestrator().breakers().state(&p1), CircuitState::Open);
    assert_eq!(gateway.config().routing.strategy, RoutingStrategy::RoundRobin);
}

#[tokio::test(start_paused = true)]
async fn test_update_config_removes_provider_from_routing() {
    let p1 = ScriptedProvider::healthy("p1").arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(
        base_config(vec![provider("p1", 1), provider("p2", 2)]),
        &[p1.clone(), p2.clone()],
    )
    .await;

    gateway
        .update_config(base_config(vec![provider("p2", 2)]))
        .expect("valid config");

    let response = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect("p2 serves");
    assert_eq!(response.provider.as_str(), "p2");
    assert_eq!(p1.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_update_keeps_running_config() {
    let p1 = ScriptedProvider::healthy("p1").arc();
    let gateway = gateway(base_config(vec![provider("p1", 1)]), &[p1.clone()]).await;

    let mut invalid = base_config(vec![provider("p1", 1)]);
    invalid.circuit_breaker.failure_threshold = 1.5;
    assert!(gateway.update_config(invalid).is_err());

    let mut duplicate = base_config(vec![provider("p1", 1), provider("p1", 2)]);
    duplicate.routing.strategy = RoutingStrategy::Random;
    assert!(gateway.update_config(duplicate).is_err());

    assert_eq!(gateway.config().circuit_breaker.failure_threshold, 0.5);
    assert_eq!(
        gateway.orchestrator().failover().selector().kind(),
        RoutingStrategy::PriorityWithFallback
    );
    gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect("still serving");
}

#[tokio::test(start_paused = true)]
async fn test_invalid_initial_config_is_rejected() {
    let result = Gateway::builder(base_config(vec![provider("p1", 1), provider("p1", 2)]))
        .store(Arc::new(MemoryStore::new()))
        .build()
        .await;

    assert!(result.is_err());
}
