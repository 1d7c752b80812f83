//! Circuit breaker, retry and cancellation integration tests

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use gateway_config::{BackoffKind, CircuitBreakerConfig};
use gateway_core::{Capability, GatewayError, ProviderId};
use gateway_resilience::{CallPermit, CircuitBreaker, CircuitState};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 0.5,
        minimum_throughput: 10,
        sampling_duration: Duration::from_secs(30),
        duration_of_break: Duration::from_secs(30),
        permitted_calls_in_half_open: 1,
    }
}

/// Offsets of each call from the first one
fn offsets(times: &[tokio::time::Instant]) -> Vec<Duration> {
    times.iter().map(|t| *t - times[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_at_failure_threshold() {
    let breaker = CircuitBreaker::new("p1", breaker_config());

    for _ in 0..5 {
        breaker.record_success();
    }
    for _ in 0..4 {
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allow_request());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_stays_closed_below_threshold() {
    let breaker = CircuitBreaker::new("p1", breaker_config());

    for _ in 0..6 {
        breaker.record_success();
    }
    for _ in 0..4 {
        breaker.record_failure();
    }

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.stats().failure_count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_probe_cap_and_reopen() {
    let breaker = Arc::new(CircuitBreaker::new("p1", breaker_config()));
    breaker.force_open();
    assert!(breaker.try_acquire().is_none());

    tokio::time::advance(Duration::from_secs(30)).await;
    let Some(CallPermit::Probe(probe)) = breaker.try_acquire() else {
        panic!("expected a probe permit");
    };
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(breaker.try_acquire().is_none(), "only one probe may be in flight");

    probe.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    let Some(CallPermit::Probe(probe)) = breaker.try_acquire() else {
        panic!("expected a probe permit");
    };
    probe.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_unused_probe_slot_is_released() {
    let breaker = Arc::new(CircuitBreaker::new("p1", breaker_config()));
    breaker.force_open();
    tokio::time::advance(Duration::from_secs(30)).await;

    let permit = breaker.try_acquire();
    assert!(matches!(permit, Some(CallPermit::Probe(_))));
    drop(permit);

    assert!(matches!(breaker.try_acquire(), Some(CallPermit::Probe(_))));
}

/// A call admitted while closed that finishes during half-open must not
/// decide the probe's outcome
#[tokio::test(start_paused = true)]
async fn test_late_closed_call_does_not_decide_half_open() {
    let mut config = breaker_config();
    config.minimum_throughput = 1;
    let breaker = Arc::new(CircuitBreaker::new("p1", config));

    let slow_success = breaker.try_acquire().expect("closed admits");
    let slow_failure = breaker.try_acquire().expect("closed admits");
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    let Some(probe) = breaker.try_acquire() else {
        panic!("expected a probe permit");
    };
    assert!(probe.is_probe());

    slow_success.complete(&breaker, true);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    slow_failure.complete(&breaker, false);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    probe.complete(&breaker, false);
    assert_eq!(breaker.state(), CircuitState::Open);
}

/// Provider outcomes drive the breaker through the gateway
#[tokio::test(start_paused = true)]
async fn test_gateway_opens_breaker_after_failure_ratio() {
    let mut config = base_config(vec![provider("p1", 1), provider("p2", 2)]);
    config.routing.failover_threshold = 100;

    let mut p1 = ScriptedProvider::failing("p1", permanent("p1"));
    for _ in 0..5 {
        p1 = p1.then(Reply::Ok);
    }
    let p1 = p1.arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(config, &[p1.clone(), p2.clone()]).await;
    let cancel = CancellationToken::new();

    for _ in 0..10 {
        gateway
            .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
            .await
            .expect("served");
    }
    assert_eq!(
        gateway.orchestrator().breakers().state(&ProviderId::new("p1")),
        CircuitState::Open
    );

    let response = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &cancel)
        .await
        .expect("p2 serves");
    assert_eq!(response.provider.as_str(), "p2");
    assert_eq!(p1.calls(), 10);
    assert_eq!(p2.calls(), 6);
}

/// A half-open probe gets a single attempt and reopens the breaker on failure
#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_without_retries() {
    let p1 = ScriptedProvider::failing("p1", transient("p1")).arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(
        base_config(vec![provider("p1", 1), provider("p2", 2)]),
        &[p1.clone(), p2.clone()],
    )
    .await;
    let p1_id = ProviderId::new("p1");
    gateway.orchestrator().breakers().get_or_create(&p1_id).force_open();
    tokio::time::advance(Duration::from_secs(30)).await;

    let response = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect("p2 serves");

    assert_eq!(response.provider.as_str(), "p2");
    assert_eq!(p1.calls(), 1);
    assert_eq!(gateway.orchestrator().breakers().state(&p1_id), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_constant_backoff_timing() {
    let mut config = base_config(vec![provider("p1", 1)]);
    config.retry.backoff = BackoffKind::Constant;
    let p1 = ScriptedProvider::failing("p1", transient("p1")).arc();
    let gateway = gateway(config, &[p1.clone()]).await;

    let error = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect_err("p1 keeps failing");

    assert_eq!(failed_attempts(&error), vec![("p1".to_string(), 3)]);
    assert_eq!(
        offsets(&p1.call_times()),
        vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_timing() {
    let p1 = ScriptedProvider::failing("p1", transient("p1")).arc();
    let gateway = gateway(base_config(vec![provider("p1", 1)]), &[p1.clone()]).await;

    gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect_err("p1 keeps failing");

    assert_eq!(
        offsets(&p1.call_times()),
        vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(3)]
    );
}

/// Transient errors recover on the same provider within the attempt budget
#[tokio::test(start_paused = true)]
async fn test_retry_recovers_on_same_provider() {
    let p1 = ScriptedProvider::healthy("p1")
        .then(Reply::Fail(transient("p1")))
        .then(Reply::Fail(transient("p1")))
        .arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(
        base_config(vec![provider("p1", 1), provider("p2", 2)]),
        &[p1.clone(), p2.clone()],
    )
    .await;

    let response = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect("third attempt succeeds");

    assert_eq!(response.provider.as_str(), "p1");
    assert_eq!(p1.calls(), 3);
    assert_eq!(p2.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_is_not_retried() {
    let p1 = ScriptedProvider::failing("p1", permanent("p1")).arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(
        base_config(vec![provider("p1", 1), provider("p2", 2)]),
        &[p1.clone(), p2.clone()],
    )
    .await;

    let started = tokio::time::Instant::now();
    let response = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect("p2 serves");

    assert_eq!(response.provider.as_str(), "p2");
    assert_eq!(p1.calls(), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_request() {
    let p1 = ScriptedProvider::failing("p1", transient("p1")).arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(
        base_config(vec![provider("p1", 1), provider("p2", 2)]),
        &[p1.clone(), p2.clone()],
    )
    .await;
    let cancel = CancellationToken::new();
    let request = chat_request("tenant-a");

    let (result, ()) = tokio::join!(
        gateway.execute(&request, Capability::Chat, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        }
    );

    assert!(matches!(result, Err(GatewayError::Cancelled)));
    assert_eq!(p1.calls(), 1);
    assert_eq!(p2.calls(), 0);
}

/// A slow provider call is cut off at the provider timeout and retried
#[tokio::test(start_paused = true)]
async fn test_provider_timeout_counts_as_transient() {
    let slow = provider("slow", 1).with_timeout(Duration::from_millis(200));
    let p1 = ScriptedProvider::healthy("slow")
        .with_latency(Duration::from_secs(5))
        .arc();
    let p2 = ScriptedProvider::healthy("p2").arc();
    let gateway = gateway(base_config(vec![slow, provider("p2", 2)]), &[p1.clone(), p2.clone()]).await;

    let response = gateway
        .execute(&chat_request("tenant-a"), Capability::Chat, &CancellationToken::new())
        .await
        .expect("p2 serves");

    assert_eq!(response.provider.as_str(), "p2");
    assert_eq!(p1.calls(), 3);
}
