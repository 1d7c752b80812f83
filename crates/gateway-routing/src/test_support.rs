//! Scripted provider client shared by the unit tests of this crate.

use async_trait::async_trait;
use gateway_core::{
    CapabilitySet, GatewayError, GatewayRequest, GatewayResponse, GatewayResult, ProviderClient,
    ProviderId, Usage,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Provider client that replays scripted outcomes, then falls back to a
/// fixed outcome
#[derive(Debug)]
pub(crate) struct MockClient {
    id: ProviderId,
    capabilities: CapabilitySet,
    healthy: AtomicBool,
    script: Mutex<VecDeque<Result<(), GatewayError>>>,
    fallback: Option<GatewayError>,
    latency: Duration,
    usage: Option<Usage>,
    calls: AtomicU32,
}

impl MockClient {
    pub(crate) fn new(id: &str, capabilities: CapabilitySet) -> Self {
        Self {
            id: ProviderId::new(id),
            capabilities,
            healthy: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            latency: Duration::ZERO,
            usage: None,
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn unhealthy(self) -> Self {
        self.healthy.store(false, Ordering::SeqCst);
        self
    }

    /// Fail every unscripted call with `error`
    pub(crate) fn failing(mut self, error: GatewayError) -> Self {
        self.fallback = Some(error);
        self
    }

    /// Outcomes returned in order before the fallback applies
    pub(crate) fn script(self, outcomes: Vec<Result<(), GatewayError>>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn with_usage(mut self, total_tokens: u32) -> Self {
        self.usage = Some(Usage {
            prompt_tokens: total_tokens / 2,
            completion_tokens: total_tokens - total_tokens / 2,
            total_tokens,
        });
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for MockClient {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn execute(
        &self,
        request: &GatewayRequest,
        cancel: &CancellationToken,
    ) -> GatewayResult<GatewayResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(GatewayError::Cancelled),
                () = tokio::time::sleep(self.latency) => {}
            }
        }

        let scripted = self.script.lock().pop_front();
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => self.fallback.clone().map_or(Ok(()), Err),
        };
        outcome.map(|()| GatewayResponse {
            provider: self.id.clone(),
            model: request.model.clone(),
            payload: serde_json::json!({ "provider": self.id.as_str() }),
            usage: self.usage,
        })
    }

    async fn is_healthy(&self, _cancel: &CancellationToken) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
