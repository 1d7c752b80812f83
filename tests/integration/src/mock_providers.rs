//! Scripted provider clients for integration testing
//!
//! A [`ScriptedProvider`] replays queued replies, then falls back to a
//! default reply that tests can change at runtime (outage, recovery).

use async_trait::async_trait;
use gateway_core::{
    Capability, CapabilitySet, GatewayError, GatewayRequest, GatewayResponse, GatewayResult,
    ProviderClient, ProviderId, Usage,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Reply of one provider call
#[derive(Debug, Clone)]
pub enum Reply {
    /// Successful response
    Ok,
    /// Failed call
    Fail(GatewayError),
}

/// Provider client driven by a script
#[derive(Debug)]
pub struct ScriptedProvider {
    id: ProviderId,
    capabilities: CapabilitySet,
    script: Mutex<VecDeque<Reply>>,
    default: Mutex<Reply>,
    latency: Mutex<Duration>,
    usage: Option<Usage>,
    healthy: AtomicBool,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedProvider {
    /// Provider that always succeeds and serves chat
    pub fn healthy(id: &str) -> Self {
        Self {
            id: ProviderId::new(id),
            capabilities: CapabilitySet::new().with(Capability::Chat),
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Reply::Ok),
            latency: Mutex::new(Duration::ZERO),
            usage: None,
            healthy: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    /// Provider that always fails with `error`
    pub fn failing(id: &str, error: GatewayError) -> Self {
        let provider = Self::healthy(id);
        *provider.default.lock() = Reply::Fail(error);
        provider.healthy.store(false, Ordering::SeqCst);
        provider
    }

    /// Queue a reply ahead of the default
    #[must_use]
    pub fn then(self, reply: Reply) -> Self {
        self.script.lock().push_back(reply);
        self
    }

    /// Serve these capabilities instead of chat only
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Delay every call by `latency`
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Report `total_tokens` of usage on success
    #[must_use]
    pub fn with_usage(mut self, total_tokens: u32) -> Self {
        self.usage = Some(Usage {
            prompt_tokens: total_tokens,
            completion_tokens: 0,
            total_tokens,
        });
        self
    }

    /// Wrap in an `Arc`
    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Change the reply used once the script is exhausted
    pub fn set_default(&self, reply: Reply) {
        *self.default.lock() = reply;
    }

    /// Change what the liveness probe reports
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of `execute` calls so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Start time of every `execute` call
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
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
        self.call_times.lock().push(Instant::now());

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(GatewayError::Cancelled),
                () = tokio::time::sleep(latency) => {}
            }
        }

        let scripted = self.script.lock().pop_front();
        let reply = scripted.unwrap_or_else(|| self.default.lock().clone());
        match reply {
            Reply::Ok => Ok(GatewayResponse {
                provider: self.id.clone(),
                model: request.model.clone(),
                payload: json!({
                    "provider": self.id.as_str(),
                    "choices": [{ "message": { "role": "assistant", "content": "ok" } }]
                }),
                usage: self.usage,
            }),
            Reply::Fail(error) => Err(error),
        }
    }

    async fn is_healthy(&self, _cancel: &CancellationToken) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
