//! # LLM Provider Gateway
//!
//! Resilient multi-provider routing engine for Large Language Model backends.
//!
//! ## Features
//!
//! - Admission control with distributed sliding-window and token-bucket limits
//! - Per-provider circuit breakers with reserved half-open probes
//! - Retries with cancellable backoff, then ordered failover across providers
//! - Health-aware provider selection (priority, round robin, random, least latency, least load)
//! - Hot configuration reload without losing breaker or blacklist state
//!
//! ## Usage
//!
//! ```no_run
//! use llm_provider_gateway::{Capability, Gateway, GatewayConfig, GatewayRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = Gateway::builder(config).build().await?;
//! let request = GatewayRequest::builder().tenant("acme").model("gpt-4o").build()?;
//! let response = gateway
//!     .execute(&request, Capability::Chat, &CancellationToken::new())
//!     .await?;
//! println!("served by {}", response.provider);
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use gateway_config::{ConfigError, ConfigHandle, ConfigWatcher, StoreBackend, StoreConfig};
use gateway_core::{GatewayError, MetricsSink, NoopMetricsSink, ProviderClient};
use gateway_resilience::{AtomicStore, Clock, MemoryStore, RateLimiter, RedisStore, StoreError, SystemClock};
use gateway_routing::{HealthPoller, ProviderHealthRegistry, ProviderOrchestrator, ProviderStatus};
use secrecy::ExposeSecret;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use gateway_config::GatewayConfig;
pub use gateway_core::{
    Capability, CapabilitySet, GatewayRequest, GatewayResponse, GatewayResult, ProviderDescriptor,
    ProviderId, TenantId,
};
pub use gateway_telemetry::{init_logging, LogFormat, LoggingConfig, PrometheusMetricsSink};

/// Errors raised while assembling a [`Gateway`]
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration is invalid or the watcher could not start
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Shared store could not be reached
    #[error("Failed to connect shared store: {0}")]
    Store(#[from] StoreError),

    /// Components rejected the configuration
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    handle: Result<Arc<ConfigHandle>, ConfigError>,
    clients: Vec<Arc<dyn ProviderClient>>,
    store: Option<Arc<dyn AtomicStore>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    config_path: Option<PathBuf>,
}

impl fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("clients", &self.clients.len())
            .field("store", &self.store)
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl GatewayBuilder {
    fn from_handle_result(handle: Result<Arc<ConfigHandle>, ConfigError>) -> Self {
        Self {
            handle,
            clients: Vec::new(),
            store: None,
            clock: None,
            metrics: None,
            config_path: None,
        }
    }

    /// Build on an existing configuration handle
    #[must_use]
    pub fn from_handle(handle: Arc<ConfigHandle>) -> Self {
        Self::from_handle_result(Ok(handle))
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

    /// Use `store` instead of the one described by `store` configuration
    #[must_use]
    pub fn store(mut self, store: Arc<dyn AtomicStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock used for rate-limit timestamps
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Metrics sink (defaults to a no-op sink)
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Watch `path` and hot-reload configuration on change
    #[must_use]
    pub fn watch_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Assemble every component and start background tasks.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid, the store cannot be
    /// reached or the config watcher cannot start
    pub async fn build(self) -> Result<Gateway, BootstrapError> {
        let handle = self.handle?;
        let config = handle.current();

        let store = match self.store {
            Some(store) => store,
            None => connect_store(&config.store).await?,
        };
        let limiter = Arc::new(RateLimiter::with_clock(
            Arc::clone(&store),
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config.store.operation_timeout,
        ));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(NoopMetricsSink));
        let health = Arc::new(ProviderHealthRegistry::new());

        let orchestrator = Arc::new(
            ProviderOrchestrator::builder(config.as_ref().clone())
                .clients(self.clients)
                .health_registry(Arc::clone(&health))
                .rate_limiter(limiter)
                .metrics(Arc::clone(&metrics))
                .build()?,
        );

        let poller = Arc::new(HealthPoller::new(
            Arc::clone(orchestrator.catalog()),
            health,
            metrics,
            config.routing.health_check_interval,
        ));

        let cancel = CancellationToken::new();
        let mut tasks = vec![
            Arc::clone(&poller).spawn(cancel.child_token()),
            spawn_config_listener(
                Arc::clone(&handle),
                Arc::clone(&orchestrator),
                Arc::clone(&poller),
                cancel.child_token(),
            ),
        ];
        if let Some(path) = self.config_path {
            let watcher = ConfigWatcher::new(path, Arc::clone(&handle));
            match watcher.spawn(cancel.child_token()) {
                Ok(task) => tasks.push(task),
                Err(error) => {
                    cancel.cancel();
                    return Err(error.into());
                }
            }
        }

        info!(
            providers = config.providers.len(),
            strategy = %config.routing.strategy,
            store = store.name(),
            distributed = store.is_distributed(),
            "Gateway started"
        );

        Ok(Gateway {
            orchestrator,
            poller,
            handle,
            cancel,
            tasks,
        })
    }
}

async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn AtomicStore>, BootstrapError> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store; rate limits are not shared between instances");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let url = config.url.as_ref().ok_or_else(|| {
                ConfigError::Validation("store.url is required for the redis backend".into())
            })?;
            let store = RedisStore::connect(url.expose_secret()).await?;
            Ok(Arc::new(store))
        }
    }
}

fn spawn_config_listener(
    handle: Arc<ConfigHandle>,
    orchestrator: Arc<ProviderOrchestrator>,
    poller: Arc<HealthPoller>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut updates = handle.subscribe();
    tokio::spawn(async move {
        let mut backend = handle.current().store.backend;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let config = Arc::clone(&updates.borrow_and_update());
                    if config.store.backend != backend {
                        warn!("Store backend change requires a restart; keeping the current store");
                        backend = config.store.backend;
                    }
                    orchestrator.apply_config(&config);
                    poller.set_interval(config.routing.health_check_interval);
                }
            }
        }
    })
}

/// Running gateway: the orchestrator plus its background tasks.
///
/// Dropping the gateway stops the background tasks; [`Gateway::shutdown`]
/// also waits for them.
pub struct Gateway {
    orchestrator: Arc<ProviderOrchestrator>,
    poller: Arc<HealthPoller>,
    handle: Arc<ConfigHandle>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("orchestrator", &self.orchestrator)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Start building a gateway from `config`
    #[must_use]
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::from_handle_result(ConfigHandle::new(config).map(Arc::new))
    }

    /// Execute `request` against the providers serving `capability`
    ///
    /// # Errors
    /// See [`ProviderOrchestrator::execute`]
    pub async fn execute(
        &self,
        request: &GatewayRequest,
        capability: Capability,
        cancel: &CancellationToken,
    ) -> GatewayResult<GatewayResponse> {
        self.orchestrator.execute(request, capability, cancel).await
    }

    /// Status of every configured provider
    #[must_use]
    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.orchestrator.provider_status()
    }

    /// Underlying orchestrator
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<ProviderOrchestrator> {
        &self.orchestrator
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> Arc<GatewayConfig> {
        self.handle.current()
    }

    /// Configuration handle shared with watchers
    #[must_use]
    pub fn config_handle(&self) -> &Arc<ConfigHandle> {
        &self.handle
    }

    /// Validate and apply a new configuration immediately
    ///
    /// # Errors
    /// Returns error if the configuration is invalid; the running
    /// configuration is left untouched
    pub fn update_config(&self, config: GatewayConfig) -> Result<(), ConfigError> {
        self.handle.update(config)?;
        let current = self.handle.current();
        self.orchestrator.apply_config(&current);
        self.poller
            .set_interval(current.routing.health_check_interval);
        Ok(())
    }

    /// Stop background tasks and wait for them to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(error) = task.await {
                warn!(error = %error, "Background task ended abnormally");
            }
        }
        info!("Gateway stopped");
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
