//! Hot reload of configuration.
//!
//! [`ConfigHandle`] is the single source of truth for the live config.
//! Readers take a cheap snapshot with [`ConfigHandle::current`]; components
//! that cache derived state subscribe to changes.

use crate::error::{ConfigError, ConfigResult};
use crate::loader::ConfigLoader;
use crate::model::GatewayConfig;
use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared, atomically replaceable configuration
#[derive(Debug)]
pub struct ConfigHandle {
    current: ArcSwap<GatewayConfig>,
    tx: watch::Sender<Arc<GatewayConfig>>,
}

impl ConfigHandle {
    /// Create a handle holding `config`
    ///
    /// # Errors
    /// Returns an error if `config` is invalid
    pub fn new(config: GatewayConfig) -> ConfigResult<Self> {
        config.validate_all()?;
        let config = Arc::new(config);
        let (tx, _rx) = watch::channel(Arc::clone(&config));
        Ok(Self {
            current: ArcSwap::new(config),
            tx,
        })
    }

    /// Snapshot of the live configuration
    #[must_use]
    pub fn current(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }

    /// Receive every accepted configuration
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<GatewayConfig>> {
        self.tx.subscribe()
    }

    /// Replace the live configuration.
    ///
    /// An invalid config is rejected and the previous one stays live.
    ///
    /// # Errors
    /// Returns the validation error for a rejected config
    pub fn update(&self, config: GatewayConfig) -> ConfigResult<()> {
        config.validate_all()?;
        let config = Arc::new(config);
        self.current.store(Arc::clone(&config));
        self.tx.send_replace(config);
        info!("Configuration updated");
        Ok(())
    }
}

/// Reloads a config file into a [`ConfigHandle`] whenever it changes
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    handle: Arc<ConfigHandle>,
    debounce: Duration,
}

impl ConfigWatcher {
    /// Create a watcher for `path` feeding `handle`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, handle: Arc<ConfigHandle>) -> Self {
        Self {
            path: path.into(),
            handle,
            debounce: Duration::from_millis(250),
        }
    }

    /// Set how long to wait for a burst of file events to settle
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Reload the file once, keeping the old config if the new one is invalid
    ///
    /// # Errors
    /// Returns the load or validation error; the live config is unchanged
    pub async fn reload(&self) -> ConfigResult<()> {
        let config = ConfigLoader::new().with_file(&self.path).load().await?;
        self.handle.update(config)
    }

    /// Start watching until `cancel` fires
    ///
    /// # Errors
    /// Returns `ConfigError::Watch` if the OS watcher cannot be installed
    pub fn spawn(self, cancel: CancellationToken) -> ConfigResult<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!(error = %e, "Config watch error"),
            })
            .map_err(|e| ConfigError::Watch(e.to_string()))?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Watch(e.to_string()))?;

        info!(path = %self.path.display(), "Watching configuration file");

        Ok(tokio::spawn(async move {
            // The OS watcher lives as long as the task.
            let _watcher = watcher;

            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.debounce) => {}
                }
                while rx.try_recv().is_ok() {}

                debug!(path = %self.path.display(), "Configuration file changed");
                if let Err(e) = self.reload().await {
                    warn!(error = %e, "Rejected configuration reload, keeping previous config");
                }
            }

            debug!("Config watcher stopped");
        }))
    }
}
