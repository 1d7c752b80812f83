//! Configuration loading from files and environment variables.

use crate::error::{ConfigError, ConfigResult};
use crate::model::{BackoffKind, GatewayConfig, RoutingStrategy, StoreBackend};
use humantime_serde::re::humantime;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Default prefix of environment overrides
pub const ENV_PREFIX: &str = "GATEWAY_";

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML (`.yaml`, `.yml`)
    Yaml,
    /// TOML (`.toml`)
    Toml,
    /// JSON (`.json`)
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    ///
    /// # Errors
    /// Returns `ConfigError::UnsupportedFormat` for unknown extensions
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Json => "json",
        }
    }
}

/// Parse and validate a configuration document
///
/// # Errors
/// Returns an error if the document cannot be parsed or fails validation
pub fn parse_config(content: &str, format: ConfigFormat) -> ConfigResult<GatewayConfig> {
    let parse_error = |message: String| ConfigError::Parse {
        format: format.name(),
        message,
    };

    let config: GatewayConfig = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string()))?,
        ConfigFormat::Toml => toml::from_str(content).map_err(|e| parse_error(e.to_string()))?,
        ConfigFormat::Json => serde_json::from_str(content).map_err(|e| parse_error(e.to_string()))?,
    };

    config.validate_all()?;
    Ok(config)
}

/// Load, override from the process environment, and validate a config file
///
/// # Errors
/// Returns an error if the file cannot be read, parsed or validated
pub async fn load_config(path: impl AsRef<Path>) -> ConfigResult<GatewayConfig> {
    ConfigLoader::new().with_file(path.as_ref()).load().await
}

fn parse_env<T: FromStr>(var: &str, value: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Env {
        var: var.to_string(),
        message: e.to_string(),
    })
}

fn parse_env_duration(var: &str, value: &str) -> ConfigResult<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::Env {
        var: var.to_string(),
        message: e.to_string(),
    })
}

/// Apply `GATEWAY_*` overrides to scalar settings.
///
/// `lookup` resolves a variable name to its value; pass
/// `|k| std::env::var(k).ok()` for the process environment.
///
/// # Errors
/// Returns `ConfigError::Env` if a present variable cannot be parsed
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| {
        let name = format!("{ENV_PREFIX}{suffix}");
        lookup(&name).map(|value| (name, value))
    };

    if let Some((name, value)) = var("ROUTING_STRATEGY") {
        config.routing.strategy = parse_env::<RoutingStrategy>(&name, &value)?;
    }
    if let Some((name, value)) = var("ROUTING_FAILOVER_THRESHOLD") {
        config.routing.failover_threshold = parse_env(&name, &value)?;
    }
    if let Some((name, value)) = var("ROUTING_BLACKLIST_DURATION") {
        config.routing.blacklist_duration = parse_env_duration(&name, &value)?;
    }
    if let Some((name, value)) = var("ROUTING_HEALTH_CHECK_INTERVAL") {
        config.routing.health_check_interval = parse_env_duration(&name, &value)?;
    }

    if let Some((name, value)) = var("RETRY_MAX_ATTEMPTS") {
        config.retry.max_retry_attempts = parse_env(&name, &value)?;
    }
    if let Some((name, value)) = var("RETRY_INITIAL_DELAY") {
        config.retry.initial_delay = parse_env_duration(&name, &value)?;
    }
    if let Some((name, value)) = var("RETRY_MAX_DELAY") {
        config.retry.max_delay = parse_env_duration(&name, &value)?;
    }
    if let Some((name, value)) = var("RETRY_USE_JITTER") {
        config.retry.use_jitter = parse_env(&name, &value)?;
    }
    if let Some((name, value)) = var("RETRY_BACKOFF") {
        config.retry.backoff = parse_env::<BackoffKind>(&name, &value)?;
    }

    if let Some((name, value)) = var("CIRCUIT_BREAKER_FAILURE_THRESHOLD") {
        config.circuit_breaker.failure_threshold = parse_env(&name, &value)?;
    }
    if let Some((name, value)) = var("CIRCUIT_BREAKER_MINIMUM_THROUGHPUT") {
        config.circuit_breaker.minimum_throughput = parse_env(&name, &value)?;
    }
    if let Some((name, value)) = var("CIRCUIT_BREAKER_DURATION_OF_BREAK") {
        config.circuit_breaker.duration_of_break = parse_env_duration(&name, &value)?;
    }

    if let Some((name, value)) = var("RATE_LIMIT_ENABLED") {
        config.rate_limit.enabled = parse_env(&name, &value)?;
    }
    if let Some((_, value)) = var("RATE_LIMIT_KEY_PREFIX") {
        config.rate_limit.key_prefix = value;
    }
    if let Some((name, value)) = var("RATE_LIMIT_USAGE_PERIOD") {
        config.rate_limit.usage_period = parse_env_duration(&name, &value)?;
    }

    if let Some((name, value)) = var("STORE_BACKEND") {
        config.store.backend = match value.trim().to_ascii_lowercase().as_str() {
            "memory" => StoreBackend::Memory,
            "redis" => StoreBackend::Redis,
            other => {
                return Err(ConfigError::Env {
                    var: name,
                    message: format!("unknown store backend: {other}"),
                })
            }
        };
    }
    if let Some((_, value)) = var("STORE_URL") {
        config.store.url = Some(SecretString::new(value));
    }
    if let Some((name, value)) = var("STORE_OPERATION_TIMEOUT") {
        config.store.operation_timeout = parse_env_duration(&name, &value)?;
    }

    Ok(())
}

/// Builder-style loader combining a file with environment overrides
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    use_env: bool,
}

impl ConfigLoader {
    /// Create a loader that reads the process environment
    #[must_use]
    pub fn new() -> Self {
        Self {
            file: None,
            use_env: true,
        }
    }

    /// Read the given file
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Skip environment overrides
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Load the configuration
    ///
    /// Without a file, defaults are used as the base.
    ///
    /// # Errors
    /// Returns an error if reading, parsing, overriding or validation fails
    pub async fn load(self) -> ConfigResult<GatewayConfig> {
        let mut config = match &self.file {
            Some(path) => {
                let format = ConfigFormat::from_path(path)?;
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })?;
                info!(path = %path.display(), format = format.name(), "Loading configuration");
                parse_config(&content, format)?
            }
            None => GatewayConfig::default(),
        };

        if self.use_env {
            apply_env_overrides(&mut config, |k| std::env::var(k).ok())?;
        }

        config.validate_all()?;
        debug!(
            providers = config.providers.len(),
            strategy = %config.routing.strategy,
            "Configuration loaded"
        );
        Ok(config)
    }
}
