//! Configuration Loader
//!
//! Layers built-in defaults, an optional configuration file and environment variables
//! (`RELAY__DELIVERY__ACK_TIMEOUT_MS=5000`) into a validated [`RelayConfig`].

use super::error::ConfigResult;
use super::RelayConfig;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "RELAY";
const ENV_SEPARATOR: &str = "__";

/// Owns the loaded configuration and the environment it was resolved for
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: RelayConfig,
    environment: String,
}

impl ConfigManager {
    /// Load configuration from defaults, an optional file and the process environment
    pub fn load(path: Option<impl AsRef<Path>>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&RelayConfig::default())?);

        if let Some(path) = path {
            let path = path.as_ref();
            debug!(path = %path.display(), "Adding configuration file source");
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let mut config: RelayConfig = builder.build()?.try_deserialize()?;
        if config.environment.is_empty() {
            config.environment = environment;
        }

        Self::from_config(config)
    }

    /// Wrap an in-memory configuration after validating it
    pub fn from_config(config: RelayConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;

        let environment = if config.environment.is_empty() {
            Self::detect_environment()
        } else {
            config.environment.clone()
        };

        info!(
            environment = %environment,
            max_concurrent_workflows = config.orchestration.max_concurrent_workflows,
            dead_letter_capacity = config.delivery.dead_letter_capacity,
            breakers_enabled = config.circuit_breaker.enabled,
            "⚙️ Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
        }))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Detect the deployment environment from the process environment
    pub fn detect_environment() -> String {
        env::var("RELAY_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }
}
