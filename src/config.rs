//! Configuration management for Turnstile.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Result, TurnstileError};
use crate::middleware::{
    LoggerConfig, RecoveryConfig, RequestIdConfig, SecurityConfig, MAX_PRIORITY, MIN_PRIORITY,
};
use crate::ratelimit::RateLimitConfig;

/// Prefix of environment overrides, e.g. `TURNSTILE__MIDDLEWARE__RATE_LIMIT__RATE=50`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Middleware sections; an absent section disables that middleware
    #[serde(default)]
    pub middleware: MiddlewareConfigs,

    /// Priority overrides by middleware name
    #[serde(default)]
    pub priority_overrides: HashMap<String, i32>,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Per-middleware configuration sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareConfigs {
    #[serde(default)]
    pub request_id: Option<RequestIdConfig>,
    #[serde(default)]
    pub recovery: Option<RecoveryConfig>,
    #[serde(default)]
    pub security: Option<SecurityConfig>,
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl AppConfig {
    /// Parse configuration from YAML text and validate it.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file layered with `TURNSTILE__` environment overrides.
    ///
    /// Use `__` as the separator for nested fields, e.g.
    /// `TURNSTILE__SERVER__LISTEN_ADDR=0.0.0.0:9000`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_env(path.as_ref(), None)
    }

    fn load_with_env(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        if !path.exists() {
            return Err(TurnstileError::config(
                "config",
                format!("config file not found: {}", path.display()),
            ));
        }

        let config: AppConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every present section.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate_limit) = &self.middleware.rate_limit {
            rate_limit.validate()?;
        }
        for (name, priority) in &self.priority_overrides {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(priority) {
                return Err(TurnstileError::config(
                    format!("priority_overrides.{name}"),
                    format!(
                        "priority {priority} out of range ({MIN_PRIORITY}-{MAX_PRIORITY})"
                    ),
                ));
            }
        }
        Ok(())
    }
}
