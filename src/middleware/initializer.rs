//! Builds configured middlewares and hands them to a [`Manager`].

use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::builtin::{LoggerMiddleware, RecoveryMiddleware, RequestIdMiddleware, SecurityMiddleware};
use super::manager::Manager;
use super::rate_limit::RateLimitMiddleware;
use super::Middleware;
use crate::config::AppConfig;
use crate::error::{Result, TurnstileError};

/// Reads configuration and constructs the middlewares it enables.
#[derive(Default)]
pub struct Initializer {
    config: RwLock<Option<AppConfig>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Initializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a YAML configuration file.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading middleware config");
        let config = AppConfig::load(path)?;
        self.load(config.clone())?;
        Ok(config)
    }

    /// Adopt an already parsed configuration after validating it.
    pub fn load(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = Some(config);
        Ok(())
    }

    pub fn config(&self) -> Option<AppConfig> {
        self.config.read().clone()
    }

    /// Construct every configured middleware.
    ///
    /// Construction failures are collected and reported together; the
    /// middlewares that did build remain available through [`get`](Self::get).
    pub fn initialize(&self) -> Result<Vec<Arc<dyn Middleware>>> {
        let config = self.config().ok_or_else(|| {
            TurnstileError::Registry("config not loaded, call load_from_file first".to_string())
        })?;
        let sections = &config.middleware;

        let mut built: Vec<Arc<dyn Middleware>> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut collect = |name: &str, result: Result<Arc<dyn Middleware>>| match result {
            Ok(middleware) => built.push(middleware),
            Err(e) => {
                error!(name = %name, error = %e, "Failed to create middleware");
                failures.push(format!("{name}: {e}"));
            }
        };

        if let Some(section) = &sections.request_id {
            collect(
                "request_id",
                RequestIdMiddleware::new(section).map(|m| Arc::new(m) as Arc<dyn Middleware>),
            );
        }
        if let Some(section) = &sections.recovery {
            collect("recovery", Ok(Arc::new(RecoveryMiddleware::new(section))));
        }
        if let Some(section) = &sections.security {
            collect(
                "security",
                SecurityMiddleware::new(section).map(|m| Arc::new(m) as Arc<dyn Middleware>),
            );
        }
        if let Some(section) = &sections.logger {
            collect("logger", Ok(Arc::new(LoggerMiddleware::new(section))));
        }
        if let Some(section) = sections.rate_limit.as_ref().filter(|s| s.enabled) {
            collect(
                "rate_limit",
                RateLimitMiddleware::new(section.clone()).map(|m| Arc::new(m) as Arc<dyn Middleware>),
            );
        }

        *self.middlewares.write() = built.clone();

        if !failures.is_empty() {
            error!(
                failed = failures.len(),
                succeeded = built.len(),
                "Some middlewares failed to initialize"
            );
            return Err(TurnstileError::Registry(format!(
                "{} middlewares failed to initialize: {}",
                failures.len(),
                failures.join("; ")
            )));
        }

        info!(total = built.len(), "All middlewares initialized");
        Ok(built)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Middleware>> {
        self.middlewares
            .read()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| TurnstileError::Registry(format!("middleware {name} not found")))
    }

    /// Names of the built middlewares, in construction order.
    pub fn names(&self) -> Vec<String> {
        self.middlewares
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Register every built middleware and apply the configured priority overrides.
    pub fn register_all(&self, manager: &Manager) -> Result<()> {
        for middleware in self.middlewares.read().iter() {
            manager.register(middleware.clone())?;
        }
        if let Some(config) = self.config.read().as_ref() {
            for (name, priority) in &config.priority_overrides {
                manager.set_priority_override(name, *priority);
            }
        }
        Ok(())
    }

    /// Re-read the configuration file and hot-reload what supports it.
    ///
    /// Only the rate limit section and priority overrides change at runtime;
    /// other sections take effect on restart. Overrides missing from the new
    /// file are cleared, and chains already applied to a router are reordered.
    pub async fn reload_from_file(&self, path: impl AsRef<Path>, manager: &Manager) -> Result<()> {
        let path = path.as_ref();
        let config = AppConfig::load(path)?;

        if manager.registry().contains("rate_limit") {
            let fragment = match &config.middleware.rate_limit {
                Some(section) => serde_json::to_value(section)?,
                None => serde_json::json!({ "enabled": false }),
            };
            manager.reload("rate_limit", &fragment).await?;
        } else if config.middleware.rate_limit.as_ref().is_some_and(|s| s.enabled) {
            warn!("rate_limit was not enabled at startup, restart to enable it");
        }

        let stale: Vec<String> = manager
            .registry()
            .overrides()
            .into_keys()
            .filter(|name| !config.priority_overrides.contains_key(name))
            .collect();
        for name in &stale {
            manager.clear_priority_override(name);
        }
        for (name, priority) in &config.priority_overrides {
            manager.set_priority_override(name, *priority);
        }

        info!(path = %path.display(), "Configuration reloaded");
        *self.config.write() = Some(config);
        Ok(())
    }
}
