//! Error types for the Turnstile admission core.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// A configuration value failed validation.
    #[error("invalid configuration for {field}: {message}")]
    Config {
        /// Dotted path of the offending field, e.g. `rate_limit.rate`.
        field: String,
        /// Human readable reason.
        message: String,
    },

    /// Middleware registry and chain errors
    #[error("middleware registry error: {0}")]
    Registry(String),

    /// Limiter errors
    #[error(transparent)]
    Limiter(#[from] LimiterError),

    /// Configuration source errors (file layering, environment overrides)
    #[error("configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON errors, mostly from reload fragments
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backing store errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Shorthand for a field-scoped configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The offending field when this is a configuration error.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Config { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Errors surfaced by [`Limiter`](crate::ratelimit::Limiter) implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimiterError {
    /// The strategy has no queueing model, so blocking admission is meaningless.
    #[error(
        "{strategy} limiter does not support Wait: admission within a hard window cannot be queued, use the token_bucket strategy for blocking admission"
    )]
    WaitUnsupported {
        /// Strategy identifier of the limiter that refused.
        strategy: &'static str,
    },

    /// The deadline passed before a token became available.
    #[error("wait for key {key} cancelled after {waited:?}: deadline exceeded")]
    DeadlineExceeded {
        /// Limiting key the caller waited on.
        key: String,
        /// Time spent waiting before giving up.
        waited: Duration,
    },

    /// Background sweeping needs a running tokio runtime.
    #[error("limiter must be constructed inside a tokio runtime")]
    NoRuntime,
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
