//! Rate limit configuration, validation and reload-fragment merging.
//!
//! A [`RateLimitConfig`] is validated eagerly whenever it is constructed from a
//! file or merged with a reload fragment. An invalid configuration never takes
//! effect partially: callers receive the error and keep their previous value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::key::KeyFuncKind;
use crate::error::{Result, TurnstileError};

const FIELD_PREFIX: &str = "rate_limit";

/// Admission strategy implemented by a [`Limiter`](super::Limiter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Strategy {
    /// Continuous-refill bucket with burst capacity.
    TokenBucket,
    /// Trailing-window request log kept in process memory.
    SlidingWindow,
    /// Trailing-window request log shared through Redis.
    Redis,
}

impl Strategy {
    /// Configuration identifier of this strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::TokenBucket => "token_bucket",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::Redis => "redis",
        }
    }

    /// Whether the strategy counts requests inside a fixed trailing window.
    pub fn is_windowed(&self) -> bool {
        matches!(self, Strategy::SlidingWindow | Strategy::Redis)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "token_bucket" => Ok(Strategy::TokenBucket),
            "sliding_window" => Ok(Strategy::SlidingWindow),
            "redis" => Ok(Strategy::Redis),
            other => Err(format!(
                "invalid strategy: {other} (expected token_bucket, sliding_window or redis)"
            )),
        }
    }
}

impl TryFrom<String> for Strategy {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Connection parameters for the Redis backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port` of the Redis server
    pub addr: String,
    /// Optional AUTH password
    pub password: Option<String>,
    /// Logical database index
    pub db: i64,
    /// Prefix prepended to every limiter key
    pub key_prefix: String,
    /// Number of multiplexed connections to spread commands over
    pub pool_size: u32,
    /// Connections dialed eagerly when the limiter starts
    pub min_idle_conns: u32,
    /// Extra dial attempts before a request fails open
    pub max_retries: u32,
    /// Dial timeout in milliseconds
    pub dial_timeout_ms: u64,
    /// Command (script round-trip) timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Timeout in milliseconds for writes outside the admission script
    pub write_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: None,
            db: 0,
            key_prefix: "ratelimit:".to_string(),
            pool_size: 10,
            min_idle_conns: 2,
            max_retries: 3,
            dial_timeout_ms: 1000,
            read_timeout_ms: 500,
            write_timeout_ms: 500,
        }
    }
}

impl RedisConfig {
    /// Connection URL understood by [`redis::Client::open`].
    pub fn url(&self) -> String {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}/{}", password, self.addr, self.db)
            }
            _ => format!("redis://{}/{}", self.addr, self.db),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Configuration of the rate limiting middleware and its limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// When false every request passes through untouched
    pub enabled: bool,
    /// Admission algorithm
    pub strategy: Strategy,
    /// Tokens per second (token bucket) or requests per window (windowed strategies)
    pub rate: i64,
    /// Bucket capacity; upper bound of per-key memory for windowed strategies
    pub burst: i64,
    /// Window length in seconds for windowed strategies
    pub window_size: u64,
    /// How the limiting key is derived from a request
    pub key_func: KeyFuncKind,
    /// Request paths that are never limited (exact match)
    pub skip_paths: Vec<String>,
    /// HTTP status written on rejection
    pub status_code: u16,
    /// Message carried in the rejection body
    pub message: String,
    /// Idle-sweep period and idle threshold in seconds
    pub cleanup_interval: u64,
    /// Backing store parameters for the redis strategy
    pub redis: RedisConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: Strategy::TokenBucket,
            rate: 100,
            burst: 200,
            window_size: 60,
            key_func: KeyFuncKind::Ip,
            skip_paths: Vec::new(),
            status_code: 429,
            message: "Too many requests, please try again later".to_string(),
            cleanup_interval: 60,
            redis: RedisConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// Validate every invariant of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.rate <= 0 {
            return Err(field_error("rate", format!("rate must be positive, got {}", self.rate)));
        }
        if self.burst <= 0 {
            return Err(field_error(
                "burst",
                format!("burst must be positive, got {}", self.burst),
            ));
        }
        if self.burst < self.rate {
            return Err(field_error(
                "burst",
                format!("burst ({}) should be >= rate ({})", self.burst, self.rate),
            ));
        }
        if !(100..600).contains(&self.status_code) {
            return Err(field_error(
                "status_code",
                format!("invalid status_code: {} (must be 100-599)", self.status_code),
            ));
        }
        if self.cleanup_interval == 0 {
            return Err(field_error("cleanup_interval", "cleanup_interval must be positive"));
        }
        if self.strategy.is_windowed() && self.window_size == 0 {
            return Err(field_error(
                "window_size",
                format!("window_size must be positive for the {} strategy", self.strategy),
            ));
        }
        if self.strategy == Strategy::Redis {
            if self.redis.addr.trim().is_empty() {
                return Err(field_error("redis.addr", "redis addr is required"));
            }
            if self.redis.pool_size == 0 {
                return Err(field_error("redis.pool_size", "pool_size must be positive"));
            }
        }
        Ok(())
    }

    /// Whether requests to `path` bypass rate limiting.
    pub fn should_skip_path(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| p == path)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_size)
    }

    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    /// Merge a partial configuration on top of this one and validate the result.
    ///
    /// Unknown keys are ignored. The `redis` object is merged key by key so a
    /// fragment can change a single connection parameter. `self` is never
    /// modified; the merged copy is returned only when it validates.
    pub fn apply_fragment(&self, fragment: &serde_json::Value) -> Result<RateLimitConfig> {
        let patch = fragment.as_object().ok_or_else(|| {
            TurnstileError::config(FIELD_PREFIX, "reload fragment must be an object")
        })?;

        let mut merged = serde_json::to_value(self)
            .map_err(|e| TurnstileError::config(FIELD_PREFIX, e.to_string()))?;
        let target = merged
            .as_object_mut()
            .ok_or_else(|| TurnstileError::config(FIELD_PREFIX, "configuration is not an object"))?;

        let known: BTreeSet<String> = target.keys().cloned().collect();
        for (key, value) in patch {
            if !known.contains(key) {
                continue;
            }
            match (target.get_mut(key), value) {
                (Some(serde_json::Value::Object(current)), serde_json::Value::Object(update)) => {
                    for (k, v) in update {
                        current.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    target.insert(key.clone(), value.clone());
                }
            }
        }

        let config: RateLimitConfig = serde_json::from_value(merged)
            .map_err(|e| TurnstileError::config(FIELD_PREFIX, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Whether switching to `other` requires a freshly constructed limiter.
    ///
    /// Numeric fields and the key function are updated in place. A different
    /// algorithm, sweep interval, or Redis endpoint for the redis strategy
    /// is not: the sweeper's tick is fixed when the limiter is built.
    pub fn requires_rebuild(&self, other: &RateLimitConfig) -> bool {
        if self.strategy != other.strategy || self.cleanup_interval != other.cleanup_interval {
            return true;
        }
        self.strategy == Strategy::Redis
            && (self.redis.url() != other.redis.url()
                || self.redis.pool_size != other.redis.pool_size
                || self.redis.key_prefix != other.redis.key_prefix)
    }
}

fn field_error(field: &str, message: impl Into<String>) -> TurnstileError {
    TurnstileError::config(format!("{FIELD_PREFIX}.{field}"), message)
}
