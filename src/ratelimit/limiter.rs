//! Limiter contract and strategy factory.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::config::{RateLimitConfig, Strategy};
use super::redis::RedisLimiter;
use super::sliding_window::SlidingWindowLimiter;
use super::stats::LimiterStats;
use super::token_bucket::TokenBucketLimiter;
use crate::error::{LimiterError, Result};

/// Trait for admission strategies.
///
/// This trait abstracts over the in-process limiters and the Redis-backed
/// one so the middleware can hold any of them behind an `Arc<dyn Limiter>`.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// The strategy this limiter implements.
    fn strategy(&self) -> Strategy;

    /// Non-blocking admission decision for `key`.
    async fn allow(&self, key: &str) -> bool;

    /// Suspend until `key` is admitted or `deadline` elapses.
    ///
    /// Dropping the returned future abandons the wait without consuming
    /// quota. Strategies without a queueing model return
    /// [`LimiterError::WaitUnsupported`].
    async fn wait(&self, key: &str, deadline: Option<Duration>) -> std::result::Result<(), LimiterError>;

    /// Clear the active quota of `key`. Cumulative statistics are kept.
    async fn reset(&self, key: &str);

    /// Cumulative statistics of `key`, if it has been seen.
    fn stats(&self, key: &str) -> Option<LimiterStats>;

    /// Cumulative statistics across every key since construction.
    fn total_stats(&self) -> LimiterStats;

    /// Number of per-key states currently held in memory.
    fn count(&self) -> usize;

    /// Adopt new numeric parameters of a same-strategy configuration.
    ///
    /// An invalid configuration is rejected and the current parameters stay.
    fn reconfigure(&self, config: &RateLimitConfig) -> Result<()>;

    /// Stop the background sweeper and wait for it to exit.
    async fn stop(&self);
}

/// Construct the limiter selected by `config.strategy`.
///
/// Must be called inside a tokio runtime because every limiter owns a
/// background sweep task.
pub fn build_limiter(config: &RateLimitConfig) -> Result<Arc<dyn Limiter>> {
    config.validate()?;
    let limiter: Arc<dyn Limiter> = match config.strategy {
        Strategy::TokenBucket => Arc::new(TokenBucketLimiter::new(config)?),
        Strategy::SlidingWindow => Arc::new(SlidingWindowLimiter::new(config)?),
        Strategy::Redis => Arc::new(RedisLimiter::new(config)?),
    };
    info!(
        strategy = %config.strategy,
        rate = config.rate,
        burst = config.burst,
        "Constructed rate limiter"
    );
    Ok(limiter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;

    #[tokio::test]
    async fn test_factory_selects_strategy() {
        for strategy in [Strategy::TokenBucket, Strategy::SlidingWindow, Strategy::Redis] {
            let config = RateLimitConfig {
                strategy,
                rate: 10,
                burst: 20,
                ..RateLimitConfig::default()
            };
            let limiter = build_limiter(&config).unwrap();
            assert_eq!(limiter.strategy(), strategy);
            limiter.stop().await;
        }
    }

    #[tokio::test]
    async fn test_factory_rejects_invalid_config() {
        let config = RateLimitConfig {
            rate: -1,
            ..RateLimitConfig::default()
        };
        assert!(matches!(
            build_limiter(&config),
            Err(TurnstileError::Config { .. })
        ));
    }

    #[test]
    fn test_factory_outside_runtime() {
        let result = build_limiter(&RateLimitConfig::default());
        assert!(matches!(
            result,
            Err(TurnstileError::Limiter(LimiterError::NoRuntime))
        ));
    }

    #[tokio::test]
    async fn test_stats_invariant_across_strategies() {
        for strategy in [Strategy::TokenBucket, Strategy::SlidingWindow] {
            let config = RateLimitConfig {
                strategy,
                rate: 3,
                burst: 3,
                window_size: 60,
                ..RateLimitConfig::default()
            };
            let limiter = build_limiter(&config).unwrap();
            for _ in 0..7 {
                limiter.allow("k").await;
            }
            let stats = limiter.stats("k").unwrap();
            assert_eq!(stats.total_requests, 7, "{strategy}");
            assert_eq!(
                stats.total_requests,
                stats.allowed_requests + stats.rejected_requests,
                "{strategy}"
            );
            assert_eq!(stats.allowed_requests, 3, "{strategy}");
            limiter.stop().await;
        }
    }
}
