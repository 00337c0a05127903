//! Continuous-refill token bucket limiter.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::config::{RateLimitConfig, Strategy};
use super::limiter::Limiter;
use super::stats::{LimiterStats, StatsTable};
use super::sweeper::Sweeper;
use crate::error::{LimiterError, Result};

#[derive(Debug, Clone, Copy)]
struct Params {
    rate: f64,
    burst: f64,
    idle_ttl: Duration,
}

impl Params {
    fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            rate: config.rate as f64,
            burst: config.burst as f64,
            idle_ttl: config.cleanup_period(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

/// Outcome of one acquisition attempt against a bucket.
enum Acquire {
    Granted,
    /// Time until the next whole token under the current rate.
    Retry(Duration),
}

impl Bucket {
    fn full(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            last_access: now,
        }
    }

    fn refill(&mut self, params: Params, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * params.rate).min(params.burst);
        self.last_refill = now;
    }

    fn try_acquire(&mut self, params: Params, now: Instant) -> Acquire {
        self.last_access = now;
        self.refill(params, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Acquire::Granted
        } else {
            let missing = 1.0 - self.tokens;
            Acquire::Retry(Duration::from_secs_f64(missing / params.rate))
        }
    }
}

struct Shared {
    // Outer lock guards only insertion and removal of buckets.
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    params: RwLock<Params>,
    stats: StatsTable,
}

impl Shared {
    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return bucket.clone();
        }
        let burst = self.params.read().burst;
        let mut buckets = self.buckets.write();
        // Another task may have created it between the two locks.
        buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(key = %key, "Creating token bucket");
                Arc::new(Mutex::new(Bucket::full(burst, Instant::now())))
            })
            .clone()
    }

    fn sweep(&self) -> usize {
        let ttl = self.params.read().idle_ttl;
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.lock().last_access) < ttl);
        let evicted = before - buckets.len();
        drop(buckets);
        self.stats.evict_idle(ttl);
        evicted
    }
}

/// Token bucket limiter: capacity `burst`, refilled at `rate` tokens per second.
///
/// Each key owns a bucket behind its own mutex. Callers clone the bucket's
/// `Arc` before locking it, so a sweep or reset that removes the bucket
/// never disturbs a caller already holding it.
pub struct TokenBucketLimiter {
    shared: Arc<Shared>,
    sweeper: Sweeper,
}

impl TokenBucketLimiter {
    /// Validate `config` and start the idle sweeper.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            buckets: RwLock::new(HashMap::new()),
            params: RwLock::new(Params::from_config(config)),
            stats: StatsTable::new(),
        });
        let sweep_state = shared.clone();
        let sweeper = Sweeper::spawn("token_bucket", config.cleanup_period(), move || {
            sweep_state.sweep()
        })?;
        Ok(Self { shared, sweeper })
    }

    fn try_acquire(&self, bucket: &Mutex<Bucket>) -> Acquire {
        let params = *self.shared.params.read();
        bucket.lock().try_acquire(params, Instant::now())
    }

    #[cfg(test)]
    fn tokens(&self, key: &str) -> Option<f64> {
        let buckets = self.shared.buckets.read();
        buckets.get(key).map(|bucket| bucket.lock().tokens)
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn strategy(&self) -> Strategy {
        Strategy::TokenBucket
    }

    async fn allow(&self, key: &str) -> bool {
        let bucket = self.shared.bucket(key);
        let allowed = matches!(self.try_acquire(&bucket), Acquire::Granted);
        self.shared.stats.record(key, allowed);
        allowed
    }

    async fn wait(
        &self,
        key: &str,
        deadline: Option<Duration>,
    ) -> std::result::Result<(), LimiterError> {
        let started = Instant::now();
        let bucket = self.shared.bucket(key);
        loop {
            let delay = match self.try_acquire(&bucket) {
                Acquire::Granted => {
                    self.shared.stats.record(key, true);
                    return Ok(());
                }
                Acquire::Retry(delay) => delay,
            };

            let sleep_for = match deadline {
                Some(limit) => {
                    let waited = started.elapsed();
                    if waited >= limit {
                        self.shared.stats.record(key, false);
                        debug!(key = %key, ?waited, "Wait deadline exceeded");
                        return Err(LimiterError::DeadlineExceeded {
                            key: key.to_string(),
                            waited,
                        });
                    }
                    delay.min(limit - waited)
                }
                None => delay,
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    async fn reset(&self, key: &str) {
        if self.shared.buckets.write().remove(key).is_some() {
            debug!(key = %key, "Reset token bucket");
        }
    }

    fn stats(&self, key: &str) -> Option<LimiterStats> {
        self.shared.stats.get(key)
    }

    fn total_stats(&self) -> LimiterStats {
        self.shared.stats.totals()
    }

    fn count(&self) -> usize {
        self.shared.buckets.read().len()
    }

    fn reconfigure(&self, config: &RateLimitConfig) -> Result<()> {
        config.validate()?;
        // Existing buckets keep their tokens and pick up the new rate and
        // capacity on their next refill.
        *self.shared.params.write() = Params::from_config(config);
        debug!(rate = config.rate, burst = config.burst, "Reconfigured token bucket limiter");
        Ok(())
    }

    async fn stop(&self) {
        self.sweeper.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: i64, burst: i64) -> RateLimitConfig {
        RateLimitConfig {
            rate,
            burst,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_burst_then_reject() {
        let limiter = TokenBucketLimiter::new(&config(10, 20)).unwrap();
        for i in 0..20 {
            assert!(limiter.allow("test-key").await, "request {} should be allowed", i + 1);
        }
        assert!(!limiter.allow("test-key").await, "request 21 should be rejected");
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let limiter = TokenBucketLimiter::new(&config(10, 10)).unwrap();
        for _ in 0..10 {
            assert!(limiter.allow("k").await);
        }
        assert!(!limiter.allow("k").await);

        // 150ms at 10 tokens/s is 1.5 tokens.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.allow("k").await);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = TokenBucketLimiter::new(&config(1, 1)).unwrap();
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);
        assert!(limiter.allow("b").await);
        assert_eq!(limiter.count(), 2);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_reset_restores_quota_but_keeps_stats() {
        let limiter = TokenBucketLimiter::new(&config(1, 2)).unwrap();
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        limiter.reset("k").await;
        assert_eq!(limiter.count(), 0);
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);

        let stats = limiter.stats("k").unwrap();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.allowed_requests, 4);
        assert_eq!(stats.rejected_requests, 1);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_wait_acquires_after_refill() {
        let limiter = TokenBucketLimiter::new(&config(20, 20)).unwrap();
        for _ in 0..20 {
            assert!(limiter.allow("k").await);
        }
        let started = Instant::now();
        limiter.wait("k", Some(Duration::from_secs(2))).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(limiter.stats("k").unwrap().allowed_requests, 21);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_wait_deadline_does_not_consume() {
        let limiter = TokenBucketLimiter::new(&config(1, 1)).unwrap();
        assert!(limiter.allow("k").await);

        let err = limiter
            .wait("k", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::DeadlineExceeded { .. }));

        // A deadline abort leaves the partially refilled bucket intact.
        let tokens = limiter.tokens("k").unwrap();
        assert!(tokens > 0.0 && tokens < 1.0, "tokens = {tokens}");
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_dropped_wait_does_not_consume() {
        let limiter = TokenBucketLimiter::new(&config(5, 5)).unwrap();
        for _ in 0..5 {
            assert!(limiter.allow("k").await);
        }
        let outcome = tokio::time::timeout(Duration::from_millis(20), limiter.wait("k", None)).await;
        assert!(outcome.is_err());

        // 250ms at 5 tokens/s refills a token that nobody took.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(limiter.allow("k").await);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_existing_buckets() {
        let limiter = TokenBucketLimiter::new(&config(10, 10)).unwrap();
        for _ in 0..10 {
            assert!(limiter.allow("existing").await);
        }

        limiter.reconfigure(&config(20, 20)).unwrap();

        // The bucket was not evicted or refilled to the new capacity.
        assert_eq!(limiter.count(), 1);
        assert!(!limiter.allow("existing").await);

        // 120ms at the new rate yields 2.4 tokens; the old rate would give 1.2.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.allow("existing").await);
        assert!(limiter.allow("existing").await);

        // New keys start with the new capacity.
        for i in 0..20 {
            assert!(limiter.allow("fresh").await, "fresh request {}", i + 1);
        }
        assert!(!limiter.allow("fresh").await);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        for invalid in [
            config(0, 1),
            config(10, 5),
            RateLimitConfig {
                cleanup_interval: 0,
                ..config(10, 10)
            },
        ] {
            let err = TokenBucketLimiter::new(&invalid).err().unwrap();
            assert!(err.field().is_some(), "{err}");
        }
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_invalid_config() {
        let limiter = TokenBucketLimiter::new(&config(1, 1)).unwrap();
        assert!(limiter.allow("k").await);

        let err = limiter.reconfigure(&config(0, 1)).unwrap_err();
        assert_eq!(err.field(), Some("rate_limit.rate"));

        // The previous rate is still in effect, so a rejection has a finite retry.
        assert!(!limiter.allow("k").await);
        assert_eq!(limiter.shared.params.read().rate, 1.0);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_buckets() {
        let limiter = TokenBucketLimiter::new(&config(10, 10)).unwrap();
        assert!(limiter.allow("idle").await);

        // Held by an in-flight caller across the sweep.
        let held = limiter.shared.bucket("idle");
        limiter.shared.params.write().idle_ttl = Duration::from_millis(10);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(limiter.shared.sweep(), 1);
        assert_eq!(limiter.count(), 0);
        assert!(matches!(limiter.try_acquire(&held), Acquire::Granted));
        assert_eq!(limiter.total_stats().total_requests, 1);
        limiter.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_creates_one_bucket() {
        let limiter = Arc::new(TokenBucketLimiter::new(&config(50, 50)).unwrap());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut allowed = 0;
                for _ in 0..10 {
                    if limiter.allow("shared").await {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        // Refill during the test can add a token or two, never a second bucket.
        assert!((50..=52).contains(&total), "allowed {total}");
        assert_eq!(limiter.count(), 1);
        assert_eq!(limiter.total_stats().total_requests, 100);
        limiter.stop().await;
    }
}
