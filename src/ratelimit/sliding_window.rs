//! In-process sliding window log limiter.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
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
    limit: usize,
    window: Duration,
    idle_ttl: Duration,
}

impl Params {
    fn from_config(config: &RateLimitConfig) -> Self {
        // burst >= rate is validated, so the log never grows past burst.
        Self {
            limit: config.rate.min(config.burst).max(0) as usize,
            window: config.window(),
            idle_ttl: config.cleanup_period(),
        }
    }
}

/// Ascending admission timestamps inside the trailing window.
#[derive(Debug)]
struct Window {
    stamps: VecDeque<Instant>,
    last_access: Instant,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            stamps: VecDeque::new(),
            last_access: now,
        }
    }

    /// Drop every timestamp at or before `now - window`.
    fn prune(&mut self, window: Duration, now: Instant) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        let expired = self.stamps.partition_point(|t| *t <= cutoff);
        self.stamps.drain(..expired);
    }

    fn admit(&mut self, params: Params, now: Instant) -> bool {
        self.last_access = now;
        self.prune(params.window, now);
        if self.stamps.len() >= params.limit {
            return false;
        }
        self.stamps.push_back(now);
        true
    }
}

struct Shared {
    windows: RwLock<HashMap<String, Arc<Mutex<Window>>>>,
    params: RwLock<Params>,
    stats: StatsTable,
}

impl Shared {
    fn window(&self, key: &str) -> Arc<Mutex<Window>> {
        if let Some(window) = self.windows.read().get(key) {
            return window.clone();
        }
        let mut windows = self.windows.write();
        windows
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(key = %key, "Creating sliding window");
                Arc::new(Mutex::new(Window::new(Instant::now())))
            })
            .clone()
    }

    fn sweep(&self) -> usize {
        let params = *self.params.read();
        let now = Instant::now();
        let mut windows = self.windows.write();
        let before = windows.len();
        windows.retain(|_, window| {
            let mut window = window.lock();
            window.prune(params.window, now);
            !window.stamps.is_empty() || now.duration_since(window.last_access) < params.idle_ttl
        });
        let evicted = before - windows.len();
        drop(windows);
        self.stats.evict_idle(params.idle_ttl);
        evicted
    }
}

/// Sliding window limiter: at most `rate` admissions per key in any
/// trailing `window_size` seconds.
pub struct SlidingWindowLimiter {
    shared: Arc<Shared>,
    sweeper: Sweeper,
}

impl SlidingWindowLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            windows: RwLock::new(HashMap::new()),
            params: RwLock::new(Params::from_config(config)),
            stats: StatsTable::new(),
        });
        let sweep_state = shared.clone();
        let sweeper = Sweeper::spawn("sliding_window", config.cleanup_period(), move || {
            sweep_state.sweep()
        })?;
        Ok(Self { shared, sweeper })
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn strategy(&self) -> Strategy {
        Strategy::SlidingWindow
    }

    async fn allow(&self, key: &str) -> bool {
        let window = self.shared.window(key);
        let params = *self.shared.params.read();
        let allowed = window.lock().admit(params, Instant::now());
        self.shared.stats.record(key, allowed);
        allowed
    }

    async fn wait(
        &self,
        _key: &str,
        _deadline: Option<Duration>,
    ) -> std::result::Result<(), LimiterError> {
        Err(LimiterError::WaitUnsupported {
            strategy: Strategy::SlidingWindow.as_str(),
        })
    }

    async fn reset(&self, key: &str) {
        if self.shared.windows.write().remove(key).is_some() {
            debug!(key = %key, "Reset sliding window");
        }
    }

    fn stats(&self, key: &str) -> Option<LimiterStats> {
        self.shared.stats.get(key)
    }

    fn total_stats(&self) -> LimiterStats {
        self.shared.stats.totals()
    }

    fn count(&self) -> usize {
        self.shared.windows.read().len()
    }

    fn reconfigure(&self, config: &RateLimitConfig) -> Result<()> {
        config.validate()?;
        *self.shared.params.write() = Params::from_config(config);
        debug!(
            rate = config.rate,
            window_size = config.window_size,
            "Reconfigured sliding window limiter"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.sweeper.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: i64, window_size: u64) -> RateLimitConfig {
        RateLimitConfig {
            strategy: Strategy::SlidingWindow,
            rate,
            burst: rate * 2,
            window_size,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_window_limit_and_recovery() {
        let limiter = SlidingWindowLimiter::new(&config(5, 1)).unwrap();
        for i in 0..5 {
            assert!(limiter.allow("test-key").await, "request {} should be allowed", i + 1);
        }
        assert!(!limiter.allow("test-key").await, "request 6 should be rejected");

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(limiter.allow("test-key").await, "request 7 should be allowed");
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_rejections_do_not_extend_window() {
        let limiter = SlidingWindowLimiter::new(&config(2, 60)).unwrap();
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        for _ in 0..10 {
            assert!(!limiter.allow("k").await);
        }
        let window = limiter.shared.window("k");
        assert_eq!(window.lock().stamps.len(), 2);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_wait_is_unsupported() {
        let limiter = SlidingWindowLimiter::new(&config(5, 1)).unwrap();
        let err = limiter.wait("k", None).await.unwrap_err();
        assert_eq!(
            err,
            LimiterError::WaitUnsupported {
                strategy: "sliding_window"
            }
        );
        assert!(err.to_string().contains("token_bucket"));
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_reset_clears_window_not_stats() {
        let limiter = SlidingWindowLimiter::new(&config(1, 60)).unwrap();
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        limiter.reset("k").await;
        assert!(limiter.allow("k").await);

        let stats = limiter.stats("k").unwrap();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.allowed_requests, 2);
        assert_eq!(stats.rejected_requests, 1);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_prune_uses_trailing_window() {
        let now = Instant::now();
        let mut window = Window::new(now);
        let params = Params {
            limit: 3,
            window: Duration::from_millis(100),
            idle_ttl: Duration::from_secs(60),
        };
        assert!(window.admit(params, now));
        assert!(window.admit(params, now + Duration::from_millis(50)));
        assert!(window.admit(params, now + Duration::from_millis(90)));
        assert!(!window.admit(params, now + Duration::from_millis(99)));
        // The first timestamp has left the window.
        assert!(window.admit(params, now + Duration::from_millis(100)));
        assert_eq!(window.stamps.len(), 3);
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_windows() {
        let limiter = SlidingWindowLimiter::new(&config(5, 60)).unwrap();
        assert!(limiter.allow("busy").await);
        limiter.shared.params.write().idle_ttl = Duration::from_millis(10);
        let _ = limiter.shared.window("empty");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // "busy" still holds a timestamp inside its 60s window.
        assert_eq!(limiter.shared.sweep(), 1);
        assert_eq!(limiter.count(), 1);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        assert!(SlidingWindowLimiter::new(&config(0, 1)).is_err());
        let err = SlidingWindowLimiter::new(&config(5, 0)).err().unwrap();
        assert_eq!(err.field(), Some("rate_limit.window_size"));
    }

    #[tokio::test]
    async fn test_reconfigure_applies_new_limit() {
        let limiter = SlidingWindowLimiter::new(&config(2, 60)).unwrap();
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        limiter.reconfigure(&config(3, 60)).unwrap();
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        assert!(limiter.reconfigure(&config(-1, 60)).is_err());
        assert_eq!(limiter.shared.params.read().limit, 3);
        limiter.stop().await;
    }
}
