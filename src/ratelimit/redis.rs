//! Redis-backed sliding window limiter shared by every instance.
//!
//! Each key is a sorted set of admission timestamps. One Lua script prunes,
//! counts and conditionally inserts, so concurrent instances never race
//! between the check and the insert. Backend failures fail open.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, RedisError, RedisResult, Script};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::config::{RateLimitConfig, RedisConfig, Strategy};
use super::limiter::Limiter;
use super::stats::{LimiterStats, StatsTable};
use super::sweeper::Sweeper;
use crate::error::{LimiterError, Result};

/// KEYS[1] = limiter key
/// ARGV = now (ms), window (ms), limit, unique member
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window + 1000)
    return 1
end
return 0
"#;

#[derive(Debug, Clone, Copy)]
struct Params {
    limit: i64,
    window: Duration,
    idle_ttl: Duration,
}

impl Params {
    fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            limit: config.rate,
            window: config.window(),
            idle_ttl: config.cleanup_period(),
        }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

fn timed_out(what: &'static str) -> RedisError {
    RedisError::from((ErrorKind::IoError, what))
}

struct Inner {
    client: redis::Client,
    settings: RedisConfig,
    // Each slot caches one multiplexed connection, dialed on first use.
    slots: Vec<Mutex<Option<MultiplexedConnection>>>,
    next_slot: AtomicUsize,
    script: Script,
    params: RwLock<Params>,
    stats: StatsTable,
    degraded: AtomicU64,
}

impl Inner {
    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.settings.key_prefix, key)
    }

    async fn dial(&self) -> RedisResult<MultiplexedConnection> {
        let mut attempt = 0;
        loop {
            let result = match timeout(
                self.settings.dial_timeout(),
                self.client.get_multiplexed_async_connection(),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(timed_out("redis dial timed out")),
            };
            match result {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt >= self.settings.max_retries => return Err(e),
                Err(e) => {
                    debug!(attempt, error = %e, "Redis dial failed, retrying");
                    let backoff = Duration::from_millis(8u64 << attempt.min(6));
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Cached connection of `slot`, dialing a new one when the slot is empty.
    ///
    /// The slot lock is only held to read or install the connection, never
    /// across a dial, so callers queued on one slot do not pay for each
    /// other's connect attempts.
    async fn connection(&self, slot: usize) -> RedisResult<MultiplexedConnection> {
        if let Some(conn) = self.slots[slot].lock().await.as_ref() {
            return Ok(conn.clone());
        }
        let dialed = self.dial().await?;
        let mut cached = self.slots[slot].lock().await;
        // A concurrent caller may have filled the slot while we dialed.
        Ok(cached.get_or_insert(dialed).clone())
    }

    /// Forget the cached connection of `slot` after a failure.
    ///
    /// Skipped when the slot is busy; the next failure clears it instead.
    fn discard(&self, slot: usize) {
        if let Ok(mut cached) = self.slots[slot].try_lock() {
            cached.take();
        }
    }

    /// Upper bound for one admission round trip, connect included.
    fn call_budget(&self) -> Duration {
        self.settings.dial_timeout() + self.settings.read_timeout()
    }

    fn pick_slot(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len()
    }

    async fn try_allow(&self, key: &str, slot: usize) -> RedisResult<bool> {
        let params = *self.params.read();
        let attempt = async {
            let mut conn = self.connection(slot).await?;
            let now = Utc::now().timestamp_millis();
            let member = format!("{}-{}", now, uuid::Uuid::new_v4());
            let admitted: i64 = self
                .script
                .key(self.redis_key(key))
                .arg(now)
                .arg(params.window_ms())
                .arg(params.limit)
                .arg(member)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, RedisError>(admitted == 1)
        };
        timeout(self.call_budget(), attempt)
            .await
            .map_err(|_| timed_out("redis admission timed out"))?
    }

    async fn warm_up(&self) {
        let wanted = (self.settings.min_idle_conns as usize).min(self.slots.len());
        for slot in 0..wanted {
            if let Err(e) = self.connection(slot).await {
                debug!(slot, error = %e, "Redis warm-up dial failed");
                return;
            }
        }
    }
}

/// Distributed limiter: at most `rate` admissions per key in any trailing
/// `window_size` seconds across every instance sharing the Redis server.
///
/// Local statistics mirror this instance's decisions for introspection
/// only; the sorted sets in Redis are authoritative.
pub struct RedisLimiter {
    inner: Arc<Inner>,
    sweeper: Sweeper,
}

impl RedisLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let client = redis::Client::open(config.redis.url().as_str())?;
        let slots = (0..config.redis.pool_size.max(1))
            .map(|_| Mutex::new(None))
            .collect();
        let inner = Arc::new(Inner {
            client,
            settings: config.redis.clone(),
            slots,
            next_slot: AtomicUsize::new(0),
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            params: RwLock::new(Params::from_config(config)),
            stats: StatsTable::new(),
            degraded: AtomicU64::new(0),
        });

        let sweep_state = inner.clone();
        let sweeper = Sweeper::spawn("redis", config.cleanup_period(), move || {
            let ttl = sweep_state.params.read().idle_ttl;
            sweep_state.stats.evict_idle(ttl)
        })?;

        if config.redis.min_idle_conns > 0 {
            let warm = inner.clone();
            tokio::spawn(async move { warm.warm_up().await });
        }

        debug!(addr = %config.redis.addr, pool_size = config.redis.pool_size, "Redis limiter ready");
        Ok(Self { inner, sweeper })
    }

    /// Requests admitted because the backend could not be consulted.
    pub fn degraded_requests(&self) -> u64 {
        self.inner.degraded.load(Ordering::Relaxed)
    }

    /// Number of admissions currently recorded for `key` inside the window.
    pub async fn get_current_usage(&self, key: &str) -> Result<u64> {
        let window_ms = self.inner.params.read().window_ms();
        let slot = self.inner.pick_slot();
        let query = async {
            let mut conn = self.inner.connection(slot).await?;
            let since = Utc::now().timestamp_millis() - window_ms;
            redis::cmd("ZCOUNT")
                .arg(self.inner.redis_key(key))
                .arg(format!("({since}"))
                .arg("+inf")
                .query_async::<_, u64>(&mut conn)
                .await
        };
        let result = timeout(self.inner.call_budget(), query)
            .await
            .map_err(|_| timed_out("redis usage query timed out"))
            .and_then(|result| result);
        if result.is_err() {
            self.inner.discard(slot);
        }
        Ok(result?)
    }
}

#[async_trait]
impl Limiter for RedisLimiter {
    fn strategy(&self) -> Strategy {
        Strategy::Redis
    }

    async fn allow(&self, key: &str) -> bool {
        let slot = self.inner.pick_slot();
        let allowed = match self.inner.try_allow(key, slot).await {
            Ok(allowed) => allowed,
            Err(e) => {
                let degraded = self.inner.degraded.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(key = %key, error = %e, degraded, "Redis unavailable, failing open");
                self.inner.discard(slot);
                true
            }
        };
        self.inner.stats.record(key, allowed);
        allowed
    }

    async fn wait(
        &self,
        _key: &str,
        _deadline: Option<Duration>,
    ) -> std::result::Result<(), LimiterError> {
        Err(LimiterError::WaitUnsupported {
            strategy: Strategy::Redis.as_str(),
        })
    }

    async fn reset(&self, key: &str) {
        let slot = self.inner.pick_slot();
        let result = async {
            let mut conn = self.inner.connection(slot).await?;
            timeout(
                self.inner.settings.write_timeout(),
                redis::cmd("DEL")
                    .arg(self.inner.redis_key(key))
                    .query_async::<_, i64>(&mut conn),
            )
            .await
            .map_err(|_| timed_out("redis reset timed out"))?
        }
        .await;

        match result {
            Ok(_) => debug!(key = %key, "Reset redis window"),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to reset redis window");
                self.inner.discard(slot);
            }
        }
    }

    fn stats(&self, key: &str) -> Option<LimiterStats> {
        self.inner.stats.get(key)
    }

    fn total_stats(&self) -> LimiterStats {
        self.inner.stats.totals()
    }

    fn count(&self) -> usize {
        self.inner.stats.len()
    }

    fn reconfigure(&self, config: &RateLimitConfig) -> Result<()> {
        config.validate()?;
        *self.inner.params.write() = Params::from_config(config);
        debug!(
            rate = config.rate,
            window_size = config.window_size,
            "Reconfigured redis limiter"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.sweeper.stop().await;
    }
}
