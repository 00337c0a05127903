//! Cumulative admission statistics.
//!
//! Statistics live apart from the quota state of each limiter so that
//! resetting a key's quota leaves its history intact.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of admission decisions for one key or for a whole limiter.
///
/// `total_requests == allowed_requests + rejected_requests` always holds
/// because every decision updates all three under the same lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
    pub last_request_time: Option<DateTime<Utc>>,
}

impl LimiterStats {
    fn record(&mut self, allowed: bool, at: DateTime<Utc>) {
        self.total_requests += 1;
        if allowed {
            self.allowed_requests += 1;
        } else {
            self.rejected_requests += 1;
        }
        self.last_request_time = Some(at);
    }
}

/// Limiter-wide counters updated without locking.
///
/// The total is derived from the two outcome counters when a snapshot is
/// taken, so it always equals their sum.
#[derive(Debug, Default)]
struct Totals {
    allowed: AtomicU64,
    rejected: AtomicU64,
    /// Milliseconds since the Unix epoch of the last decision, 0 when none
    last_request_ms: AtomicI64,
}

impl Totals {
    fn record(&self, allowed: bool, at: DateTime<Utc>) {
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        self.last_request_ms
            .fetch_max(at.timestamp_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> LimiterStats {
        let allowed_requests = self.allowed.load(Ordering::Relaxed);
        let rejected_requests = self.rejected.load(Ordering::Relaxed);
        let last_request_ms = self.last_request_ms.load(Ordering::Relaxed);
        LimiterStats {
            total_requests: allowed_requests + rejected_requests,
            allowed_requests,
            rejected_requests,
            last_request_time: (last_request_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_request_ms).single())
                .flatten(),
        }
    }
}

/// Per-key statistics plus limiter-wide totals.
///
/// Per-key entries live in a sharded map, so keys on different shards never
/// contend.
#[derive(Debug, Default)]
pub(crate) struct StatsTable {
    per_key: DashMap<String, LimiterStats>,
    totals: Totals,
}

impl StatsTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, key: &str, allowed: bool) {
        let now = Utc::now();
        match self.per_key.get_mut(key) {
            Some(mut stats) => stats.record(allowed, now),
            None => self
                .per_key
                .entry(key.to_string())
                .or_default()
                .record(allowed, now),
        }
        self.totals.record(allowed, now);
    }

    pub(crate) fn get(&self, key: &str) -> Option<LimiterStats> {
        self.per_key.get(key).map(|stats| stats.clone())
    }

    pub(crate) fn totals(&self) -> LimiterStats {
        self.totals.snapshot()
    }

    pub(crate) fn len(&self) -> usize {
        self.per_key.len()
    }

    /// Drop per-key entries with no request for longer than `idle`.
    ///
    /// Totals are never evicted.
    pub(crate) fn evict_idle(&self, idle: Duration) -> usize {
        let Ok(idle) = chrono::Duration::from_std(idle) else {
            return 0;
        };
        let cutoff = Utc::now() - idle;
        let before = self.per_key.len();
        self.per_key
            .retain(|_, stats| stats.last_request_time.map_or(false, |at| at > cutoff));
        before.saturating_sub(self.per_key.len())
    }
}
