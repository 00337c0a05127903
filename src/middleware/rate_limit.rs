//! Rate limiting middleware binding configuration, key derivation and a limiter.

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Handler, Middleware, Reloadable};
use crate::error::Result;
use crate::ratelimit::{build_limiter, Limiter, LimiterStats, RateLimitConfig, RateLimitContext, Strategy};

/// Application error code carried in every rejection body.
pub const REJECTION_CODE: u32 = 42901;

const NAME: &str = "rate_limit";
const PRIORITY: i32 = 8;

/// A configuration and the limiter built from it, swapped as one unit.
struct ActiveLimiter {
    config: RateLimitConfig,
    limiter: Arc<dyn Limiter>,
}

/// Request interceptor that admits or rejects by limiting key.
pub struct RateLimitMiddleware {
    state: Arc<RwLock<Arc<ActiveLimiter>>>,
    // Serializes reloads so two fragments never race on the swap.
    reload_lock: tokio::sync::Mutex<()>,
}

impl RateLimitMiddleware {
    /// Validate `config` and construct its limiter.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        let limiter = build_limiter(&config)?;
        info!(
            strategy = %config.strategy,
            key_func = %config.key_func,
            enabled = config.enabled,
            "Rate limit middleware configured"
        );
        Ok(Self {
            state: Arc::new(RwLock::new(Arc::new(ActiveLimiter { config, limiter }))),
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(RateLimitConfig::default())
    }

    fn active(&self) -> Arc<ActiveLimiter> {
        self.state.read().clone()
    }

    pub fn config(&self) -> RateLimitConfig {
        self.active().config.clone()
    }

    pub fn strategy(&self) -> Strategy {
        self.active().config.strategy
    }

    /// The limiter currently serving requests.
    pub fn limiter(&self) -> Arc<dyn Limiter> {
        self.active().limiter.clone()
    }

    pub fn stats(&self, key: &str) -> Option<LimiterStats> {
        self.active().limiter.stats(key)
    }

    pub fn total_stats(&self) -> LimiterStats {
        self.active().limiter.total_stats()
    }

    /// Stop the active limiter's background sweeper.
    pub async fn stop(&self) {
        self.limiter().stop().await;
    }
}

fn rejection(config: &RateLimitConfig) -> Response {
    let status = StatusCode::from_u16(config.status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    let body = json!({
        "code": REJECTION_CODE,
        "message": config.message,
    });
    (status, Json(body)).into_response()
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    fn handler(&self) -> Handler {
        let state = self.state.clone();
        Arc::new(move |req: Request, next: Next| {
            // Each request sees one consistent configuration and limiter pair.
            let active = state.read().clone();
            async move {
                let config = &active.config;
                if !config.enabled || config.should_skip_path(req.uri().path()) {
                    return next.run(req).await;
                }

                let ctx = RateLimitContext::from_request(&req);
                let key = config.key_func.derive(&ctx);
                if active.limiter.allow(&key).await {
                    next.run(req).await
                } else {
                    debug!(key = %key, path = %ctx.path, method = %ctx.method, "Request rate limited");
                    rejection(config)
                }
            }
            .boxed()
        })
    }

    fn as_reloadable(&self) -> Option<&dyn Reloadable> {
        Some(self)
    }
}

#[async_trait]
impl Reloadable for RateLimitMiddleware {
    async fn reload(&self, fragment: &serde_json::Value) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        let current = self.active();
        let config = current.config.apply_fragment(fragment)?;

        if !current.config.requires_rebuild(&config) {
            current.limiter.reconfigure(&config)?;
            info!(
                strategy = %config.strategy,
                rate = config.rate,
                burst = config.burst,
                "Rate limit configuration reloaded in place"
            );
            *self.state.write() = Arc::new(ActiveLimiter {
                config,
                limiter: current.limiter.clone(),
            });
            return Ok(());
        }

        // The replacement is complete before any request can observe it.
        let limiter = build_limiter(&config)?;
        info!(
            from = %current.config.strategy,
            to = %config.strategy,
            "Rate limiter rebuilt on reload"
        );
        *self.state.write() = Arc::new(ActiveLimiter { config, limiter });
        current.limiter.stop().await;
        Ok(())
    }
}
