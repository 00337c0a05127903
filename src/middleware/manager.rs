//! Builds the ordered handler chain and installs it on a router.
//!
//! An installed chain keeps one axum layer per member. Each layer runs the
//! handler at its position in the chain's current order, so priority
//! overrides and unregistrations take effect on routers that are already
//! serving.

use axum::extract::Request;
use axum::middleware::{from_fn, Next};
use axum::response::Response;
use axum::Router;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::registry::{MiddlewareInfo, Registry, ValidationReport};
use super::{Handler, Middleware};
use crate::error::{Result, TurnstileError};

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// The middlewares applied to one router and the order currently in force.
struct InstalledChain {
    id: u64,
    /// Members in installation order, each with the handler built for it
    members: Vec<(String, Handler)>,
    ordered: RwLock<Arc<Vec<Handler>>>,
}

/// The order a request started with, pinned for the rest of its chain.
#[derive(Clone)]
struct ChainSnapshot {
    chain_id: u64,
    handlers: Arc<Vec<Handler>>,
}

impl InstalledChain {
    fn new(members: Vec<(String, Handler)>) -> Self {
        let ordered = members.iter().map(|(_, handler)| handler.clone()).collect();
        Self {
            id: NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed),
            members,
            ordered: RwLock::new(Arc::new(ordered)),
        }
    }

    fn slots(&self) -> usize {
        self.members.len()
    }

    /// Re-sort the members by their position in `order`.
    ///
    /// Members missing from `order` have been unregistered and are dropped.
    fn reorder(&self, order: &[String]) {
        let mut ranked: Vec<(usize, &Handler)> = self
            .members
            .iter()
            .filter_map(|(name, handler)| {
                order
                    .iter()
                    .position(|n| n == name)
                    .map(|rank| (rank, handler))
            })
            .collect();
        ranked.sort_by_key(|(rank, _)| *rank);
        let handlers = ranked.into_iter().map(|(_, handler)| handler.clone()).collect();
        *self.ordered.write() = Arc::new(handlers);
    }

    fn dispatch(&self, slot: usize, mut req: Request, next: Next) -> BoxFuture<'static, Response> {
        let pinned = req
            .extensions()
            .get::<ChainSnapshot>()
            .filter(|snapshot| slot > 0 && snapshot.chain_id == self.id)
            .map(|snapshot| snapshot.handlers.clone());
        let handlers = match pinned {
            Some(handlers) => handlers,
            None => {
                let handlers = self.ordered.read().clone();
                req.extensions_mut().insert(ChainSnapshot {
                    chain_id: self.id,
                    handlers: handlers.clone(),
                });
                handlers
            }
        };
        match handlers.get(slot) {
            Some(handler) => handler(req, next),
            // The chain shrank after an unregistration.
            None => next.run(req).boxed(),
        }
    }
}

/// Owns the [`Registry`] and turns it into axum layers.
#[derive(Default)]
pub struct Manager {
    registry: Registry,
    installed: Mutex<Vec<Weak<InstalledChain>>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn register(&self, middleware: Arc<dyn Middleware>) -> Result<()> {
        self.registry.register(middleware)
    }

    /// Remove a middleware from the registry and from every installed chain.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Middleware>> {
        let removed = self.registry.unregister(name)?;
        self.refresh();
        Ok(removed)
    }

    /// Override the priority of `name`, reordering installed chains.
    pub fn set_priority_override(&self, name: &str, priority: i32) {
        self.registry.set_priority_override(name, priority);
        self.refresh();
    }

    /// Drop the override of `name` so its declared priority applies again.
    pub fn clear_priority_override(&self, name: &str) -> Option<i32> {
        let cleared = self.registry.clear_priority_override(name);
        if cleared.is_some() {
            info!(name = %name, "Cleared middleware priority override");
            self.refresh();
        }
        cleared
    }

    pub fn list(&self) -> Vec<MiddlewareInfo> {
        self.registry.list()
    }

    pub fn validate(&self) -> Result<ValidationReport> {
        self.registry.validate()
    }

    /// Handlers of every registered middleware in execution order.
    pub fn build(&self) -> Vec<Handler> {
        self.registry
            .sorted()
            .iter()
            .map(|middleware| middleware.handler())
            .collect()
    }

    /// Install the full chain on `router`.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let chain = self.registry.sorted();
        info!(
            chain = ?chain.iter().map(|m| m.name()).collect::<Vec<_>>(),
            "Applying middleware chain"
        );
        self.install(router, &chain)
    }

    /// Install only the named middlewares, in the same relative order as the full chain.
    pub fn apply_to_router<S>(&self, router: Router<S>, names: &[&str]) -> Result<Router<S>>
    where
        S: Clone + Send + Sync + 'static,
    {
        for name in names {
            if !self.registry.contains(name) {
                return Err(TurnstileError::Registry(format!(
                    "middleware {name} not found"
                )));
            }
        }

        let wanted: HashSet<&str> = names.iter().copied().collect();
        let subset: Vec<Arc<dyn Middleware>> = self
            .registry
            .sorted()
            .into_iter()
            .filter(|middleware| wanted.contains(middleware.name()))
            .collect();
        debug!(
            chain = ?subset.iter().map(|m| m.name()).collect::<Vec<_>>(),
            "Applying middleware subset"
        );
        Ok(self.install(router, &subset))
    }

    /// Hot-reload the named middleware with a configuration fragment.
    pub async fn reload(&self, name: &str, fragment: &serde_json::Value) -> Result<()> {
        let middleware = self
            .registry
            .get(name)
            .ok_or_else(|| TurnstileError::Registry(format!("middleware {name} not found")))?;
        let reloadable = middleware.as_reloadable().ok_or_else(|| {
            TurnstileError::Registry(format!("middleware {name} does not support reload"))
        })?;
        reloadable.reload(fragment).await?;
        info!(name = %name, "Reloaded middleware");
        Ok(())
    }

    /// Wrap `router` so that `chain[0]` runs outermost.
    fn install<S>(&self, router: Router<S>, chain: &[Arc<dyn Middleware>]) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let members = chain
            .iter()
            .map(|middleware| (middleware.name().to_string(), middleware.handler()))
            .collect();
        let installed = Arc::new(InstalledChain::new(members));
        self.installed.lock().push(Arc::downgrade(&installed));

        // Router::layer wraps everything added before, so the last layer runs first.
        (0..installed.slots()).rev().fold(router, |router, slot| {
            let installed = installed.clone();
            router.layer(from_fn(move |req: Request, next: Next| {
                installed.dispatch(slot, req, next)
            }))
        })
    }

    /// Bring every live installed chain in line with the registry order.
    fn refresh(&self) {
        let order: Vec<String> = self.registry.list().into_iter().map(|info| info.name).collect();
        let mut installed = self.installed.lock();
        installed.retain(|chain| match chain.upgrade() {
            Some(chain) => {
                chain.reorder(&order);
                true
            }
            None => false,
        });
        debug!(chains = installed.len(), "Reordered installed middleware chains");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::registry::tests::TestMiddleware;
    use crate::middleware::RateLimitMiddleware;
    use crate::ratelimit::RateLimitConfig;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use serde_json::json;
    use tower::ServiceExt;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: String,
        priority: i32,
        trace: Trace,
        short_circuit: bool,
    }

    impl Middleware for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn handler(&self) -> Handler {
            let name = self.name.clone();
            let trace = self.trace.clone();
            let short_circuit = self.short_circuit;
            Arc::new(move |req: Request, next: Next| {
                let name = name.clone();
                let trace = trace.clone();
                async move {
                    trace.lock().push(name);
                    if short_circuit {
                        return StatusCode::FORBIDDEN.into_response();
                    }
                    next.run(req).await
                }
                .boxed()
            })
        }
    }

    fn recording(name: &str, priority: i32, trace: &Trace) -> Arc<dyn Middleware> {
        Arc::new(Recording {
            name: name.to_string(),
            priority,
            trace: trace.clone(),
            short_circuit: false,
        })
    }

    fn app() -> Router {
        Router::new().route("/", get(|| async { "ok" }))
    }

    async fn call(router: Router) -> Response {
        router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_runs_in_priority_order() {
        let trace = Trace::default();
        let manager = Manager::new();
        manager.register(recording("rate_limit", 8, &trace)).unwrap();
        manager.register(recording("request_id", 1, &trace)).unwrap();
        manager.register(recording("logger", 6, &trace)).unwrap();

        let response = call(manager.apply(app())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*trace.lock(), vec!["request_id", "logger", "rate_limit"]);
        assert_eq!(manager.build().len(), 3);
    }

    #[tokio::test]
    async fn test_override_changes_execution_order() {
        let trace = Trace::default();
        let manager = Manager::new();
        manager.register(recording("auth", 9, &trace)).unwrap();
        manager.register(recording("rate_limit", 8, &trace)).unwrap();
        manager.set_priority_override("auth", 7);

        call(manager.apply(app())).await;
        assert_eq!(*trace.lock(), vec!["auth", "rate_limit"]);
    }

    #[tokio::test]
    async fn test_override_after_apply_reorders_live_chain() {
        let trace = Trace::default();
        let manager = Manager::new();
        manager.register(recording("auth", 9, &trace)).unwrap();
        manager.register(recording("rate_limit", 8, &trace)).unwrap();
        let router = manager.apply(app());

        call(router.clone()).await;
        assert_eq!(*trace.lock(), vec!["rate_limit", "auth"]);
        trace.lock().clear();

        manager.set_priority_override("auth", 7);
        call(router.clone()).await;
        let listed: Vec<String> = manager.list().into_iter().map(|info| info.name).collect();
        assert_eq!(listed, vec!["auth", "rate_limit"]);
        assert_eq!(*trace.lock(), listed);
        trace.lock().clear();

        assert_eq!(manager.clear_priority_override("auth"), Some(7));
        call(router).await;
        assert_eq!(*trace.lock(), vec!["rate_limit", "auth"]);
    }

    #[tokio::test]
    async fn test_unregister_after_apply_removes_from_live_chain() {
        let trace = Trace::default();
        let manager = Manager::new();
        manager.register(recording("request_id", 1, &trace)).unwrap();
        manager.register(recording("logger", 6, &trace)).unwrap();
        manager.register(recording("rate_limit", 8, &trace)).unwrap();
        let router = manager.apply(app());

        manager.unregister("logger").unwrap();
        let response = call(router).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*trace.lock(), vec!["request_id", "rate_limit"]);
    }

    #[tokio::test]
    async fn test_override_reorders_applied_subset() {
        let trace = Trace::default();
        let manager = Manager::new();
        manager.register(recording("compression", 12, &trace)).unwrap();
        manager.register(recording("security", 3, &trace)).unwrap();
        manager.register(recording("logger", 6, &trace)).unwrap();
        let router = manager
            .apply_to_router(app(), &["compression", "security"])
            .unwrap();

        manager.set_priority_override("compression", 2);
        call(router).await;
        assert_eq!(*trace.lock(), vec!["compression", "security"]);
    }

    #[tokio::test]
    async fn test_apply_to_router_resorts_subset() {
        let trace = Trace::default();
        let manager = Manager::new();
        manager.register(recording("compression", 12, &trace)).unwrap();
        manager.register(recording("security", 3, &trace)).unwrap();
        manager.register(recording("logger", 6, &trace)).unwrap();

        let router = manager
            .apply_to_router(app(), &["compression", "security"])
            .unwrap();
        call(router).await;
        assert_eq!(*trace.lock(), vec!["security", "compression"]);

        let err = manager.apply_to_router(app(), &["missing"]).unwrap_err();
        assert!(err.to_string().contains("middleware missing not found"));
    }

    #[tokio::test]
    async fn test_short_circuit_stops_chain() {
        let trace = Trace::default();
        let manager = Manager::new();
        manager.register(recording("first", 1, &trace)).unwrap();
        manager
            .register(Arc::new(Recording {
                name: "gate".to_string(),
                priority: 2,
                trace: trace.clone(),
                short_circuit: true,
            }))
            .unwrap();
        manager.register(recording("last", 3, &trace)).unwrap();

        let response = call(manager.apply(app())).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(*trace.lock(), vec!["first", "gate"]);
    }

    #[tokio::test]
    async fn test_reload_dispatch() {
        let manager = Manager::new();
        manager.register(TestMiddleware::arc("static", 5)).unwrap();
        let rate_limit = Arc::new(RateLimitMiddleware::new(RateLimitConfig::default()).unwrap());
        manager.register(rate_limit.clone()).unwrap();

        manager
            .reload("rate_limit", &json!({"rate": 20, "burst": 40}))
            .await
            .unwrap();
        assert_eq!(rate_limit.config().rate, 20);

        let err = manager.reload("static", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("does not support reload"));
        assert!(manager.reload("missing", &json!({})).await.is_err());
        rate_limit.stop().await;
    }
}
