//! Middleware registry with priority overrides.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Middleware;
use crate::error::{Result, TurnstileError};

/// Lowest valid priority (runs first).
pub const MIN_PRIORITY: i32 = 1;
/// Highest valid priority (runs last).
pub const MAX_PRIORITY: i32 = 100;

/// Listing entry describing one registered middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MiddlewareInfo {
    pub name: String,
    /// Effective priority used for ordering
    pub priority: i32,
    /// Priority the middleware declares for itself
    pub declared_priority: i32,
    pub overridden: bool,
}

/// Non-fatal findings of [`Registry::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Priorities shared by more than one middleware, with the names in chain order.
    pub duplicate_priorities: Vec<(i32, Vec<String>)>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_priorities.is_empty()
    }
}

struct Entry {
    middleware: Arc<dyn Middleware>,
    sequence: u64,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, Entry>,
    overrides: HashMap<String, i32>,
    next_sequence: u64,
}

impl RegistryInner {
    fn effective(&self, name: &str, entry: &Entry) -> i32 {
        self.overrides
            .get(name)
            .copied()
            .unwrap_or_else(|| entry.middleware.priority())
    }

    /// Entries in chain order: effective priority, then registration sequence.
    fn ordered(&self) -> Vec<(&String, &Entry, i32)> {
        let mut ordered: Vec<_> = self
            .entries
            .iter()
            .map(|(name, entry)| (name, entry, self.effective(name, entry)))
            .collect();
        ordered.sort_by_key(|(_, entry, priority)| (*priority, entry.sequence));
        ordered
    }
}

/// Stores middleware instances and resolves their effective priority.
///
/// The registry is thread-safe and can be shared across tasks. Entries with
/// the same effective priority keep their registration order.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware under its own name.
    pub fn register(&self, middleware: Arc<dyn Middleware>) -> Result<()> {
        let name = middleware.name().to_string();
        if name.is_empty() {
            return Err(TurnstileError::Registry(
                "middleware name must not be empty".to_string(),
            ));
        }

        let mut inner = self.inner.write();
        if inner.entries.contains_key(&name) {
            return Err(TurnstileError::Registry(format!(
                "middleware {name} already registered"
            )));
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        debug!(name = %name, priority = middleware.priority(), "Registered middleware");
        inner.entries.insert(name, Entry { middleware, sequence });
        Ok(())
    }

    /// Remove a middleware. Its priority override, if any, is kept.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Middleware>> {
        let removed = self.inner.write().entries.remove(name);
        match removed {
            Some(entry) => {
                debug!(name = %name, "Unregistered middleware");
                Ok(entry.middleware)
            }
            None => Err(TurnstileError::Registry(format!(
                "middleware {name} not found"
            ))),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.inner
            .read()
            .entries
            .get(name)
            .map(|entry| entry.middleware.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Override the priority of `name` without touching the middleware.
    ///
    /// The name need not be registered yet; the override applies once it is.
    pub fn set_priority_override(&self, name: &str, priority: i32) {
        self.inner
            .write()
            .overrides
            .insert(name.to_string(), priority);
        info!(name = %name, priority, "Set middleware priority override");
    }

    /// Snapshot of the override table.
    pub fn overrides(&self) -> HashMap<String, i32> {
        self.inner.read().overrides.clone()
    }

    pub fn clear_priority_override(&self, name: &str) -> Option<i32> {
        self.inner.write().overrides.remove(name)
    }

    /// Override if present, else the declared priority. `None` when unregistered.
    pub fn effective_priority(&self, name: &str) -> Option<i32> {
        let inner = self.inner.read();
        inner
            .entries
            .get(name)
            .map(|entry| inner.effective(name, entry))
    }

    /// All middlewares in chain order.
    pub fn sorted(&self) -> Vec<Arc<dyn Middleware>> {
        self.inner
            .read()
            .ordered()
            .into_iter()
            .map(|(_, entry, _)| entry.middleware.clone())
            .collect()
    }

    /// Describe all middlewares in chain order.
    pub fn list(&self) -> Vec<MiddlewareInfo> {
        let inner = self.inner.read();
        inner
            .ordered()
            .into_iter()
            .map(|(name, entry, priority)| {
                let declared = entry.middleware.priority();
                MiddlewareInfo {
                    name: name.clone(),
                    priority,
                    declared_priority: declared,
                    overridden: inner.overrides.contains_key(name.as_str()),
                }
            })
            .collect()
    }

    /// Check the chain is usable.
    ///
    /// Fails when empty or when an effective priority is out of range.
    /// Shared priorities are only reported.
    pub fn validate(&self) -> Result<ValidationReport> {
        let infos = self.list();
        if infos.is_empty() {
            return Err(TurnstileError::Registry(
                "no middleware registered".to_string(),
            ));
        }

        let mut by_priority: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for info in &infos {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&info.priority) {
                return Err(TurnstileError::Registry(format!(
                    "middleware {} has invalid priority {} (must be {}-{})",
                    info.name, info.priority, MIN_PRIORITY, MAX_PRIORITY
                )));
            }
            by_priority
                .entry(info.priority)
                .or_default()
                .push(info.name.clone());
        }

        let duplicate_priorities: Vec<(i32, Vec<String>)> = by_priority
            .into_iter()
            .filter(|(_, names)| names.len() > 1)
            .collect();
        for (priority, names) in &duplicate_priorities {
            warn!(
                priority,
                middlewares = ?names,
                "Middlewares share a priority, ordered by registration"
            );
        }

        Ok(ValidationReport {
            duplicate_priorities,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::middleware::Handler;
    use axum::extract::Request;
    use axum::middleware::Next;
    use futures::FutureExt;

    pub(crate) struct TestMiddleware {
        pub name: String,
        pub priority: i32,
    }

    impl TestMiddleware {
        pub fn arc(name: &str, priority: i32) -> Arc<dyn Middleware> {
            Arc::new(Self {
                name: name.to_string(),
                priority,
            })
        }
    }

    impl Middleware for TestMiddleware {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn handler(&self) -> Handler {
            Arc::new(|req: Request, next: Next| next.run(req).boxed())
        }
    }

    fn names(registry: &Registry) -> Vec<String> {
        registry.list().into_iter().map(|info| info.name).collect()
    }

    #[test]
    fn test_register_and_duplicate() {
        let registry = Registry::new();
        registry.register(TestMiddleware::arc("logger", 6)).unwrap();
        let err = registry
            .register(TestMiddleware::arc("logger", 7))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.effective_priority("logger"), Some(6));
    }

    #[test]
    fn test_unregister_missing_fails() {
        let registry = Registry::new();
        assert!(registry.unregister("missing").is_err());

        registry.register(TestMiddleware::arc("cors", 4)).unwrap();
        let removed = registry.unregister("cors").unwrap();
        assert_eq!(removed.name(), "cors");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_is_ascending() {
        let registry = Registry::new();
        registry.register(TestMiddleware::arc("rate_limit", 8)).unwrap();
        registry.register(TestMiddleware::arc("request_id", 1)).unwrap();
        registry.register(TestMiddleware::arc("compression", 12)).unwrap();
        registry.register(TestMiddleware::arc("logger", 6)).unwrap();

        assert_eq!(
            names(&registry),
            vec!["request_id", "logger", "rate_limit", "compression"]
        );
        let priorities: Vec<i32> = registry.list().iter().map(|i| i.priority).collect();
        assert!(priorities.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_priority_override_reorders() {
        let registry = Registry::new();
        registry.register(TestMiddleware::arc("auth", 9)).unwrap();
        registry.register(TestMiddleware::arc("rate_limit", 8)).unwrap();
        assert_eq!(names(&registry), vec!["rate_limit", "auth"]);

        registry.set_priority_override("auth", 7);
        assert_eq!(names(&registry), vec!["auth", "rate_limit"]);

        let auth = &registry.list()[0];
        assert_eq!(auth.priority, 7);
        assert_eq!(auth.declared_priority, 9);
        assert!(auth.overridden);
        // The middleware itself is untouched.
        assert_eq!(registry.get("auth").unwrap().priority(), 9);

        assert_eq!(registry.overrides(), HashMap::from([("auth".to_string(), 7)]));
        assert_eq!(registry.clear_priority_override("auth"), Some(7));
        assert!(registry.overrides().is_empty());
        assert_eq!(names(&registry), vec!["rate_limit", "auth"]);
    }

    #[test]
    fn test_override_before_registration() {
        let registry = Registry::new();
        registry.set_priority_override("late", 2);
        registry.register(TestMiddleware::arc("early", 5)).unwrap();
        registry.register(TestMiddleware::arc("late", 50)).unwrap();
        assert_eq!(names(&registry), vec!["late", "early"]);
    }

    #[test]
    fn test_equal_priorities_follow_registration_order() {
        let registry = Registry::new();
        for name in ["c", "a", "d", "b"] {
            registry.register(TestMiddleware::arc(name, 5)).unwrap();
        }
        for _ in 0..10 {
            assert_eq!(names(&registry), vec!["c", "a", "d", "b"]);
        }

        // Re-registration moves an entry to the back of its priority group.
        let a = registry.unregister("a").unwrap();
        registry.register(a).unwrap();
        assert_eq!(names(&registry), vec!["c", "d", "b", "a"]);
    }

    #[test]
    fn test_validate() {
        let registry = Registry::new();
        assert!(registry.validate().is_err());

        registry.register(TestMiddleware::arc("a", 1)).unwrap();
        registry.register(TestMiddleware::arc("b", 5)).unwrap();
        registry.register(TestMiddleware::arc("c", 5)).unwrap();
        let report = registry.validate().unwrap();
        assert!(!report.is_clean());
        assert_eq!(
            report.duplicate_priorities,
            vec![(5, vec!["b".to_string(), "c".to_string()])]
        );

        registry.set_priority_override("a", 0);
        assert!(registry.validate().is_err());
        registry.set_priority_override("a", 101);
        assert!(registry.validate().is_err());
        registry.set_priority_override("a", 100);
        assert!(registry.validate().is_ok());
    }
}
