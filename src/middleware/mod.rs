//! Priority-ordered, hot-reloadable request interceptors.
//!
//! Every interceptor implements [`Middleware`]. The [`Registry`] resolves
//! effective priorities, the [`Manager`] turns them into an ordered chain
//! of axum layers, and the [`Initializer`] builds concrete instances from
//! configuration.

use async_trait::async_trait;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use futures::future::BoxFuture;
use std::sync::Arc;

mod builtin;
mod initializer;
mod manager;
mod rate_limit;
mod registry;

pub use builtin::{
    LoggerConfig, LoggerMiddleware, RecoveryConfig, RecoveryMiddleware, RequestId,
    RequestIdConfig, RequestIdMiddleware, SecurityConfig, SecurityMiddleware,
};
pub use initializer::Initializer;
pub use manager::Manager;
pub use rate_limit::{RateLimitMiddleware, REJECTION_CODE};
pub use registry::{MiddlewareInfo, Registry, ValidationReport, MAX_PRIORITY, MIN_PRIORITY};

use crate::error::Result;

/// A shareable async interceptor: inspect the request, then either answer
/// directly or hand it to `next`.
pub type Handler = Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;

/// Contract shared by every interceptor in the chain.
///
/// Lower priority numbers run first (outermost).
pub trait Middleware: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &str;

    /// Self-declared priority in `[MIN_PRIORITY, MAX_PRIORITY]`.
    fn priority(&self) -> i32;

    /// The interceptor function installed in the chain.
    fn handler(&self) -> Handler;

    /// Access to hot reload, for middlewares that support it.
    fn as_reloadable(&self) -> Option<&dyn Reloadable> {
        None
    }
}

/// Middlewares whose configuration can change while serving.
#[async_trait]
pub trait Reloadable: Send + Sync {
    /// Apply a partial configuration fragment.
    ///
    /// Either the whole fragment takes effect or nothing does.
    async fn reload(&self, fragment: &serde_json::Value) -> Result<()>;
}
