//! Peer middlewares that share the chain with rate limiting.

use axum::extract::Request;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::{Handler, Middleware};
use crate::error::{Result, TurnstileError};

/// Request id propagation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestIdConfig {
    pub header_name: String,
    /// Always generate a fresh id, ignoring any incoming header
    pub force_gen: bool,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        Self {
            header_name: "X-Request-ID".to_string(),
            force_gen: false,
        }
    }
}

/// Request id attached to the request extensions for downstream handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Propagates or generates a per-request id header.
pub struct RequestIdMiddleware {
    header: HeaderName,
    force_gen: bool,
}

impl RequestIdMiddleware {
    pub fn new(config: &RequestIdConfig) -> Result<Self> {
        let header = HeaderName::from_bytes(config.header_name.as_bytes())
            .map_err(|e| TurnstileError::config("request_id.header_name", e.to_string()))?;
        Ok(Self {
            header,
            force_gen: config.force_gen,
        })
    }
}

impl Middleware for RequestIdMiddleware {
    fn name(&self) -> &str {
        "request_id"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn handler(&self) -> Handler {
        let header = self.header.clone();
        let force_gen = self.force_gen;
        Arc::new(move |mut req: Request, next: Next| {
            let incoming = req
                .headers()
                .get(&header)
                .filter(|_| !force_gen)
                .filter(|v| !v.is_empty())
                .cloned();
            let value = match incoming {
                Some(value) => value,
                None => match HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
                    Ok(value) => value,
                    Err(_) => return next.run(req).boxed(),
                },
            };
            if let Ok(id) = value.to_str() {
                req.extensions_mut().insert(RequestId(id.to_string()));
            }
            req.headers_mut().insert(header.clone(), value.clone());

            let header = header.clone();
            async move {
                let mut response = next.run(req).await;
                response.headers_mut().insert(header, value);
                response
            }
            .boxed()
        })
    }
}

/// Panic recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Message returned to the client after a panic
    pub message: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            message: "Internal server error".to_string(),
        }
    }
}

/// Converts a panicking downstream into a 500 response.
pub struct RecoveryMiddleware {
    message: Arc<str>,
}

impl RecoveryMiddleware {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            message: Arc::from(config.message.as_str()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &str {
        "recovery"
    }

    fn priority(&self) -> i32 {
        2
    }

    fn handler(&self) -> Handler {
        let message = self.message.clone();
        Arc::new(move |req: Request, next: Next| {
            let message = message.clone();
            let path = req.uri().path().to_string();
            async move {
                match AssertUnwindSafe(next.run(req)).catch_unwind().await {
                    Ok(response) => response,
                    Err(payload) => {
                        error!(path = %path, panic = %panic_message(payload.as_ref()), "Recovered from handler panic");
                        let body = json!({
                            "code": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                            "message": &*message,
                        });
                        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
                    }
                }
            }
            .boxed()
        })
    }
}

/// Security response header settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub x_frame_options: String,
    pub x_content_type_options: String,
    pub enable_hsts: bool,
    pub hsts_max_age: u64,
    pub content_security_policy: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            x_frame_options: "DENY".to_string(),
            x_content_type_options: "nosniff".to_string(),
            enable_hsts: false,
            hsts_max_age: 31_536_000,
            content_security_policy: None,
        }
    }
}

/// Adds security headers to every response.
pub struct SecurityMiddleware {
    headers: Arc<Vec<(HeaderName, HeaderValue)>>,
}

impl SecurityMiddleware {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        fn value(field: &str, raw: &str) -> Result<HeaderValue> {
            HeaderValue::from_str(raw)
                .map_err(|e| TurnstileError::config(format!("security.{field}"), e.to_string()))
        }

        let mut headers = vec![
            (
                HeaderName::from_static("x-frame-options"),
                value("x_frame_options", &config.x_frame_options)?,
            ),
            (
                HeaderName::from_static("x-content-type-options"),
                value("x_content_type_options", &config.x_content_type_options)?,
            ),
        ];
        if config.enable_hsts {
            headers.push((
                HeaderName::from_static("strict-transport-security"),
                value(
                    "hsts_max_age",
                    &format!("max-age={}; includeSubDomains", config.hsts_max_age),
                )?,
            ));
        }
        if let Some(csp) = config.content_security_policy.as_deref() {
            headers.push((
                HeaderName::from_static("content-security-policy"),
                value("content_security_policy", csp)?,
            ));
        }
        Ok(Self {
            headers: Arc::new(headers),
        })
    }
}

impl Middleware for SecurityMiddleware {
    fn name(&self) -> &str {
        "security"
    }

    fn priority(&self) -> i32 {
        3
    }

    fn handler(&self) -> Handler {
        let headers = self.headers.clone();
        Arc::new(move |req: Request, next: Next| {
            let headers = headers.clone();
            async move {
                let mut response = next.run(req).await;
                for (name, value) in headers.iter() {
                    response.headers_mut().insert(name.clone(), value.clone());
                }
                response
            }
            .boxed()
        })
    }
}

/// Access log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Paths never logged (exact match)
    pub skip_paths: Vec<String>,
    /// Requests slower than this are logged at WARN
    pub slow_request_threshold_ms: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            skip_paths: Vec::new(),
            slow_request_threshold_ms: 3000,
        }
    }
}

/// Access log through `tracing`.
pub struct LoggerMiddleware {
    skip_paths: Arc<Vec<String>>,
    slow_threshold: Duration,
}

impl LoggerMiddleware {
    pub fn new(config: &LoggerConfig) -> Self {
        Self {
            skip_paths: Arc::new(config.skip_paths.clone()),
            slow_threshold: Duration::from_millis(config.slow_request_threshold_ms),
        }
    }
}

impl Middleware for LoggerMiddleware {
    fn name(&self) -> &str {
        "logger"
    }

    fn priority(&self) -> i32 {
        6
    }

    fn handler(&self) -> Handler {
        let skip_paths = self.skip_paths.clone();
        let slow_threshold = self.slow_threshold;
        Arc::new(move |req: Request, next: Next| {
            let path = req.uri().path().to_string();
            if skip_paths.iter().any(|p| *p == path) {
                return next.run(req).boxed();
            }
            let method = req.method().clone();
            let request_id = req.extensions().get::<RequestId>().map(|id| id.0.clone());
            async move {
                let started = Instant::now();
                let response = next.run(req).await;
                let latency = started.elapsed();
                let status = response.status().as_u16();
                if latency > slow_threshold {
                    warn!(%method, path = %path, status, ?latency, request_id = ?request_id, "Slow request");
                } else {
                    info!(%method, path = %path, status, ?latency, request_id = ?request_id, "Request completed");
                }
                response
            }
            .boxed()
        })
    }
}
