//! Limiting key derivation.
//!
//! A [`RateLimitContext`] captures the per-request facts a key can depend on.
//! Key functions are pure and total: every context produces a key.

use axum::extract::{ConnectInfo, Request};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Placeholder used when no client address can be resolved.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Authenticated principal attached to a request by an upstream interceptor.
///
/// The authentication middleware must run before rate limiting (lower
/// priority number) for user-based keys to see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Per-request facts used to derive a limiting key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitContext {
    pub client_ip: String,
    pub user_id: Option<String>,
    pub path: String,
    pub method: String,
}

impl RateLimitContext {
    /// Extract the limiting facts from an incoming request.
    ///
    /// The client address is the first `X-Forwarded-For` hop, then
    /// `X-Real-IP`, then the socket peer from [`ConnectInfo`].
    pub fn from_request(req: &Request) -> Self {
        Self {
            client_ip: client_ip(req),
            user_id: req
                .extensions()
                .get::<AuthenticatedUser>()
                .map(|user| user.0.clone()),
            path: req.uri().path().to_string(),
            method: req.method().as_str().to_string(),
        }
    }

    fn user(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.is_empty())
    }
}

fn client_ip(req: &Request) -> String {
    let headers = req.headers();
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// A key derivation function.
pub type KeyFunc = fn(&RateLimitContext) -> String;

/// Key by client address.
pub fn key_by_ip(ctx: &RateLimitContext) -> String {
    ctx.client_ip.clone()
}

/// Key by authenticated user, degrading to the client address.
pub fn key_by_user(ctx: &RateLimitContext) -> String {
    match ctx.user() {
        Some(user) => format!("user:{user}"),
        None => ctx.client_ip.clone(),
    }
}

/// Key by request path.
pub fn key_by_path(ctx: &RateLimitContext) -> String {
    ctx.path.clone()
}

/// Key by client address and path.
pub fn key_by_ip_path(ctx: &RateLimitContext) -> String {
    format!("{}:{}", ctx.client_ip, ctx.path)
}

/// Key by user and path, degrading to client address and path.
pub fn key_by_user_path(ctx: &RateLimitContext) -> String {
    match ctx.user() {
        Some(user) => format!("user:{}:{}", user, ctx.path),
        None => format!("{}:{}", ctx.client_ip, ctx.path),
    }
}

/// Configured choice of key function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum KeyFuncKind {
    Ip,
    User,
    Path,
    IpPath,
    UserPath,
}

impl KeyFuncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFuncKind::Ip => "ip",
            KeyFuncKind::User => "user",
            KeyFuncKind::Path => "path",
            KeyFuncKind::IpPath => "ip_path",
            KeyFuncKind::UserPath => "user_path",
        }
    }

    /// The key function this variant selects.
    pub fn key_func(&self) -> KeyFunc {
        match self {
            KeyFuncKind::Ip => key_by_ip,
            KeyFuncKind::User => key_by_user,
            KeyFuncKind::Path => key_by_path,
            KeyFuncKind::IpPath => key_by_ip_path,
            KeyFuncKind::UserPath => key_by_user_path,
        }
    }

    pub fn derive(&self, ctx: &RateLimitContext) -> String {
        (self.key_func())(ctx)
    }
}

impl fmt::Display for KeyFuncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyFuncKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(KeyFuncKind::Ip),
            "user" => Ok(KeyFuncKind::User),
            "path" => Ok(KeyFuncKind::Path),
            "ip_path" => Ok(KeyFuncKind::IpPath),
            "user_path" => Ok(KeyFuncKind::UserPath),
            other => Err(format!(
                "invalid key_func: {other} (expected ip, user, path, ip_path or user_path)"
            )),
        }
    }
}

impl TryFrom<String> for KeyFuncKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
