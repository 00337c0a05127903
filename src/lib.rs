//! Turnstile - Request Admission Core
//!
//! This crate implements pluggable rate limiting strategies (token bucket,
//! in-process sliding window, Redis-backed sliding window) and a
//! priority-ordered, hot-reloadable middleware chain for axum services.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
