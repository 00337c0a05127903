//! Rate limiting strategies, key derivation and per-key state management.

mod config;
mod key;
mod limiter;
mod redis;
mod sliding_window;
mod stats;
mod sweeper;
mod token_bucket;

pub use self::config::{RateLimitConfig, RedisConfig, Strategy};
pub use key::{
    key_by_ip, key_by_ip_path, key_by_path, key_by_user, key_by_user_path, AuthenticatedUser,
    KeyFunc, KeyFuncKind, RateLimitContext, UNKNOWN_CLIENT,
};
pub use limiter::{build_limiter, Limiter};
pub use self::redis::RedisLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use stats::LimiterStats;
pub use token_bucket::TokenBucketLimiter;
