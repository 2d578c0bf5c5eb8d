//! Per-key token-bucket rate limiting
//!
//! One [`BucketRateLimiter`] per rate-limited resource class (HTTP, WS,
//! MOTD, skins-by-user, skins-by-IP, connect). Each limiter owns its own
//! background sweeper that reclaims full buckets to bound memory under
//! high key churn.

pub mod bucket;

pub use bucket::{BucketRateLimiter, RateLimitResult};
