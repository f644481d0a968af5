//! Failsafe mechanisms: sliding-window rate limiting and upstream retry

mod rate_limiter;
mod retry;

pub use rate_limiter::{RateLimitDecision, RateLimiter, spawn_sweeper};
pub use retry::{RetryPolicy, with_retry};
