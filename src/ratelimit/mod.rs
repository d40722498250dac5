// Outbound API throttling and bounded retry
pub mod limiter;
pub mod retry;

pub use limiter::{classify_endpoint, ApiRateLimiter, QuotaClass, RateLimitStats};
pub use retry::retry_with_backoff;
