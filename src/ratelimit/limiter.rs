// Token buckets per quota class plus the adaptive cooldown wrapper
// every exchange-facing call flows through.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::BotError;
use crate::Result;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

// Exchange-imposed budgets. Public market data allows 600 requests per
// minute; private account/order endpoints allow 10 per 2 seconds.
const PUBLIC_BURST: u32 = 20;
const PUBLIC_REFILL_PER_SEC: u32 = 10;
const PRIVATE_BURST: u32 = 5;
const PRIVATE_REFILL_PER_SEC: u32 = 5;

const MAX_ATTEMPTS: u32 = 3;
const BASE_COOLDOWN_SECS: u64 = 1;
const BACKOFF_FACTOR: u32 = 2;
const MAX_COOLDOWN_SECS: u64 = 60;
const HARD_LIMIT_COOLDOWN_SECS: u64 = 60;
const SOFT_LIMIT_COOLDOWN_SECS: u64 = 2;

/// API calls sharing one rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaClass {
    /// Market data, instruments, public stats.
    Public,
    /// Balance, positions, orders. Tighter budget.
    Private,
}

/// Quota class for an exchange REST path.
pub fn classify_endpoint(path: &str) -> QuotaClass {
    const PRIVATE_MARKERS: [&str; 5] = ["balance", "position", "order", "trade/", "account/"];
    let lower = path.to_ascii_lowercase();
    if PRIVATE_MARKERS.iter().any(|m| lower.contains(m)) {
        QuotaClass::Private
    } else {
        QuotaClass::Public
    }
}

/// Process-wide request counters.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub rate_limited_requests: u64,
    pub last_reset: DateTime<Utc>,
}

impl RateLimitStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }

    pub fn requests_per_minute(&self) -> f64 {
        let elapsed_secs = (Utc::now() - self.last_reset).num_seconds().max(1) as f64;
        self.total_requests as f64 / (elapsed_secs / 60.0)
    }
}

pub struct ApiRateLimiter {
    public: DirectLimiter,
    private: DirectLimiter,
    total: AtomicU64,
    successful: AtomicU64,
    rate_limited: AtomicU64,
    last_reset_ms: AtomicI64,
}

impl ApiRateLimiter {
    pub fn new() -> Self {
        let public_quota = Quota::per_second(NonZeroU32::new(PUBLIC_REFILL_PER_SEC).unwrap())
            .allow_burst(NonZeroU32::new(PUBLIC_BURST).unwrap());
        let private_quota = Quota::per_second(NonZeroU32::new(PRIVATE_REFILL_PER_SEC).unwrap())
            .allow_burst(NonZeroU32::new(PRIVATE_BURST).unwrap());

        Self {
            public: RateLimiter::direct(public_quota),
            private: RateLimiter::direct(private_quota),
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            last_reset_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Suspends the calling task until a token for the class is free.
    /// This is the limiter's only suspension point.
    pub async fn acquire(&self, class: QuotaClass) {
        match class {
            QuotaClass::Public => self.public.until_ready().await,
            QuotaClass::Private => self.private.until_ready().await,
        }
    }

    /// Cooldown suggested by the shape of a rate-limit error: a hard 429
    /// gets the full minute, the exchange's soft code gets two seconds,
    /// anything else backs off exponentially with a cap.
    pub fn cooldown_for(&self, err: &BotError, attempt: u32) -> Duration {
        let text = err.to_string().to_ascii_lowercase();
        if text.contains("429") || text.contains("too many requests") {
            Duration::from_secs(HARD_LIMIT_COOLDOWN_SECS)
        } else if text.contains("50001") || text.contains("rate limit exceeded") {
            Duration::from_secs(SOFT_LIMIT_COOLDOWN_SECS)
        } else {
            let secs = BASE_COOLDOWN_SECS
                .saturating_mul(u64::from(BACKOFF_FACTOR.saturating_pow(attempt)));
            Duration::from_secs(secs.min(MAX_COOLDOWN_SECS))
        }
    }

    /// Runs `op` under the class's token bucket. Rate-limit-shaped
    /// failures are retried up to the attempt ceiling with a cooldown in
    /// between; every other error surfaces immediately.
    pub async fn execute<T, F, Fut>(&self, class: QuotaClass, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.acquire(class).await;
            self.total.fetch_add(1, Ordering::Relaxed);

            match op().await {
                Ok(value) => {
                    self.successful.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) if err.is_rate_limited() => {
                    self.rate_limited.fetch_add(1, Ordering::Relaxed);
                    if attempt + 1 >= MAX_ATTEMPTS {
                        warn!(
                            "rate limit persisted after {} attempts: {}",
                            MAX_ATTEMPTS, err
                        );
                        return Err(err);
                    }
                    let cooldown = self.cooldown_for(&err, attempt);
                    warn!(
                        "rate limited ({}), cooling down {:?} before attempt {}/{}",
                        err,
                        cooldown,
                        attempt + 2,
                        MAX_ATTEMPTS
                    );
                    tokio::time::sleep(cooldown).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!("request failed without rate-limit shape: {}", err);
                    return Err(err);
                }
            }
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        let ms = self.last_reset_ms.load(Ordering::Relaxed);
        RateLimitStats {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.successful.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited.load(Ordering::Relaxed),
            last_reset: Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now),
        }
    }

    pub fn reset_stats(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
        self.last_reset_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

impl Default for ApiRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
