// Error taxonomy for the trading engine.
//
// Classification drives recovery: retryable errors go back through the
// rate limiter / retry combinator, everything else degrades or surfaces.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    /// Network trouble, timeouts, 5xx responses. Safe to retry.
    #[error("transient API error: {0}")]
    Transient(String),

    /// The exchange or advisory service told us to slow down.
    /// Carries the raw signature text so the limiter can pick a cooldown.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The exchange refused a request or order outright. Not retried.
    #[error("exchange rejected request: {0}")]
    ExchangeRejection(String),

    /// Opening would consume more margin than the affordability gate allows.
    #[error("insufficient margin: required {required:.2} USDT, free {available:.2} USDT")]
    InsufficientMargin { required: f64, available: f64 },

    /// Advisory output could not be decoded into a known schema.
    /// Degrades to the fallback signal, never retried at call level.
    #[error("malformed advisory response: {0}")]
    MalformedResponse(String),

    /// Market data or shared state is older than we are willing to act on.
    #[error("stale data: {0}")]
    StaleData(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    /// Whether another attempt can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BotError::Transient(_) | BotError::RateLimited(_))
    }

    /// Rate-limit-shaped errors get cooldown treatment instead of plain backoff.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, BotError::RateLimited(_))
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::Transient(err.to_string())
    }
}
