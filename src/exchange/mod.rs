// Exchange connector boundary
pub mod okx;

#[cfg(test)]
pub mod mock;

pub use okx::OkxClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Balance, Candle, MarketMeta, Position, PositionSide, SentimentData};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Market order request. `contracts` is in exchange-native contract units.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub pos_side: PositionSide,
    pub contracts: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectiveKind {
    StopLoss,
    TakeProfit,
}

/// Conditional order protecting an open position. Always reduce-only,
/// always on the side opposite the entry.
#[derive(Debug, Clone)]
pub struct ProtectiveOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub pos_side: PositionSide,
    pub contracts: f64,
    pub kind: ProtectiveKind,
    pub trigger_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// The connector seam. Production talks to OKX; tests script their own.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Contract multiplier and minimum order size for the instrument.
    async fn load_market_meta(&self, symbol: &str) -> Result<MarketMeta>;

    /// Candles in chronological order, at most `limit` of them.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize)
        -> Result<Vec<Candle>>;

    async fn fetch_balance(&self) -> Result<Balance>;

    /// The open position for the symbol, if any. At most one.
    async fn fetch_position(&self, symbol: &str) -> Result<Option<Position>>;

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()>;

    async fn create_market_order(&self, req: &OrderRequest) -> Result<OrderAck>;

    async fn create_protective_order(&self, req: &ProtectiveOrder) -> Result<OrderAck>;

    /// Best-effort market context; partial results are fine.
    async fn fetch_sentiment(&self, symbol: &str) -> Result<SentimentData>;

    /// Drops and rebuilds the underlying session (circuit reset).
    async fn reset(&self) -> Result<()>;
}
