// Core data structures shared across the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade direction proposed by the advisory service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Buy => write!(f, "BUY"),
            SignalAction::Sell => write!(f, "SELL"),
            SignalAction::Hold => write!(f, "HOLD"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::High => write!(f, "HIGH"),
            Confidence::Medium => write!(f, "MEDIUM"),
            Confidence::Low => write!(f, "LOW"),
        }
    }
}

/// A fully validated trading decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub confidence: Confidence,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub is_fallback: bool,
}

impl Signal {
    /// Conservative substitute used whenever advisory output cannot be
    /// trusted: hold, low confidence, stops bracketing the current price.
    pub fn fallback(price: f64, reason: impl Into<String>) -> Self {
        Signal {
            action: SignalAction::Hold,
            confidence: Confidence::Low,
            stop_loss: price * 0.98,
            take_profit: price * 1.02,
            reason: reason.into(),
            timestamp: Utc::now(),
            is_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::High => write!(f, "high"),
            Urgency::Medium => write!(f, "medium"),
            Urgency::Low => write!(f, "low"),
        }
    }
}

/// Advisory verdict on an open position. Consumed within one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseDecision {
    pub should_close: bool,
    pub reason: String,
    pub urgency: Urgency,
    pub expected_outcome: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// An open position as reported by the exchange. The exchange is the
/// source of truth; we never hold more than one per symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub contracts: f64,
    pub entry_price: f64,
    pub notional: f64,
    pub leverage: f64,
    pub margin: f64,
    pub unrealized_pnl: f64,
    pub opened_at: Option<DateTime<Utc>>,
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Balance {
    pub free_usdt: f64,
    pub used_usdt: f64,
    pub total_usdt: f64,
}

/// Instrument metadata needed for sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketMeta {
    /// Base units represented by one contract.
    pub contract_size: f64,
    /// Minimum order size in base units.
    pub min_quantity: f64,
}

impl Default for MarketMeta {
    fn default() -> Self {
        Self {
            contract_size: 0.01,
            min_quantity: 0.01,
        }
    }
}

/// Best-effort market context from public stats endpoints.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SentimentData {
    pub long_short_ratio: Option<f64>,
    pub taker_buy_volume: Option<f64>,
    pub taker_sell_volume: Option<f64>,
}

impl SentimentData {
    pub fn is_empty(&self) -> bool {
        self.long_short_ratio.is_none()
            && self.taker_buy_volume.is_none()
            && self.taker_sell_volume.is_none()
    }
}

/// Indicator values derived from the candle window. `None` means the
/// window was too short for that indicator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub sma5: Option<f64>,
    pub sma20: Option<f64>,
    pub ema12: Option<f64>,
    pub ema26: Option<f64>,
    pub macd: Option<f64>,
    pub rsi14: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub volume_ratio: Option<f64>,
}

/// Everything a cycle knows about the market, assembled once and
/// read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub candles: Vec<Candle>,
    pub last_price: f64,
    pub indicators: IndicatorSet,
    pub sentiment: Option<SentimentData>,
    pub fetched_at: DateTime<Utc>,
}

/// One executed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: SignalAction,
    pub price: f64,
    pub quantity: f64,
    pub contracts: f64,
    pub margin_usdt: f64,
    pub notional_usdt: f64,
    pub leverage: f64,
    pub confidence: Confidence,
    pub reason: String,
    pub order_id: String,
}

/// Equity sample for the profit curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProfitPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub profit: f64,
    pub profit_rate: f64,
    pub unrealized_pnl: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_signal_is_deterministic() {
        let signal = Signal::fallback(50_000.0, "advisory unreachable");
        assert_eq!(signal.action, SignalAction::Hold);
        assert_eq!(signal.confidence, Confidence::Low);
        assert_eq!(signal.stop_loss, 49_000.0);
        assert_eq!(signal.take_profit, 51_000.0);
        assert!(signal.is_fallback);
    }

    #[test]
    fn test_signal_action_wire_format() {
        assert_eq!(
            serde_json::from_str::<SignalAction>("\"BUY\"").unwrap(),
            SignalAction::Buy
        );
        assert_eq!(
            serde_json::to_string(&SignalAction::Hold).unwrap(),
            "\"HOLD\""
        );
        assert_eq!(
            serde_json::from_str::<Confidence>("\"MEDIUM\"").unwrap(),
            Confidence::Medium
        );
    }

    #[test]
    fn test_position_side_opposite() {
        assert_eq!(PositionSide::Long.opposite(), PositionSide::Short);
        assert_eq!(PositionSide::Short.opposite(), PositionSide::Long);
    }

    #[test]
    fn test_position_construction() {
        let position = Position {
            symbol: "BTC-USDT-SWAP".to_string(),
            side: PositionSide::Long,
            contracts: 2.4,
            entry_price: 50_000.0,
            notional: 1200.0,
            leverage: 10.0,
            margin: 120.0,
            unrealized_pnl: 0.0,
            opened_at: Some(Utc::now()),
        };
        assert_eq!(position.side, PositionSide::Long);
        assert!(position.contracts > 0.0);
    }
}
