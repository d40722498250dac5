// Prompt assembly for the advisory calls. Plain text in, strict JSON
// demanded out.

use std::fmt::Write as _;

use chrono::Utc;

use crate::models::{MarketSnapshot, Position, Signal};

pub const OPEN_SYSTEM: &str = "You are a disciplined perpetual futures analyst. \
You respond with a single JSON object and nothing else.";

pub const CLOSE_SYSTEM: &str = "You are a disciplined risk manager reviewing an \
open perpetual futures position. You respond with a single JSON object and nothing else.";

const RECENT_CANDLES_SHOWN: usize = 10;

/// Builds the entry-decision prompt from the snapshot, the open position
/// (if any) and the most recent prior signal.
pub fn open_prompt(
    snapshot: &MarketSnapshot,
    position: Option<&Position>,
    last_signal: Option<&Signal>,
) -> String {
    let mut p = String::with_capacity(2048);

    let _ = writeln!(p, "Instrument: {} perpetual swap", snapshot.symbol);
    let _ = writeln!(p, "Current price: {:.2} USDT", snapshot.last_price);
    let _ = writeln!(p, "Time (UTC): {}", Utc::now().format("%Y-%m-%d %H:%M"));
    p.push('\n');

    p.push_str("Recent candles (time, open, high, low, close, volume):\n");
    let shown = snapshot
        .candles
        .iter()
        .rev()
        .take(RECENT_CANDLES_SHOWN)
        .collect::<Vec<_>>();
    for candle in shown.iter().rev() {
        let _ = writeln!(
            p,
            "{} O:{:.2} H:{:.2} L:{:.2} C:{:.2} V:{:.1}",
            candle.timestamp.format("%m-%d %H:%M"),
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume
        );
    }
    p.push('\n');

    p.push_str("Technical indicators:\n");
    let ind = &snapshot.indicators;
    push_indicator(&mut p, "SMA5", ind.sma5);
    push_indicator(&mut p, "SMA20", ind.sma20);
    push_indicator(&mut p, "EMA12", ind.ema12);
    push_indicator(&mut p, "EMA26", ind.ema26);
    push_indicator(&mut p, "MACD", ind.macd);
    push_indicator(&mut p, "RSI14", ind.rsi14);
    push_indicator(&mut p, "Bollinger upper", ind.bb_upper);
    push_indicator(&mut p, "Bollinger middle", ind.bb_middle);
    push_indicator(&mut p, "Bollinger lower", ind.bb_lower);
    push_indicator(&mut p, "Volume ratio", ind.volume_ratio);
    p.push('\n');

    if let Some(sentiment) = &snapshot.sentiment {
        p.push_str("Market sentiment:\n");
        if let Some(ratio) = sentiment.long_short_ratio {
            let _ = writeln!(p, "Long/short account ratio: {ratio:.3}");
        }
        if let (Some(buy), Some(sell)) = (sentiment.taker_buy_volume, sentiment.taker_sell_volume)
        {
            let _ = writeln!(p, "Taker volume buy/sell: {buy:.1}/{sell:.1}");
        }
        p.push('\n');
    }

    match position {
        Some(pos) => {
            let _ = writeln!(
                p,
                "Open position: {} {:.4} contracts, entry {:.2}, unrealized PnL {:.2} USDT",
                pos.side, pos.contracts, pos.entry_price, pos.unrealized_pnl
            );
        }
        None => p.push_str("Open position: none\n"),
    }

    if let Some(prev) = last_signal {
        let _ = writeln!(
            p,
            "Previous signal: {} ({}) at {}",
            prev.action,
            prev.confidence,
            prev.timestamp.format("%H:%M")
        );
    }
    p.push('\n');

    p.push_str(
        "Decide the next action. Reply with exactly this JSON shape and no other text:\n\
         {\"signal\": \"BUY\"|\"SELL\"|\"HOLD\", \"reason\": \"<one sentence>\", \
         \"stop_loss\": <price>, \"take_profit\": <price>, \
         \"confidence\": \"HIGH\"|\"MEDIUM\"|\"LOW\"}\n",
    );
    p
}

/// Builds the close-review prompt for an open position.
pub fn close_prompt(position: &Position, snapshot: &MarketSnapshot) -> String {
    let mut p = String::with_capacity(1024);

    let pnl_pct = if position.margin > 0.0 {
        position.unrealized_pnl / position.margin * 100.0
    } else {
        0.0
    };

    let _ = writeln!(p, "Instrument: {} perpetual swap", position.symbol);
    let _ = writeln!(
        p,
        "Position: {} {:.4} contracts, entry {:.2}, leverage {:.0}x",
        position.side, position.contracts, position.entry_price, position.leverage
    );
    let _ = writeln!(
        p,
        "Unrealized PnL: {:.2} USDT ({:.1}% on margin)",
        position.unrealized_pnl, pnl_pct
    );
    if let Some(opened) = position.opened_at {
        let held = Utc::now() - opened;
        let _ = writeln!(p, "Held for: {} minutes", held.num_minutes());
    }
    let _ = writeln!(p, "Current price: {:.2} USDT", snapshot.last_price);

    let ind = &snapshot.indicators;
    push_indicator(&mut p, "RSI14", ind.rsi14);
    push_indicator(&mut p, "MACD", ind.macd);
    push_indicator(&mut p, "SMA20", ind.sma20);
    p.push('\n');

    p.push_str(
        "Should this position be closed now? Reply with exactly this JSON shape and no other text:\n\
         {\"should_close\": true|false, \"reason\": \"<one sentence>\", \
         \"urgency\": \"high\"|\"medium\"|\"low\", \"expected_outcome\": \"<one sentence>\"}\n",
    );
    p
}

fn push_indicator(p: &mut String, name: &str, value: Option<f64>) {
    match value {
        Some(v) => {
            let _ = writeln!(p, "{name}: {v:.2}");
        }
        None => {
            let _ = writeln!(p, "{name}: n/a");
        }
    }
}
