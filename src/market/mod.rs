// Market snapshot assembly: candles in, indicators + sentiment out.

pub mod indicators;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::config::TradeConfig;
use crate::error::BotError;
use crate::exchange::Exchange;
use crate::models::{Candle, IndicatorSet, MarketSnapshot};
use crate::Result;

/// Derives the full indicator set from a chronological candle window.
pub fn compute_indicators(candles: &[Candle]) -> IndicatorSet {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let bands = indicators::bollinger(&closes, 20, 2.0);
    IndicatorSet {
        sma5: indicators::sma(&closes, 5),
        sma20: indicators::sma(&closes, 20),
        ema12: indicators::ema(&closes, 12),
        ema26: indicators::ema(&closes, 26),
        macd: indicators::macd_line(&closes),
        rsi14: indicators::rsi(&closes, 14),
        bb_upper: bands.map(|(u, _, _)| u),
        bb_middle: bands.map(|(_, m, _)| m),
        bb_lower: bands.map(|(_, _, l)| l),
        volume_ratio: indicators::volume_ratio(&volumes, 20),
    }
}

/// Fetches candles and assembles one immutable snapshot for the cycle.
/// Sentiment is best-effort: a failed stats call degrades to None, it
/// never fails the snapshot.
pub async fn build_snapshot(
    exchange: &dyn Exchange,
    config: &TradeConfig,
) -> Result<MarketSnapshot> {
    let candles = exchange
        .fetch_ohlcv(&config.symbol, &config.timeframe, config.data_points)
        .await?;

    let last = candles
        .last()
        .ok_or_else(|| BotError::Transient("exchange returned an empty candle window".into()))?;

    // A newest candle older than two full periods means the feed is not
    // keeping up; trading on it would act on dead data.
    let max_age = Duration::minutes(config.timeframe_minutes() * 2);
    let age = Utc::now() - last.timestamp;
    if age > max_age {
        return Err(BotError::StaleData(format!(
            "latest {} candle is {}s old (limit {}s)",
            config.symbol,
            age.num_seconds(),
            max_age.num_seconds()
        )));
    }

    let indicators = compute_indicators(&candles);
    let last_price = last.close;

    let sentiment = match exchange.fetch_sentiment(&config.symbol).await {
        Ok(data) if !data.is_empty() => Some(data),
        Ok(_) => None,
        Err(err) => {
            warn!("sentiment fetch failed, continuing without: {}", err);
            None
        }
    };

    debug!(
        "snapshot: {} candles, last price {:.2}, sentiment {}",
        candles.len(),
        last_price,
        if sentiment.is_some() { "yes" } else { "no" }
    );

    Ok(MarketSnapshot {
        symbol: config.symbol.clone(),
        candles,
        last_price,
        indicators,
        sentiment,
        fetched_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle_series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 50_000.0 + (i as f64) * 10.0;
                Candle {
                    timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 900, 0).unwrap(),
                    open: close - 5.0,
                    high: close + 20.0,
                    low: close - 20.0,
                    close,
                    volume: 100.0 + i as f64,
                }
            })
            .collect()
    }

    #[test]
    fn test_full_window_fills_every_indicator() {
        let set = compute_indicators(&candle_series(96));
        assert!(set.sma5.is_some());
        assert!(set.sma20.is_some());
        assert!(set.ema12.is_some());
        assert!(set.ema26.is_some());
        assert!(set.macd.is_some());
        assert!(set.rsi14.is_some());
        assert!(set.bb_upper.is_some());
        assert!(set.volume_ratio.is_some());
    }

    #[test]
    fn test_short_window_degrades_to_none() {
        let set = compute_indicators(&candle_series(10));
        assert!(set.sma5.is_some());
        assert!(set.sma20.is_none());
        assert!(set.macd.is_none());
        assert!(set.bb_upper.is_none());
    }

    #[test]
    fn test_rising_closes_give_positive_macd() {
        let set = compute_indicators(&candle_series(96));
        assert!(set.macd.unwrap() > 0.0);
    }
}
