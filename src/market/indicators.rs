// Indicator math over the candle window. Free functions returning
// Option; None means the window was too short.

/// Simple moving average over the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(values.iter().rev().take(period).sum::<f64>() / period as f64)
}

/// Exponential moving average, seeded with the SMA of the first `period`
/// values and smoothed with k = 2/(period+1).
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut current = values[..period].iter().sum::<f64>() / period as f64;
    for value in &values[period..] {
        current = value * k + current * (1.0 - k);
    }
    Some(current)
}

/// MACD line: EMA(12) − EMA(26).
pub fn macd_line(values: &[f64]) -> Option<f64> {
    Some(ema(values, 12)? - ema(values, 26)?)
}

/// Relative Strength Index over simple average gains/losses.
///
/// Values:
/// - RSI > 70: overbought
/// - RSI < 30: oversold
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period + 1 {
        return None;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for window in values[values.len() - period - 1..].windows(2) {
        let change = window[1] - window[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses += change.abs();
        }
    }

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Bollinger bands (upper, middle, lower) at `stddevs` standard
/// deviations around the `period` SMA.
pub fn bollinger(values: &[f64], period: usize, stddevs: f64) -> Option<(f64, f64, f64)> {
    let middle = sma(values, period)?;
    let window = &values[values.len() - period..];
    let variance =
        window.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / period as f64;
    let band = variance.sqrt() * stddevs;
    Some((middle + band, middle, middle - band))
}

/// Last volume relative to its `period` average.
pub fn volume_ratio(volumes: &[f64], period: usize) -> Option<f64> {
    let last = *volumes.last()?;
    let avg = sma(volumes, period)?;
    if avg == 0.0 {
        return None;
    }
    Some(last / avg)
}
