// The trading loop. Cycles fire on wall-clock candle boundaries; a run
// of failed cycles resets the connector and backs off before retrying.

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::advisor::DecisionPipeline;
use crate::config::TradeConfig;
use crate::error::BotError;
use crate::exchange::Exchange;
use crate::execution::{ExecutionEngine, PositionCache};
use crate::market;
use crate::ratelimit::ApiRateLimiter;
use crate::state::SharedState;
use crate::Result;

const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const BACKOFF_STEP_SECS: u64 = 60;
const MAX_BACKOFF_SECS: u64 = 300;

/// Seconds to sleep until the next candle boundary. At an exact
/// boundary the cycle fires immediately.
pub fn seconds_until_boundary(now: DateTime<Utc>, timeframe_minutes: i64) -> u64 {
    let minute_of_day = (now.hour() * 60 + now.minute()) as i64;
    let second = now.second() as i64;
    let into_period = minute_of_day % timeframe_minutes;
    if into_period == 0 && second == 0 {
        return 0;
    }
    ((timeframe_minutes - into_period) * 60 - second).max(0) as u64
}

/// Linear backoff after failed cycles, capped at five minutes.
pub fn backoff_secs(consecutive_failures: u32) -> u64 {
    (BACKOFF_STEP_SECS * u64::from(consecutive_failures)).min(MAX_BACKOFF_SECS)
}

pub struct TradingScheduler {
    config: TradeConfig,
    exchange: Arc<dyn Exchange>,
    engine: Arc<ExecutionEngine>,
    pipeline: Arc<DecisionPipeline>,
    cache: PositionCache,
    state: Arc<SharedState>,
    limiter: Arc<ApiRateLimiter>,
}

impl TradingScheduler {
    pub fn new(
        config: TradeConfig,
        exchange: Arc<dyn Exchange>,
        engine: Arc<ExecutionEngine>,
        pipeline: Arc<DecisionPipeline>,
        cache: PositionCache,
        state: Arc<SharedState>,
        limiter: Arc<ApiRateLimiter>,
    ) -> Self {
        Self {
            config,
            exchange,
            engine,
            pipeline,
            cache,
            state,
            limiter,
        }
    }

    /// Runs until the shutdown flag flips. Each iteration sleeps to the
    /// next candle boundary, runs one cycle and accounts for failures.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "scheduler started: {} on {} candles{}",
            self.config.symbol,
            self.config.timeframe,
            if self.config.test_mode {
                " [TEST MODE]"
            } else {
                ""
            }
        );

        let mut consecutive_failures: u32 = 0;
        loop {
            let wait = seconds_until_boundary(Utc::now(), self.config.timeframe_minutes());
            if wait > 0 {
                info!("next cycle in {}s", wait);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
                    _ = shutdown.changed() => break,
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(()) => {
                    consecutive_failures = 0;
                }
                Err(BotError::InsufficientMargin {
                    required,
                    available,
                }) => {
                    // An unaffordable entry is a completed cycle, not a fault.
                    warn!(
                        "entry skipped: needs {:.2} USDT margin, {:.2} free",
                        required, available
                    );
                    self.state.touch().await;
                    consecutive_failures = 0;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    error!(
                        "cycle failed ({} consecutive): {}",
                        consecutive_failures, err
                    );

                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        warn!("failure streak reached {}, resetting connector", consecutive_failures);
                        self.engine.reset().await;
                        consecutive_failures = 0;
                    }

                    let backoff = backoff_secs(consecutive_failures.max(1));
                    warn!("backing off {}s before the next attempt", backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }
        info!("scheduler stopped");
    }

    /// One full cycle: snapshot, position, close review or entry
    /// decision, state update.
    pub async fn run_cycle(&self) -> Result<()> {
        self.engine.ensure_ready().await?;

        let snapshot = market::build_snapshot(self.exchange.as_ref(), &self.config).await?;
        self.state.set_price(snapshot.last_price).await;

        let position = self.cache.get(true).await?;
        self.state.set_position(position.clone()).await;

        if let Some(position) = position {
            // Managing an open position; no new entries this cycle.
            let opened_at = match self.state.last_trade_time().await {
                Some(ts) => Some(ts),
                None => position.opened_at,
            };
            let decision = self
                .pipeline
                .should_close(
                    &position,
                    &snapshot,
                    opened_at,
                    self.config.min_hold_minutes(),
                )
                .await;

            if let Some(decision) = decision {
                info!(
                    "advisor says close ({} urgency): {}",
                    decision.urgency, decision.reason
                );
                match self.engine.close_position(&decision.reason).await {
                    Ok(true) => self.state.set_position(None).await,
                    Ok(false) => warn!("close left a residual position"),
                    Err(err) => warn!("close failed: {}", err),
                }
            } else {
                info!(
                    "holding {} position, {:.2} USDT unrealized",
                    position.side, position.unrealized_pnl
                );
            }

            self.finish_cycle(position.unrealized_pnl).await;
            return Ok(());
        }

        let last_signal = self.state.last_signal().await;
        let signal = self
            .pipeline
            .decide_with_retry(&snapshot, None, last_signal.as_ref())
            .await;
        info!(
            "signal: {} ({}){} - {}",
            signal.action,
            signal.confidence,
            if signal.is_fallback { " [fallback]" } else { "" },
            signal.reason
        );

        let continuity = self.state.push_signal(signal.clone()).await;
        if continuity {
            info!("three consecutive {} signals, trend looks persistent", signal.action);
        }

        let record = self.engine.execute(&signal, &snapshot).await?;
        if let Some(record) = record {
            info!(
                "trade recorded: {} {:.4} contracts @ {:.2}",
                record.action, record.contracts, record.price
            );
            self.state.push_trade(record).await;
        }

        self.finish_cycle(0.0).await;
        Ok(())
    }

    /// Trailing bookkeeping shared by both cycle paths.
    async fn finish_cycle(&self, unrealized_pnl: f64) {
        match self.exchange.fetch_balance().await {
            Ok(balance) => self.state.record_account(balance, unrealized_pnl).await,
            Err(err) => warn!("balance refresh failed: {}", err),
        }
        self.state.touch().await;

        let stats = self.limiter.stats();
        info!(
            "api usage: {} requests, {:.1}% ok, {:.1}/min, {} rate limited",
            stats.total_requests,
            stats.success_rate(),
            stats.requests_per_minute(),
            stats.rate_limited_requests
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_boundary_for_15m_candles() {
        assert_eq!(seconds_until_boundary(at(10, 7, 30), 15), 450);
        assert_eq!(seconds_until_boundary(at(10, 0, 0), 15), 0);
        assert_eq!(seconds_until_boundary(at(10, 14, 59), 15), 1);
        assert_eq!(seconds_until_boundary(at(10, 15, 0), 15), 0);
    }

    #[test]
    fn test_boundary_for_hourly_candles() {
        assert_eq!(seconds_until_boundary(at(10, 59, 59), 60), 1);
        assert_eq!(seconds_until_boundary(at(11, 0, 0), 60), 0);
        assert_eq!(seconds_until_boundary(at(10, 30, 0), 60), 1800);
    }

    #[test]
    fn test_boundary_for_4h_candles_uses_minute_of_day() {
        // 13:00 is not a 4h boundary; the next one is 16:00.
        assert_eq!(seconds_until_boundary(at(13, 0, 0), 240), 3 * 3600);
        assert_eq!(seconds_until_boundary(at(16, 0, 0), 240), 0);
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        assert_eq!(backoff_secs(1), 60);
        assert_eq!(backoff_secs(2), 120);
        assert_eq!(backoff_secs(5), 300);
        assert_eq!(backoff_secs(50), 300);
    }
}
