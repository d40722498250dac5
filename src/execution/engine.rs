// Order execution: precondition gates, sizing, placement, protective
// orders and post-trade verification. The exchange is the single source
// of truth; every check-and-act read bypasses the position cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::TradeConfig;
use crate::error::BotError;
use crate::exchange::{
    Exchange, OrderRequest, OrderSide, ProtectiveKind, ProtectiveOrder,
};
use crate::models::{
    Confidence, MarketMeta, MarketSnapshot, PositionSide, Signal, SignalAction, TradeRecord,
};
use crate::Result;

use super::position_cache::PositionCache;

// Wait for the exchange to settle the fill before verifying it.
const SETTLEMENT_DELAY: Duration = Duration::from_secs(2);
// Never commit more than this share of free balance as margin.
const MARGIN_HEADROOM: f64 = 0.8;

/// Sizing outcome for one entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderPlan {
    /// Order size in base units (BTC).
    pub quantity: f64,
    /// Same size in exchange contract units.
    pub contracts: f64,
    /// Margin actually committed, recomputed after any clamp.
    pub margin_usdt: f64,
    pub notional_usdt: f64,
    pub clamped: bool,
}

/// Sizes an entry from configured margin and leverage, clamping up to
/// the instrument minimum and recomputing the committed margin when the
/// clamp fires.
pub fn plan_order(margin_usdt: f64, leverage: f64, price: f64, meta: &MarketMeta) -> OrderPlan {
    let target_notional = margin_usdt * leverage;
    let raw_quantity = target_notional / price;

    let (quantity, clamped) = if raw_quantity < meta.min_quantity {
        (meta.min_quantity, true)
    } else {
        (raw_quantity, false)
    };

    let notional = quantity * price;
    OrderPlan {
        quantity,
        contracts: quantity / meta.contract_size,
        margin_usdt: notional / leverage,
        notional_usdt: notional,
        clamped,
    }
}

pub struct ExecutionEngine {
    exchange: Arc<dyn Exchange>,
    cache: PositionCache,
    config: TradeConfig,
    meta: RwLock<Option<MarketMeta>>,
}

impl ExecutionEngine {
    pub fn new(exchange: Arc<dyn Exchange>, cache: PositionCache, config: TradeConfig) -> Self {
        Self {
            exchange,
            cache,
            config,
            meta: RwLock::new(None),
        }
    }

    /// Lazy connector initialization: instrument metadata and leverage
    /// are fetched once and survive until `reset`.
    pub async fn ensure_ready(&self) -> Result<MarketMeta> {
        if let Some(meta) = *self.meta.read().await {
            return Ok(meta);
        }

        let meta = self.exchange.load_market_meta(&self.config.symbol).await?;
        self.exchange
            .set_leverage(&self.config.symbol, self.config.leverage)
            .await?;
        *self.meta.write().await = Some(meta);
        Ok(meta)
    }

    /// Drops cached metadata and rebuilds the exchange session. The next
    /// cycle reinitializes from scratch.
    pub async fn reset(&self) {
        *self.meta.write().await = None;
        self.cache.invalidate().await;
        if let Err(err) = self.exchange.reset().await {
            warn!("exchange reset failed: {}", err);
        }
    }

    /// Turns a signal into at most one market order. Preconditions that
    /// make this a no-op return `Ok(None)`; an affordability failure is
    /// an explicit `InsufficientMargin` the caller can treat as a skip.
    pub async fn execute(
        &self,
        signal: &Signal,
        snapshot: &MarketSnapshot,
    ) -> Result<Option<TradeRecord>> {
        let (side, pos_side) = match signal.action {
            SignalAction::Hold => {
                info!("signal is HOLD, nothing to do");
                return Ok(None);
            }
            SignalAction::Buy => (OrderSide::Buy, PositionSide::Long),
            SignalAction::Sell => (OrderSide::Sell, PositionSide::Short),
        };

        if signal.confidence == Confidence::Low && !self.config.test_mode {
            info!("confidence LOW, skipping entry");
            return Ok(None);
        }

        // Source-of-truth read directly before acting.
        if let Some(existing) = self.cache.get(false).await? {
            warn!(
                "existing {} position of {:.4} contracts, skipping entry",
                existing.side, existing.contracts
            );
            return Ok(None);
        }

        let meta = self.ensure_ready().await?;
        let plan = plan_order(
            self.config.margin_usdt,
            self.config.leverage,
            snapshot.last_price,
            &meta,
        );
        if plan.clamped {
            info!(
                "size clamped to instrument minimum {:.4}, margin now {:.2} USDT",
                plan.quantity, plan.margin_usdt
            );
        }

        if self.config.test_mode {
            info!(
                "[TEST MODE] would place {} {} {:.4} contracts ({:.4} {} @ {:.2}, margin {:.2} USDT)",
                side,
                self.config.symbol,
                plan.contracts,
                plan.quantity,
                self.config.symbol.split('-').next().unwrap_or("base"),
                snapshot.last_price,
                plan.margin_usdt
            );
            return Ok(None);
        }

        let balance = self.exchange.fetch_balance().await?;
        let budget = balance.free_usdt * MARGIN_HEADROOM;
        if plan.margin_usdt > budget {
            return Err(BotError::InsufficientMargin {
                required: plan.margin_usdt,
                available: balance.free_usdt,
            });
        }

        let ack = self
            .exchange
            .create_market_order(&OrderRequest {
                symbol: self.config.symbol.clone(),
                side,
                pos_side,
                contracts: plan.contracts,
                reduce_only: false,
            })
            .await?;
        self.cache.invalidate().await;
        info!(
            "entry placed: {} {:.4} contracts @ ~{:.2}, order {}",
            side, plan.contracts, snapshot.last_price, ack.order_id
        );

        self.arm_protective_orders(signal, pos_side, plan.contracts)
            .await;

        tokio::time::sleep(SETTLEMENT_DELAY).await;
        match self.cache.get(false).await {
            Ok(Some(position)) => info!(
                "position confirmed: {} {:.4} contracts, entry {:.2}",
                position.side, position.contracts, position.entry_price
            ),
            Ok(None) => warn!("order acknowledged but no position visible yet"),
            Err(err) => warn!("post-trade verification failed: {}", err),
        }

        Ok(Some(TradeRecord {
            timestamp: Utc::now(),
            symbol: self.config.symbol.clone(),
            action: signal.action,
            price: snapshot.last_price,
            quantity: plan.quantity,
            contracts: plan.contracts,
            margin_usdt: plan.margin_usdt,
            notional_usdt: plan.notional_usdt,
            leverage: self.config.leverage,
            confidence: signal.confidence,
            reason: signal.reason.clone(),
            order_id: ack.order_id,
        }))
    }

    /// Places reduce-only stop-loss and take-profit around the fresh
    /// entry. Failures are logged, never fatal: the position stands
    /// either way and the close review still covers it.
    async fn arm_protective_orders(&self, signal: &Signal, pos_side: PositionSide, contracts: f64) {
        let exit_side = match pos_side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let orders = [
            (ProtectiveKind::StopLoss, signal.stop_loss),
            (ProtectiveKind::TakeProfit, signal.take_profit),
        ];
        for (kind, trigger_price) in orders {
            let result = self
                .exchange
                .create_protective_order(&ProtectiveOrder {
                    symbol: self.config.symbol.clone(),
                    side: exit_side,
                    pos_side,
                    contracts,
                    kind,
                    trigger_price,
                })
                .await;
            if let Err(err) = result {
                warn!("{:?} placement failed at {:.2}: {}", kind, trigger_price, err);
            }
        }
    }

    /// Closes the open position with a reduce-only market order. Returns
    /// `true` when the position is verified gone afterwards; a position
    /// that vanished before we acted also counts as success.
    pub async fn close_position(&self, reason: &str) -> Result<bool> {
        let Some(live) = self.cache.get(false).await? else {
            info!("close requested but no position on the exchange, done");
            return Ok(true);
        };

        let side = match live.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let ack = self
            .exchange
            .create_market_order(&OrderRequest {
                symbol: live.symbol.clone(),
                side,
                pos_side: live.side,
                contracts: live.contracts,
                reduce_only: true,
            })
            .await?;
        self.cache.invalidate().await;
        info!(
            "close order placed for {} {:.4} contracts ({}), order {}",
            live.side, live.contracts, reason, ack.order_id
        );

        tokio::time::sleep(SETTLEMENT_DELAY).await;
        match self.cache.get(false).await? {
            Some(residual) => {
                warn!(
                    "close incomplete, {:.4} contracts remain",
                    residual.contracts
                );
                Ok(false)
            }
            None => {
                info!("position closed and verified");
                Ok(true)
            }
        }
    }
}
