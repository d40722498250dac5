// Scripted connector for unit tests. Responses are queued per call;
// counters record what the code under test actually asked for.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{Duration, Utc};

use crate::models::{Balance, Candle, MarketMeta, Position, SentimentData};
use crate::Result;

use super::{Exchange, OrderAck, OrderRequest, ProtectiveOrder};

pub struct MockExchange {
    pub meta: MarketMeta,
    pub balance: Mutex<Balance>,
    pub candles: Mutex<Vec<Candle>>,
    /// Queued `fetch_position` outcomes, consumed front to back. When
    /// empty, `default_position` is returned.
    position_queue: Mutex<VecDeque<Result<Option<Position>>>>,
    default_position: Mutex<Option<Position>>,
    pub position_fetches: AtomicU32,
    pub orders: Mutex<Vec<OrderRequest>>,
    pub protective_orders: Mutex<Vec<ProtectiveOrder>>,
    pub leverage_calls: AtomicU32,
    pub resets: AtomicU32,
    order_seq: AtomicU32,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            meta: MarketMeta::default(),
            balance: Mutex::new(Balance {
                free_usdt: 1_000.0,
                used_usdt: 0.0,
                total_usdt: 1_000.0,
            }),
            candles: Mutex::new(flat_candles(96, 50_000.0)),
            position_queue: Mutex::new(VecDeque::new()),
            default_position: Mutex::new(None),
            position_fetches: AtomicU32::new(0),
            orders: Mutex::new(Vec::new()),
            protective_orders: Mutex::new(Vec::new()),
            leverage_calls: AtomicU32::new(0),
            resets: AtomicU32::new(0),
            order_seq: AtomicU32::new(0),
        }
    }

    pub fn queue_position(&self, outcome: Result<Option<Position>>) {
        self.position_queue.lock().unwrap().push_back(outcome);
    }

    pub fn set_default_position(&self, position: Option<Position>) {
        *self.default_position.lock().unwrap() = position;
    }

    pub fn set_balance(&self, free: f64, total: f64) {
        *self.balance.lock().unwrap() = Balance {
            free_usdt: free,
            used_usdt: total - free,
            total_usdt: total,
        };
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// A window of near-flat candles ending now, suitable for snapshots.
pub fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
    let now = Utc::now();
    (0..n)
        .map(|i| {
            let offset = Duration::minutes(15 * (n - 1 - i) as i64);
            let close = price + (i % 5) as f64;
            Candle {
                timestamp: now - offset,
                open: close - 1.0,
                high: close + 2.0,
                low: close - 2.0,
                close,
                volume: 100.0,
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl Exchange for MockExchange {
    async fn load_market_meta(&self, _symbol: &str) -> Result<MarketMeta> {
        Ok(self.meta)
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let candles = self.candles.lock().unwrap();
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn fetch_balance(&self) -> Result<Balance> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn fetch_position(&self, _symbol: &str) -> Result<Option<Position>> {
        self.position_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.position_queue.lock().unwrap().pop_front() {
            return outcome;
        }
        Ok(self.default_position.lock().unwrap().clone())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: f64) -> Result<()> {
        self.leverage_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_market_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        self.orders.lock().unwrap().push(req.clone());
        let n = self.order_seq.fetch_add(1, Ordering::SeqCst);
        Ok(OrderAck {
            order_id: format!("mock-{n}"),
        })
    }

    async fn create_protective_order(&self, req: &ProtectiveOrder) -> Result<OrderAck> {
        self.protective_orders.lock().unwrap().push(req.clone());
        let n = self.order_seq.fetch_add(1, Ordering::SeqCst);
        Ok(OrderAck {
            order_id: format!("mock-algo-{n}"),
        })
    }

    async fn fetch_sentiment(&self, _symbol: &str) -> Result<SentimentData> {
        Ok(SentimentData {
            long_short_ratio: Some(1.2),
            taker_buy_volume: Some(600.0),
            taker_sell_volume: Some(500.0),
        })
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
