// Shared runtime state. The scheduler is the single writer; the health
// server and monitor read snapshot copies and never hold the lock
// across awaits.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::models::{Balance, Position, ProfitPoint, Signal, TradeRecord};

pub const SIGNAL_HISTORY_CAP: usize = 30;
pub const DECISION_HISTORY_CAP: usize = 50;
pub const TRADE_HISTORY_CAP: usize = 100;
pub const PROFIT_CURVE_CAP: usize = 200;

/// FIFO buffer that evicts its oldest entry once full.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> BoundedHistory<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.cap {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> BoundedHistory<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[derive(Debug)]
struct StateInner {
    account: Balance,
    current_price: f64,
    current_position: Option<Position>,
    signals: BoundedHistory<Signal>,
    decisions: BoundedHistory<Signal>,
    trades: BoundedHistory<TradeRecord>,
    profit_curve: BoundedHistory<ProfitPoint>,
    initial_balance: Option<f64>,
    last_update: Option<DateTime<Utc>>,
}

impl StateInner {
    fn new() -> Self {
        Self {
            account: Balance::default(),
            current_price: 0.0,
            current_position: None,
            signals: BoundedHistory::new(SIGNAL_HISTORY_CAP),
            decisions: BoundedHistory::new(DECISION_HISTORY_CAP),
            trades: BoundedHistory::new(TRADE_HISTORY_CAP),
            profit_curve: BoundedHistory::new(PROFIT_CURVE_CAP),
            initial_balance: None,
            last_update: None,
        }
    }
}

/// Read-only copy served to the health endpoint and logs.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub account: Balance,
    pub current_price: f64,
    pub current_position: Option<Position>,
    pub last_update: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub signal_count: usize,
    pub trade_count: usize,
}

pub struct SharedState {
    inner: RwLock<StateInner>,
    started_at: DateTime<Utc>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StateInner::new()),
            started_at: Utc::now(),
        }
    }

    /// Records the cycle heartbeat the health checks watch.
    pub async fn touch(&self) {
        self.inner.write().await.last_update = Some(Utc::now());
    }

    pub async fn set_price(&self, price: f64) {
        self.inner.write().await.current_price = price;
    }

    pub async fn set_position(&self, position: Option<Position>) {
        self.inner.write().await.current_position = position;
    }

    /// Appends a signal to both the pipeline history (what the advisor
    /// sees) and the decision list (what the dashboard sees). Returns
    /// true when the last three signals share the same action.
    pub async fn push_signal(&self, signal: Signal) -> bool {
        let mut inner = self.inner.write().await;
        inner.decisions.push(signal.clone());
        inner.signals.push(signal);

        let recent: Vec<_> = inner
            .signals
            .iter()
            .rev()
            .take(3)
            .map(|s| s.action)
            .collect();
        recent.len() == 3 && recent.iter().all(|a| *a == recent[0])
    }

    pub async fn push_trade(&self, record: TradeRecord) {
        self.inner.write().await.trades.push(record);
    }

    /// Updates the account and extends the profit curve. The first
    /// reported equity becomes the baseline for the profit rate.
    pub async fn record_account(&self, balance: Balance, unrealized_pnl: f64) {
        let mut inner = self.inner.write().await;
        inner.account = balance;

        let equity = balance.total_usdt;
        let initial = *inner.initial_balance.get_or_insert(equity);
        let profit = equity - initial;
        let profit_rate = if initial > 0.0 {
            profit / initial * 100.0
        } else {
            0.0
        };

        inner.profit_curve.push(ProfitPoint {
            timestamp: Utc::now(),
            equity,
            profit,
            profit_rate,
            unrealized_pnl,
        });
    }

    pub async fn last_signal(&self) -> Option<Signal> {
        self.inner.read().await.signals.last().cloned()
    }

    pub async fn signal_history(&self) -> Vec<Signal> {
        self.inner.read().await.signals.to_vec()
    }

    /// Most recent advisory decisions, newest last.
    pub async fn recent_decisions(&self) -> Vec<Signal> {
        self.inner.read().await.decisions.to_vec()
    }

    /// Timestamp of the most recent entry order, for the min-hold gate.
    pub async fn last_trade_time(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.trades.last().map(|t| t.timestamp)
    }

    pub async fn seconds_since_update(&self) -> Option<i64> {
        let inner = self.inner.read().await;
        inner
            .last_update
            .map(|ts| (Utc::now() - ts).num_seconds())
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read().await;
        StateSnapshot {
            account: inner.account,
            current_price: inner.current_price,
            current_position: inner.current_position.clone(),
            last_update: inner.last_update,
            started_at: self.started_at,
            signal_count: inner.signals.len(),
            trade_count: inner.trades.len(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[cfg(test)]
    pub async fn force_last_update(&self, ts: DateTime<Utc>) {
        self.inner.write().await.last_update = Some(ts);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Confidence, SignalAction};
    use tokio_test::block_on;

    fn signal(action: SignalAction) -> Signal {
        Signal {
            action,
            confidence: Confidence::Medium,
            stop_loss: 49_000.0,
            take_profit: 51_000.0,
            reason: "test".to_string(),
            timestamp: Utc::now(),
            is_fallback: false,
        }
    }

    #[test]
    fn test_bounded_history_evicts_oldest() {
        let mut history = BoundedHistory::new(3);
        for i in 0..5 {
            history.push(i);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.to_vec(), vec![2, 3, 4]);
        assert_eq!(history.last(), Some(&4));
    }

    #[test]
    fn test_signal_history_capped_at_thirty() {
        let state = SharedState::new();
        block_on(async {
            for _ in 0..40 {
                state.push_signal(signal(SignalAction::Hold)).await;
            }
            assert_eq!(state.signal_history().await.len(), SIGNAL_HISTORY_CAP);
        });
    }

    #[test]
    fn test_three_identical_signals_flag_continuity() {
        let state = SharedState::new();
        block_on(async {
            assert!(!state.push_signal(signal(SignalAction::Buy)).await);
            assert!(!state.push_signal(signal(SignalAction::Buy)).await);
            assert!(state.push_signal(signal(SignalAction::Buy)).await);
            assert!(!state.push_signal(signal(SignalAction::Sell)).await);
        });
    }

    #[test]
    fn test_profit_curve_baseline_is_first_equity() {
        let state = SharedState::new();
        block_on(async {
            state
                .record_account(
                    Balance {
                        free_usdt: 1_000.0,
                        used_usdt: 0.0,
                        total_usdt: 1_000.0,
                    },
                    0.0,
                )
                .await;
            state
                .record_account(
                    Balance {
                        free_usdt: 1_100.0,
                        used_usdt: 0.0,
                        total_usdt: 1_100.0,
                    },
                    0.0,
                )
                .await;

            let inner = state.inner.read().await;
            let curve = &inner.profit_curve;
            assert_eq!(curve.len(), 2);
            let last = curve.last().unwrap();
            assert!((last.profit - 100.0).abs() < 1e-9);
            assert!((last.profit_rate - 10.0).abs() < 1e-9);
        });
    }

    #[test]
    fn test_snapshot_reflects_updates() {
        let state = SharedState::new();
        block_on(async {
            state.set_price(50_000.0).await;
            state.touch().await;

            let snapshot = state.snapshot().await;
            assert_eq!(snapshot.current_price, 50_000.0);
            assert!(snapshot.last_update.is_some());
            assert!(snapshot.current_position.is_none());
        });
    }
}
