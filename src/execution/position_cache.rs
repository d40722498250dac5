// TTL cache in front of position reads. Routine cycle reads come from
// the cache; anything that is about to place an order bypasses it.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::exchange::Exchange;
use crate::models::Position;
use crate::Result;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

struct CacheEntry {
    position: Option<Position>,
    fetched_at: Instant,
}

/// Shared, cloneable handle. A "no position" answer is cached just like
/// a real one; only age decides validity.
#[derive(Clone)]
pub struct PositionCache {
    exchange: Arc<dyn Exchange>,
    symbol: String,
    ttl: Duration,
    cell: Arc<RwLock<Option<CacheEntry>>>,
}

impl PositionCache {
    pub fn new(exchange: Arc<dyn Exchange>, symbol: impl Into<String>) -> Self {
        Self::with_ttl(exchange, symbol, DEFAULT_TTL)
    }

    pub fn with_ttl(
        exchange: Arc<dyn Exchange>,
        symbol: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            ttl,
            cell: Arc::new(RwLock::new(None)),
        }
    }

    /// Current position. With `use_cache` a fresh entry is served
    /// without touching the exchange; without it (or past the TTL) the
    /// exchange is asked and the cache refreshed. A failed refresh falls
    /// back to the last known entry however old, because a stale answer
    /// beats none for display paths; callers about to trade must pass
    /// `use_cache = false` and will see the error if there is no entry
    /// at all.
    pub async fn get(&self, use_cache: bool) -> Result<Option<Position>> {
        if use_cache {
            if let Some(entry) = self.cell.read().await.as_ref() {
                if entry.fetched_at.elapsed() < self.ttl {
                    debug!("position cache hit for {}", self.symbol);
                    return Ok(entry.position.clone());
                }
            }
        }

        match self.exchange.fetch_position(&self.symbol).await {
            Ok(position) => {
                *self.cell.write().await = Some(CacheEntry {
                    position: position.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(position)
            }
            Err(err) => {
                if let Some(entry) = self.cell.read().await.as_ref() {
                    warn!(
                        "position fetch failed ({}), serving stale entry for {}",
                        err, self.symbol
                    );
                    return Ok(entry.position.clone());
                }
                Err(err)
            }
        }
    }

    /// Forgets the cached entry; the next read goes to the exchange.
    pub async fn invalidate(&self) {
        *self.cell.write().await = None;
    }
}
