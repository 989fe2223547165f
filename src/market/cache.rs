//! Per-symbol cache of funding and book state.
//!
//! Every snapshot carries the time it was observed; consumers decide
//! staleness against their own freshness bound. A snapshot exactly at the
//! bound is still valid, anything strictly older is stale.

use crate::exchange::{BookTickerUpdate, MarkPriceUpdate, MarketEvent};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Funding state for one symbol.
#[derive(Debug, Clone)]
pub struct FundingSnapshot {
    pub symbol: String,
    pub rate: Decimal,
    pub mark_price: Decimal,
    pub next_funding_time: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl FundingSnapshot {
    pub fn is_fresh(&self, now: DateTime<Utc>, bound: chrono::Duration) -> bool {
        now.signed_duration_since(self.observed_at) <= bound
    }
}

/// Best bid/ask state for one symbol.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub symbol: String,
    pub bid_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_price: Decimal,
    pub ask_qty: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl BookSnapshot {
    pub fn mid_price(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }

    /// Spread as a fraction of the mid price.
    pub fn spread_fraction(&self) -> Decimal {
        let mid = self.mid_price();
        if mid == Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.ask_price - self.bid_price) / mid
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, bound: chrono::Duration) -> bool {
        now.signed_duration_since(self.observed_at) <= bound
    }
}

#[derive(Debug, Default)]
struct SymbolMarket {
    funding: Option<FundingSnapshot>,
    book: Option<BookSnapshot>,
}

/// Shared cache of the latest market state per symbol.
#[derive(Default)]
pub struct MarketCache {
    inner: RwLock<HashMap<String, SymbolMarket>>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest funding snapshot for a symbol, if any has arrived.
    pub async fn funding(&self, symbol: &str) -> Option<FundingSnapshot> {
        self.inner
            .read()
            .await
            .get(symbol)
            .and_then(|m| m.funding.clone())
    }

    /// Latest book snapshot for a symbol, if any has arrived.
    pub async fn book(&self, symbol: &str) -> Option<BookSnapshot> {
        self.inner
            .read()
            .await
            .get(symbol)
            .and_then(|m| m.book.clone())
    }

    pub async fn apply_mark_price(&self, update: &MarkPriceUpdate, now: DateTime<Utc>) {
        let next_funding_time = Utc
            .timestamp_millis_opt(update.next_funding_time)
            .single()
            .unwrap_or(now);

        let snapshot = FundingSnapshot {
            symbol: update.symbol.clone(),
            rate: update.funding_rate,
            mark_price: update.mark_price,
            next_funding_time,
            observed_at: now,
        };

        self.inner
            .write()
            .await
            .entry(update.symbol.clone())
            .or_default()
            .funding = Some(snapshot);
    }

    pub async fn apply_book_ticker(&self, update: &BookTickerUpdate, now: DateTime<Utc>) {
        let snapshot = BookSnapshot {
            symbol: update.symbol.clone(),
            bid_price: update.bid_price,
            bid_qty: update.bid_qty,
            ask_price: update.ask_price,
            ask_qty: update.ask_qty,
            observed_at: now,
        };

        self.inner
            .write()
            .await
            .entry(update.symbol.clone())
            .or_default()
            .book = Some(snapshot);
    }

    /// Spawn a task draining stream events into the cache.
    ///
    /// Stale data is handled by timestamping, not eviction: after a
    /// disconnect the old snapshots simply age out of the freshness bound.
    pub fn spawn_ingest(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<MarketEvent>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let now = Utc::now();
                match event {
                    MarketEvent::MarkPrice(update) => {
                        cache.apply_mark_price(&update, now).await;
                    }
                    MarketEvent::BookTicker(update) => {
                        cache.apply_book_ticker(&update, now).await;
                    }
                    MarketEvent::Connected => {
                        info!("Market stream connected");
                    }
                    MarketEvent::Disconnected => {
                        warn!("Market stream disconnected, snapshots will go stale");
                    }
                }
            }
        })
    }
}
