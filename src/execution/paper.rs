//! Simulated execution against live market data.

use crate::exchange::{ConnectorError, OrderSide, SymbolMeta};
use crate::execution::backend::{ExecutionBackend, ExecutionEvent};
use crate::execution::order::Order;
use crate::market::MarketCache;
use crate::utils::decimal::round_to_tick;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Simulation parameters for the paper backend.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Slippage fraction applied on top of the touch price.
    pub slippage: Decimal,
    /// Taker fee rate per fill.
    pub taker_fee_rate: Decimal,
    /// Book snapshots older than this are refused, same as live would
    /// refuse an unreachable market.
    pub freshness_secs: u64,
}

/// Paper backend: fabricates fills from the live order book.
///
/// Market orders fill fully and immediately. Validation mirrors the
/// exchange: quantity below min qty, notional below min notional, and
/// missing or stale book data are rejected without a fill.
pub struct PaperBackend {
    cache: Arc<MarketCache>,
    metas: HashMap<String, SymbolMeta>,
    config: PaperConfig,
    events: mpsc::Sender<ExecutionEvent>,
}

impl PaperBackend {
    pub fn new(
        cache: Arc<MarketCache>,
        metas: HashMap<String, SymbolMeta>,
        config: PaperConfig,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            cache,
            metas,
            config,
            events,
        }
    }

    async fn reject(&self, client_order_id: &str, reason: String) -> Result<(), ConnectorError> {
        self.events
            .send(ExecutionEvent::Rejected {
                client_order_id: client_order_id.to_string(),
                reason,
            })
            .await
            .map_err(|_| ConnectorError::Transport("event channel closed".to_string()))
    }
}

#[async_trait]
impl ExecutionBackend for PaperBackend {
    async fn submit(&self, order: &Order) -> Result<(), ConnectorError> {
        let now = Utc::now();
        let bound = Duration::seconds(self.config.freshness_secs as i64);

        let book = match self.cache.book(&order.symbol).await {
            Some(book) if book.is_fresh(now, bound) => book,
            Some(_) => {
                return self
                    .reject(&order.client_order_id, "book data stale".to_string())
                    .await;
            }
            None => {
                return self
                    .reject(&order.client_order_id, "no book data".to_string())
                    .await;
            }
        };

        if let Some(meta) = self.metas.get(&order.symbol) {
            if order.quantity < meta.min_qty {
                return self
                    .reject(
                        &order.client_order_id,
                        format!("quantity {} below min qty {}", order.quantity, meta.min_qty),
                    )
                    .await;
            }
            let notional = order.quantity * book.mid_price();
            if notional < meta.min_notional {
                return self
                    .reject(
                        &order.client_order_id,
                        format!(
                            "notional {} below min notional {}",
                            notional, meta.min_notional
                        ),
                    )
                    .await;
            }
        }

        // Taker fill with slippage applied against the order
        let raw_price = match order.side {
            OrderSide::Buy => book.ask_price * (Decimal::ONE + self.config.slippage),
            OrderSide::Sell => book.bid_price * (Decimal::ONE - self.config.slippage),
        };
        let tick = self
            .metas
            .get(&order.symbol)
            .map(|m| m.tick_size)
            .unwrap_or(Decimal::ZERO);
        let price = round_to_tick(raw_price, tick);
        let fee = order.quantity * price * self.config.taker_fee_rate;

        debug!(
            symbol = %order.symbol,
            client_order_id = %order.client_order_id,
            %price,
            "Simulated fill"
        );

        let send = |event| {
            let events = self.events.clone();
            async move {
                events
                    .send(event)
                    .await
                    .map_err(|_| ConnectorError::Transport("event channel closed".to_string()))
            }
        };

        send(ExecutionEvent::Accepted {
            client_order_id: order.client_order_id.clone(),
        })
        .await?;
        send(ExecutionEvent::Fill {
            client_order_id: order.client_order_id.clone(),
            quantity: order.quantity,
            price,
            fee,
        })
        .await?;

        Ok(())
    }

    async fn cancel(&self, _symbol: &str, client_order_id: &str) -> Result<(), ConnectorError> {
        // Paper fills are immediate; there is never a resting order to
        // cancel. Idempotent no-op, matching the live cancel contract.
        debug!(client_order_id, "Paper cancel (no-op)");
        Ok(())
    }
}
