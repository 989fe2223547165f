//! Live execution through the Binance REST API and user data stream.

use crate::exchange::{
    BinanceClient, ConnectorError, NewOrder, OrderTradeUpdate, OrderType,
};
use crate::execution::backend::{ExecutionBackend, ExecutionEvent};
use crate::execution::order::Order;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Listen keys expire after 60 minutes without a keepalive.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Live backend: real orders against the exchange.
///
/// The REST response is only used for submit acks and rejections; fills
/// arrive through the user data stream and are bridged onto the shared
/// event channel.
pub struct LiveBackend {
    client: Arc<BinanceClient>,
    events: mpsc::Sender<ExecutionEvent>,
}

impl LiveBackend {
    pub fn new(client: Arc<BinanceClient>, events: mpsc::Sender<ExecutionEvent>) -> Self {
        Self { client, events }
    }

    /// Bridge user-stream order updates onto the execution event channel.
    pub fn spawn_user_stream_bridge(
        events: mpsc::Sender<ExecutionEvent>,
        mut updates: mpsc::Receiver<OrderTradeUpdate>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                if let Some(event) = translate_update(&update) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    /// Keep the user data stream listen key alive for the process
    /// lifetime.
    pub fn spawn_listen_key_keepalive(client: Arc<BinanceClient>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if let Err(e) = client.keepalive_listen_key().await {
                    error!("Listen key keepalive failed: {}", e);
                }
            }
        })
    }
}

/// Map one ORDER_TRADE_UPDATE to an execution event.
fn translate_update(update: &OrderTradeUpdate) -> Option<ExecutionEvent> {
    match update.execution_type.as_str() {
        "TRADE" => Some(ExecutionEvent::Fill {
            client_order_id: update.client_order_id.clone(),
            quantity: update.last_filled_qty,
            price: update.last_filled_price,
            fee: update.commission.unwrap_or(Decimal::ZERO),
        }),
        "CANCELED" => Some(ExecutionEvent::Cancelled {
            client_order_id: update.client_order_id.clone(),
        }),
        _ if update.status == "REJECTED" => Some(ExecutionEvent::Rejected {
            client_order_id: update.client_order_id.clone(),
            reason: "rejected by exchange".to_string(),
        }),
        "NEW" => None, // REST ack already produced Accepted
        other => {
            debug!(execution_type = other, "Ignoring order update");
            None
        }
    }
}

#[async_trait]
impl ExecutionBackend for LiveBackend {
    async fn submit(&self, order: &Order) -> Result<(), ConnectorError> {
        let request = NewOrder {
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: OrderType::Market,
            quantity: order.quantity,
            price: None,
            time_in_force: None,
            reduce_only: None,
            new_client_order_id: order.client_order_id.clone(),
        };

        let response = self.client.place_order(&request).await?;
        debug!(
            order_id = response.order_id,
            client_order_id = %order.client_order_id,
            "Order acknowledged"
        );

        self.events
            .send(ExecutionEvent::Accepted {
                client_order_id: order.client_order_id.clone(),
            })
            .await
            .map_err(|_| ConnectorError::Transport("event channel closed".to_string()))
    }

    async fn cancel(&self, symbol: &str, client_order_id: &str) -> Result<(), ConnectorError> {
        match self.client.cancel_order(symbol, client_order_id).await? {
            Some(_) => Ok(()),
            None => {
                warn!(client_order_id, "Cancel found no resting order");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn update(execution_type: &str, status: &str) -> OrderTradeUpdate {
        OrderTradeUpdate {
            symbol: "BTCUSDT".to_string(),
            client_order_id: "farb-1-1".to_string(),
            side: "SELL".to_string(),
            status: status.to_string(),
            execution_type: execution_type.to_string(),
            last_filled_qty: dec!(0.01),
            last_filled_price: dec!(50000),
            cumulative_filled_qty: dec!(0.01),
            commission: Some(dec!(0.2)),
            order_id: 1,
        }
    }

    #[test]
    fn test_trade_update_becomes_fill() {
        let event = translate_update(&update("TRADE", "FILLED")).unwrap();
        match event {
            ExecutionEvent::Fill {
                quantity,
                price,
                fee,
                ..
            } => {
                assert_eq!(quantity, dec!(0.01));
                assert_eq!(price, dec!(50000));
                assert_eq!(fee, dec!(0.2));
            }
            other => panic!("expected Fill, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_update_becomes_cancelled() {
        let event = translate_update(&update("CANCELED", "CANCELED")).unwrap();
        assert!(matches!(event, ExecutionEvent::Cancelled { .. }));
    }

    #[test]
    fn test_new_ack_is_not_duplicated() {
        assert!(translate_update(&update("NEW", "NEW")).is_none());
    }

    #[test]
    fn test_exchange_rejection_translates() {
        let event = translate_update(&update("EXPIRED", "REJECTED")).unwrap();
        assert!(matches!(event, ExecutionEvent::Rejected { .. }));
    }
}
