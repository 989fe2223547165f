//! Backend contract shared by paper and live execution.

use crate::exchange::ConnectorError;
use crate::execution::order::Order;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Event emitted by a backend about an in-flight order.
///
/// All backends share one mpsc channel; the dispatcher routes events to
/// the waiting order by client order id.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Accepted {
        client_order_id: String,
    },
    Fill {
        client_order_id: String,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    },
    Cancelled {
        client_order_id: String,
    },
    Rejected {
        client_order_id: String,
        reason: String,
    },
}

impl ExecutionEvent {
    pub fn client_order_id(&self) -> &str {
        match self {
            Self::Accepted { client_order_id }
            | Self::Fill {
                client_order_id, ..
            }
            | Self::Cancelled { client_order_id }
            | Self::Rejected {
                client_order_id, ..
            } => client_order_id,
        }
    }
}

/// Order placement backend.
///
/// `submit` returning `Err(ConnectorError::Rejected)` means the order was
/// refused before acknowledgement; post-ack rejections arrive as
/// `ExecutionEvent::Rejected` on the shared channel. The execution manager
/// cannot tell paper from live through this interface.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit(&self, order: &Order) -> Result<(), ConnectorError>;

    async fn cancel(&self, symbol: &str, client_order_id: &str) -> Result<(), ConnectorError>;
}
