//! Order lifecycle state machine.

use crate::exchange::{ConnectorError, OrderSide};
use crate::utils::decimal::weighted_average;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while driving an order through its lifecycle.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("invalid order state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: OrderState, to: OrderState },

    #[error("fill overflow on {symbol}: order for {requested}, fills total {attempted}")]
    FillOverflow {
        symbol: String,
        requested: Decimal,
        attempted: Decimal,
    },

    #[error("order retries exhausted after {attempts} attempts for {symbol}")]
    RetriesExhausted { symbol: String, attempts: u32 },

    #[error("backend error: {0}")]
    Backend(#[from] ConnectorError),

    #[error("execution channel closed")]
    ChannelClosed,
}

/// Order states. FILLED, CANCELLED, and REJECTED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// States reachable from this one. Re-entering PartiallyFilled covers
    /// successive partial fills.
    pub fn valid_transitions(&self) -> &'static [OrderState] {
        match self {
            Self::Pending => &[Self::Submitted, Self::Rejected],
            Self::Submitted => &[
                Self::PartiallyFilled,
                Self::Filled,
                Self::Cancelled,
                Self::Rejected,
            ],
            Self::PartiallyFilled => &[Self::PartiallyFilled, Self::Filled, Self::Cancelled],
            Self::Filled | Self::Cancelled | Self::Rejected => &[],
        }
    }

    pub fn can_transition_to(&self, target: OrderState) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

/// Whether an order opens new exposure or unwinds existing exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderIntent {
    Open,
    Close,
}

/// One order being driven to a terminal state.
#[derive(Debug, Clone)]
pub struct Order {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub intent: OrderIntent,
    pub state: OrderState,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Decimal,
    pub fees_paid: Decimal,
    pub created_at: DateTime<Utc>,
    transitions: Vec<(OrderState, DateTime<Utc>)>,
}

impl Order {
    pub fn new(
        client_order_id: String,
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        intent: OrderIntent,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            client_order_id,
            symbol,
            side,
            quantity,
            intent,
            state: OrderState::Pending,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            created_at,
            transitions: vec![(OrderState::Pending, created_at)],
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn transition_history(&self) -> &[(OrderState, DateTime<Utc>)] {
        &self.transitions
    }

    /// Move to a new state, rejecting transitions the state machine does
    /// not allow.
    pub fn transition(&mut self, to: OrderState) -> Result<(), ExecutionError> {
        if !self.state.can_transition_to(to) {
            return Err(ExecutionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.transitions.push((to, Utc::now()));
        Ok(())
    }

    /// Apply one fill. Filled quantity is monotonic; a fill pushing the
    /// total past the requested quantity is an invariant violation.
    ///
    /// Returns the state after the fill (PartiallyFilled or Filled).
    pub fn apply_fill(
        &mut self,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> Result<OrderState, ExecutionError> {
        let total = self.filled_quantity + quantity;
        if total > self.quantity {
            return Err(ExecutionError::FillOverflow {
                symbol: self.symbol.clone(),
                requested: self.quantity,
                attempted: total,
            });
        }

        self.avg_fill_price = weighted_average(&[
            (self.avg_fill_price, self.filled_quantity),
            (price, quantity),
        ]);
        self.filled_quantity = total;
        self.fees_paid += fee;

        let target = if total == self.quantity {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        self.transition(target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_order(quantity: Decimal) -> Order {
        Order::new(
            "farb-1700000000000-1".to_string(),
            "BTCUSDT".to_string(),
            OrderSide::Buy,
            quantity,
            OrderIntent::Open,
        )
    }

    #[test]
    fn test_two_fills_reach_filled_with_weighted_average() {
        let mut order = test_order(dec!(10));
        order.transition(OrderState::Submitted).unwrap();

        let state = order.apply_fill(dec!(4), dec!(100), dec!(0.1)).unwrap();
        assert_eq!(state, OrderState::PartiallyFilled);

        let state = order.apply_fill(dec!(6), dec!(101), dec!(0.1)).unwrap();
        assert_eq!(state, OrderState::Filled);

        assert_eq!(order.avg_fill_price, dec!(100.6));
        assert_eq!(order.filled_quantity, dec!(10));
        assert_eq!(order.fees_paid, dec!(0.2));

        let states: Vec<OrderState> =
            order.transition_history().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![
                OrderState::Pending,
                OrderState::Submitted,
                OrderState::PartiallyFilled,
                OrderState::Filled,
            ]
        );
    }

    #[test]
    fn test_fill_overflow_is_an_error() {
        let mut order = test_order(dec!(10));
        order.transition(OrderState::Submitted).unwrap();
        order.apply_fill(dec!(6), dec!(100), dec!(0)).unwrap();

        let err = order.apply_fill(dec!(5), dec!(100), dec!(0)).unwrap_err();
        assert!(matches!(err, ExecutionError::FillOverflow { .. }));
        // State and totals are untouched by the rejected fill
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.filled_quantity, dec!(6));
    }

    #[test]
    fn test_terminal_states_admit_no_transitions() {
        let mut order = test_order(dec!(1));
        order.transition(OrderState::Submitted).unwrap();
        order.transition(OrderState::Filled).unwrap();

        let err = order.transition(OrderState::Cancelled).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidTransition { .. }));
    }

    #[test]
    fn test_pending_can_be_rejected_pre_submit() {
        let mut order = test_order(dec!(1));
        order.transition(OrderState::Rejected).unwrap();
        assert!(order.state.is_terminal());
    }

    #[test]
    fn test_pending_cannot_fill_directly() {
        let mut order = test_order(dec!(1));
        assert!(!order.state.can_transition_to(OrderState::Filled));
        assert!(order.transition(OrderState::Filled).is_err());
    }

    #[test]
    fn test_partial_then_cancel_keeps_fills() {
        let mut order = test_order(dec!(10));
        order.transition(OrderState::Submitted).unwrap();
        order.apply_fill(dec!(4), dec!(100), dec!(0.05)).unwrap();
        order.transition(OrderState::Cancelled).unwrap();

        assert_eq!(order.state, OrderState::Cancelled);
        assert_eq!(order.filled_quantity, dec!(4));
        assert_eq!(order.avg_fill_price, dec!(100));
    }
}
