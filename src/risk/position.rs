//! Position state and the book of open positions.

use crate::exchange::OrderSide;
use crate::utils::decimal::weighted_average;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// A single open position in one symbol.
///
/// Quantity is always positive; direction lives in `side`. The signed
/// quantity convention (Buy positive, Sell negative) is used for PnL and
/// funding accrual.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub funding_received: Decimal,
    /// Settlement timestamp of the last funding accrual, for dedup.
    pub last_settlement_applied: Option<DateTime<Utc>>,
}

impl Position {
    pub fn new(
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        entry_price: Decimal,
        fee: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol,
            side,
            quantity,
            entry_price,
            opened_at,
            realized_pnl: Decimal::ZERO,
            fees_paid: fee,
            funding_received: Decimal::ZERO,
            last_settlement_applied: None,
        }
    }

    /// Signed quantity: Buy positive, Sell negative.
    pub fn signed_quantity(&self) -> Decimal {
        self.side.sign() * self.quantity
    }

    /// Notional value at the given price.
    pub fn notional(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }

    /// Mark-to-market PnL excluding fees and funding.
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        (mark_price - self.entry_price) * self.signed_quantity()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.opened_at)
    }

    /// Apply a funding settlement.
    ///
    /// Accrual is `-signed_qty * mark * rate`: a short receives positive
    /// funding, a long pays it. Returns `None` when this settlement was
    /// already applied, so rollover detection can fire twice without
    /// double-counting.
    pub fn apply_funding(
        &mut self,
        rate: Decimal,
        mark_price: Decimal,
        settlement_time: DateTime<Utc>,
    ) -> Option<Decimal> {
        if self.last_settlement_applied == Some(settlement_time) {
            return None;
        }

        let accrual = -self.signed_quantity() * mark_price * rate;
        self.funding_received += accrual;
        self.last_settlement_applied = Some(settlement_time);
        Some(accrual)
    }
}

/// Outcome of a position-reducing fill.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseResult {
    pub realized_pnl: Decimal,
    pub fully_closed: bool,
    /// The position as it was removed from the book, when fully closed.
    pub closed_position: Option<Position>,
}

/// All open positions, keyed by symbol. At most one position per symbol.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<String, Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Aggregate notional at entry prices.
    pub fn total_notional(&self) -> Decimal {
        self.positions
            .values()
            .map(|p| p.notional(p.entry_price))
            .sum()
    }

    /// Record a fill that opens or grows a position.
    ///
    /// Entry price is the quantity-weighted average across fills.
    pub fn apply_open_fill(
        &mut self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> &Position {
        match self.positions.get_mut(symbol) {
            Some(position) => {
                position.entry_price = weighted_average(&[
                    (position.entry_price, position.quantity),
                    (price, quantity),
                ]);
                position.quantity += quantity;
                position.fees_paid += fee;
            }
            None => {
                self.positions.insert(
                    symbol.to_string(),
                    Position::new(symbol.to_string(), side, quantity, price, fee, now),
                );
            }
        }
        &self.positions[symbol]
    }

    /// Record a fill that reduces or closes a position.
    ///
    /// Returns the realized PnL of the reduced quantity. The position is
    /// removed from the book once its quantity reaches zero.
    pub fn apply_close_fill(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> Option<CloseResult> {
        let position = self.positions.get_mut(symbol)?;

        let reduced = quantity.min(position.quantity);
        let realized = (price - position.entry_price) * position.side.sign() * reduced;

        position.quantity -= reduced;
        position.realized_pnl += realized;
        position.fees_paid += fee;

        if position.quantity == Decimal::ZERO {
            let closed = self.positions.remove(symbol);
            Some(CloseResult {
                realized_pnl: realized,
                fully_closed: true,
                closed_position: closed,
            })
        } else {
            Some(CloseResult {
                realized_pnl: realized,
                fully_closed: false,
                closed_position: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_open_fills_average_entry_price() {
        let mut book = PositionBook::new();
        book.apply_open_fill("BTCUSDT", OrderSide::Buy, dec!(4), dec!(100), dec!(0.1), ts());
        let position =
            book.apply_open_fill("BTCUSDT", OrderSide::Buy, dec!(6), dec!(101), dec!(0.1), ts());

        assert_eq!(position.quantity, dec!(10));
        assert_eq!(position.entry_price, dec!(100.6));
        assert_eq!(position.fees_paid, dec!(0.2));
    }

    #[test]
    fn test_short_position_pnl_signs() {
        let mut book = PositionBook::new();
        book.apply_open_fill("BTCUSDT", OrderSide::Sell, dec!(2), dec!(100), dec!(0), ts());

        let position = book.get("BTCUSDT").unwrap();
        assert_eq!(position.signed_quantity(), dec!(-2));
        // Price dropping is profit for a short
        assert_eq!(position.unrealized_pnl(dec!(90)), dec!(20));
        assert_eq!(position.unrealized_pnl(dec!(110)), dec!(-20));
    }

    #[test]
    fn test_close_fill_realizes_pnl_and_removes() {
        let mut book = PositionBook::new();
        book.apply_open_fill("BTCUSDT", OrderSide::Sell, dec!(2), dec!(100), dec!(0), ts());

        let partial = book
            .apply_close_fill("BTCUSDT", dec!(1), dec!(95), dec!(0.05))
            .unwrap();
        assert_eq!(partial.realized_pnl, dec!(5));
        assert!(!partial.fully_closed);
        assert_eq!(book.get("BTCUSDT").unwrap().quantity, dec!(1));

        let full = book
            .apply_close_fill("BTCUSDT", dec!(1), dec!(90), dec!(0.05))
            .unwrap();
        assert_eq!(full.realized_pnl, dec!(10));
        assert!(full.fully_closed);
        assert!(book.get("BTCUSDT").is_none());

        let closed = full.closed_position.unwrap();
        assert_eq!(closed.realized_pnl, dec!(15));
        assert_eq!(closed.fees_paid, dec!(0.1));
    }

    #[test]
    fn test_funding_accrual_short_receives_positive_rate() {
        let mut position = Position::new(
            "BTCUSDT".to_string(),
            OrderSide::Sell,
            dec!(2),
            dec!(100),
            Decimal::ZERO,
            ts(),
        );

        let settlement = ts() + Duration::hours(8);
        let accrual = position
            .apply_funding(dec!(0.0001), dec!(100), settlement)
            .unwrap();
        // -(-2) * 100 * 0.0001 = +0.02
        assert_eq!(accrual, dec!(0.02));
        assert_eq!(position.funding_received, dec!(0.02));
    }

    #[test]
    fn test_funding_accrual_deduplicates_settlement() {
        let mut position = Position::new(
            "BTCUSDT".to_string(),
            OrderSide::Sell,
            dec!(2),
            dec!(100),
            Decimal::ZERO,
            ts(),
        );

        let settlement = ts() + Duration::hours(8);
        assert!(position
            .apply_funding(dec!(0.0001), dec!(100), settlement)
            .is_some());
        assert!(position
            .apply_funding(dec!(0.0001), dec!(100), settlement)
            .is_none());
        assert_eq!(position.funding_received, dec!(0.02));

        // A later settlement accrues again
        assert!(position
            .apply_funding(dec!(0.0001), dec!(100), settlement + Duration::hours(8))
            .is_some());
    }

    #[test]
    fn test_long_position_pays_positive_funding() {
        let mut position = Position::new(
            "ETHUSDT".to_string(),
            OrderSide::Buy,
            dec!(1),
            dec!(3000),
            Decimal::ZERO,
            ts(),
        );

        let accrual = position
            .apply_funding(dec!(0.0001), dec!(3000), ts() + Duration::hours(8))
            .unwrap();
        assert_eq!(accrual, dec!(-0.3));
    }

    #[test]
    fn test_total_notional_sums_entry_values() {
        let mut book = PositionBook::new();
        book.apply_open_fill("BTCUSDT", OrderSide::Sell, dec!(0.01), dec!(50000), dec!(0), ts());
        book.apply_open_fill("ETHUSDT", OrderSide::Sell, dec!(0.5), dec!(3000), dec!(0), ts());

        assert_eq!(book.total_notional(), dec!(2000));
        assert_eq!(book.len(), 2);
    }
}
