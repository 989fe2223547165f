//! Pre-trade risk checks, position sizing, and symbol halts.

use crate::config::RiskConfig;
use crate::exchange::{OrderSide, SymbolMeta};
use crate::risk::position::PositionBook;
use crate::signal::Signal;
use crate::utils::decimal::round_down_to_step;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{error, warn};

/// Why a signal was not allowed to proceed.
#[derive(Debug, Clone, PartialEq)]
pub enum VetoReason {
    SymbolHalted { reason: String },
    MaxPositionsReached { limit: u8 },
    SymbolNotionalExceeded { requested: Decimal, limit: Decimal },
    TotalNotionalExceeded { requested: Decimal, limit: Decimal },
    BelowMinNotional { notional: Decimal, floor: Decimal },
    NoPositionToClose,
}

impl std::fmt::Display for VetoReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SymbolHalted { reason } => write!(f, "symbol halted: {}", reason),
            Self::MaxPositionsReached { limit } => {
                write!(f, "max concurrent positions ({}) reached", limit)
            }
            Self::SymbolNotionalExceeded { requested, limit } => {
                write!(f, "symbol notional {} exceeds limit {}", requested, limit)
            }
            Self::TotalNotionalExceeded { requested, limit } => {
                write!(f, "total notional {} exceeds limit {}", requested, limit)
            }
            Self::BelowMinNotional { notional, floor } => {
                write!(f, "notional {} below exchange floor {}", notional, floor)
            }
            Self::NoPositionToClose => write!(f, "no open position for close signal"),
        }
    }
}

/// A sized, approved order ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Price the sizing was computed against, for journaling.
    pub reference_price: Decimal,
    /// True when this order unwinds an existing position.
    pub reduce_only: bool,
}

/// Outcome of a risk review.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approved(OrderRequest),
    Vetoed(VetoReason),
}

/// Risk manager: owns the position book, account equity, and the
/// per-symbol halt and rejection state.
pub struct RiskManager {
    config: RiskConfig,
    book: PositionBook,
    equity: Decimal,
    halted: HashMap<String, String>,
    consecutive_rejections: HashMap<String, u32>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, initial_equity: Decimal) -> Self {
        Self {
            config,
            book: PositionBook::new(),
            equity: initial_equity,
            halted: HashMap::new(),
            consecutive_rejections: HashMap::new(),
        }
    }

    pub fn positions(&self) -> &PositionBook {
        &self.book
    }

    pub fn positions_mut(&mut self) -> &mut PositionBook {
        &mut self.book
    }

    pub fn equity(&self) -> Decimal {
        self.equity
    }

    pub fn set_equity(&mut self, equity: Decimal) {
        self.equity = equity;
    }

    pub fn adjust_equity(&mut self, delta: Decimal) {
        self.equity += delta;
    }

    pub fn is_halted(&self, symbol: &str) -> bool {
        self.halted.contains_key(symbol)
    }

    /// Review an open signal. Pure read of current state: re-reviewing the
    /// same signal against unchanged state returns the same verdict.
    pub fn review_open(&self, signal: &Signal, price: Decimal, meta: &SymbolMeta) -> Verdict {
        if let Some(reason) = self.halted.get(&signal.symbol) {
            return Verdict::Vetoed(VetoReason::SymbolHalted {
                reason: reason.clone(),
            });
        }

        if self.book.get(&signal.symbol).is_none()
            && self.book.len() >= self.config.max_open_positions as usize
        {
            return Verdict::Vetoed(VetoReason::MaxPositionsReached {
                limit: self.config.max_open_positions,
            });
        }

        // Sizing reads only equity and config, never the signal's
        // annotations.
        let target_notional = self.config.risk_per_trade_pct * self.equity;
        let quantity = round_down_to_step(target_notional / price, meta.step_size);
        let notional = quantity * price;

        let min_notional = self.config.min_order_notional.max(meta.min_notional);
        if quantity < meta.min_qty || notional < min_notional {
            return Verdict::Vetoed(VetoReason::BelowMinNotional {
                notional,
                floor: min_notional,
            });
        }

        let symbol_notional = self
            .book
            .get(&signal.symbol)
            .map(|p| p.notional(p.entry_price))
            .unwrap_or(Decimal::ZERO)
            + notional;
        if symbol_notional > self.config.max_symbol_notional {
            return Verdict::Vetoed(VetoReason::SymbolNotionalExceeded {
                requested: symbol_notional,
                limit: self.config.max_symbol_notional,
            });
        }

        let total_notional = self.book.total_notional() + notional;
        if total_notional > self.config.max_total_notional {
            return Verdict::Vetoed(VetoReason::TotalNotionalExceeded {
                requested: total_notional,
                limit: self.config.max_total_notional,
            });
        }

        Verdict::Approved(OrderRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity,
            reference_price: price,
            reduce_only: false,
        })
    }

    /// Review a close signal. Closes are sized to the full held quantity.
    pub fn review_close(&self, signal: &Signal, price: Decimal) -> Verdict {
        if let Some(reason) = self.halted.get(&signal.symbol) {
            return Verdict::Vetoed(VetoReason::SymbolHalted {
                reason: reason.clone(),
            });
        }

        match self.book.get(&signal.symbol) {
            Some(position) => Verdict::Approved(OrderRequest {
                symbol: signal.symbol.clone(),
                side: position.side.opposite(),
                quantity: position.quantity,
                reference_price: price,
                reduce_only: true,
            }),
            None => Verdict::Vetoed(VetoReason::NoPositionToClose),
        }
    }

    /// Halt a symbol until manual review.
    pub fn halt_symbol(&mut self, symbol: &str, reason: impl Into<String>) {
        let reason = reason.into();
        error!("⛔ Trading halted for {}: {}", symbol, reason);
        self.halted.insert(symbol.to_string(), reason);
    }

    /// Count a rejected order. Returns true when the consecutive-rejection
    /// threshold was crossed and the symbol is now halted.
    pub fn record_rejection(&mut self, symbol: &str) -> bool {
        let count = self
            .consecutive_rejections
            .entry(symbol.to_string())
            .or_insert(0);
        *count += 1;

        if *count >= self.config.max_consecutive_rejections {
            let reason = format!("{} consecutive order rejections", count);
            warn!(symbol, count, "Rejection threshold crossed");
            self.halt_symbol(symbol, reason);
            true
        } else {
            false
        }
    }

    /// Reset the rejection streak after a successful order.
    pub fn record_success(&mut self, symbol: &str) {
        self.consecutive_rejections.remove(symbol);
    }

    /// Apply a funding settlement to the held position, if any.
    ///
    /// Returns the accrual amount, or `None` when there is no position or
    /// this settlement was already applied.
    pub fn apply_funding(
        &mut self,
        symbol: &str,
        rate: Decimal,
        mark_price: Decimal,
        settlement_time: DateTime<Utc>,
    ) -> Option<Decimal> {
        let position = self.book.get_mut(symbol)?;
        let accrual = position.apply_funding(rate, mark_price, settlement_time)?;
        self.equity += accrual;
        Some(accrual)
    }
}
