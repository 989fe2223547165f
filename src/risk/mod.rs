//! Risk management: position tracking, pre-trade checks, funding accrual.

mod manager;
mod position;

pub use manager::{OrderRequest, RiskManager, Verdict, VetoReason};
pub use position::{CloseResult, Position, PositionBook};
