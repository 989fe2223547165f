//! # Funding Arb
//!
//! Single-leg funding rate capture on Binance USDT-M perpetuals: hold the
//! side of the market that receives the funding payment while the net
//! carry beats round-trip costs, and unwind when it no longer does.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Binance API client (REST + WebSocket)
//! - `market`: Per-symbol cache of funding and book snapshots
//! - `signal`: Carry evaluation and entry/exit signals
//! - `risk`: Position book, sizing, limits, and symbol halts
//! - `execution`: Order state machine, paper/live backends, retries
//! - `ledger`: Append-only SQLite event journal with crash replay
//! - `engine`: The evaluation loop tying everything together
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod engine;
pub mod exchange;
pub mod execution;
pub mod ledger;
pub mod market;
pub mod risk;
pub mod signal;
pub mod utils;

pub use config::Config;
