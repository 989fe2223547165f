//! Binance USDT-M futures connectivity.
//!
//! Provides REST and WebSocket access for:
//! - Market data (premium index, best bid/ask, symbol filters)
//! - Order operations (place, cancel, query)
//! - User data streams (order updates for live fills)

mod client;
mod error;
mod types;
mod websocket;

pub use client::BinanceClient;
pub use error::ConnectorError;
pub use types::*;
pub use websocket::{
    BookTickerUpdate, MarkPriceUpdate, MarketEvent, MarketStream, OrderTradeUpdate, UserStream,
};
