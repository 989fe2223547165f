//! In-memory market state fed by the WebSocket streams.

mod cache;

pub use cache::{BookSnapshot, FundingSnapshot, MarketCache};
