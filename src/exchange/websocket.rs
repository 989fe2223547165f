//! Binance WebSocket streams for market data and user order updates.

use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const FUTURES_WS_URL: &str = "wss://fstream.binance.com";
const FUTURES_TESTNET_WS_URL: &str = "wss://stream.binancefuture.com";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Binance pings every few minutes; a connection silent past this bound
/// is treated as dead (half-open TCP) and torn down for reconnect.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Market data event delivered over the stream channel.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    /// Mark price / funding rate update
    MarkPrice(MarkPriceUpdate),
    /// Book ticker update (best bid/ask)
    BookTicker(BookTickerUpdate),
    /// Connection established
    Connected,
    /// Connection lost, reconnect in progress
    Disconnected,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkPriceUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub mark_price: Decimal,
    #[serde(rename = "r", with = "rust_decimal::serde::str")]
    pub funding_rate: Decimal,
    #[serde(rename = "T")]
    pub next_funding_time: i64,
    #[serde(rename = "E")]
    pub event_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b", with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(rename = "B", with = "rust_decimal::serde::str")]
    pub bid_qty: Decimal,
    #[serde(rename = "a", with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
    #[serde(rename = "A", with = "rust_decimal::serde::str")]
    pub ask_qty: Decimal,
    #[serde(rename = "E", default)]
    pub event_time: i64,
}

/// Order update from the user data stream (ORDER_TRADE_UPDATE).
#[derive(Debug, Clone, Deserialize)]
pub struct OrderTradeUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "x")]
    pub execution_type: String,
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub last_filled_qty: Decimal,
    #[serde(rename = "L", with = "rust_decimal::serde::str")]
    pub last_filled_price: Decimal,
    #[serde(rename = "z", with = "rust_decimal::serde::str")]
    pub cumulative_filled_qty: Decimal,
    #[serde(rename = "n", default, with = "rust_decimal::serde::str_option")]
    pub commission: Option<Decimal>,
    #[serde(rename = "i")]
    pub order_id: i64,
}

/// Envelope for combined-stream frames.
#[derive(Debug, Deserialize)]
struct CombinedFrame {
    stream: String,
    data: serde_json::Value,
}

/// Envelope for user data stream frames.
#[derive(Debug, Deserialize)]
struct UserFrame {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "o", default)]
    order: Option<serde_json::Value>,
}

fn ws_base_url(testnet: bool) -> &'static str {
    if testnet {
        FUTURES_TESTNET_WS_URL
    } else {
        FUTURES_WS_URL
    }
}

/// Market data stream over a combined WebSocket connection.
///
/// One connection carries `<symbol>@bookTicker` and `<symbol>@markPrice@1s`
/// for every configured symbol. The spawned task reconnects with capped
/// exponential backoff and runs until the receiving side is dropped.
pub struct MarketStream {
    base_url: String,
    symbols: Vec<String>,
}

impl MarketStream {
    pub fn new(testnet: bool, symbols: Vec<String>) -> Self {
        Self {
            base_url: ws_base_url(testnet).to_string(),
            symbols,
        }
    }

    #[cfg(test)]
    fn with_base_url(base_url: String, symbols: Vec<String>) -> Self {
        Self { base_url, symbols }
    }

    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                [
                    format!("{}@bookTicker", lower),
                    format!("{}@markPrice@1s", lower),
                ]
            })
            .collect();

        format!("{}/stream?streams={}", self.base_url, streams.join("/"))
    }

    /// Spawn the ingest task. Events flow into `tx` until it is closed.
    pub fn spawn(self, tx: mpsc::Sender<MarketEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let url = self.stream_url();
            let mut backoff = INITIAL_BACKOFF;

            loop {
                info!("Connecting to market stream: {}", url);

                match connect_async(&url).await {
                    Ok((ws_stream, _)) => {
                        backoff = INITIAL_BACKOFF;
                        if tx.send(MarketEvent::Connected).await.is_err() {
                            return;
                        }

                        let (_write, mut read) = ws_stream.split();
                        loop {
                            let msg = match tokio::time::timeout(IDLE_TIMEOUT, read.next()).await
                            {
                                Ok(Some(msg)) => msg,
                                Ok(None) => break,
                                Err(_) => {
                                    warn!(
                                        "Market stream idle for {:?}, reconnecting",
                                        IDLE_TIMEOUT
                                    );
                                    break;
                                }
                            };
                            match msg {
                                Ok(Message::Text(text)) => {
                                    for event in parse_market_frame(&text) {
                                        if tx.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok(Message::Ping(_)) => {
                                    debug!("Received ping");
                                }
                                Ok(Message::Close(_)) => {
                                    info!("Market stream closed by server");
                                    break;
                                }
                                Err(e) => {
                                    error!("Market stream error: {}", e);
                                    break;
                                }
                                _ => {}
                            }
                        }

                        if tx.send(MarketEvent::Disconnected).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Market stream connect failed: {}", e);
                    }
                }

                if tx.is_closed() {
                    return;
                }

                warn!("Reconnecting market stream in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        })
    }
}

/// Parse a combined-stream frame into zero or more market events.
///
/// Malformed frames are logged and skipped; they never tear down the
/// connection.
fn parse_market_frame(text: &str) -> Vec<MarketEvent> {
    let frame: CombinedFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Skipping malformed market frame: {}", e);
            return vec![];
        }
    };

    if frame.stream.ends_with("@bookTicker") {
        match serde_json::from_value::<BookTickerUpdate>(frame.data) {
            Ok(update) => vec![MarketEvent::BookTicker(update)],
            Err(e) => {
                warn!(stream = %frame.stream, "Skipping malformed book ticker: {}", e);
                vec![]
            }
        }
    } else if frame.stream.contains("@markPrice") {
        match serde_json::from_value::<MarkPriceUpdate>(frame.data) {
            Ok(update) => vec![MarketEvent::MarkPrice(update)],
            Err(e) => {
                warn!(stream = %frame.stream, "Skipping malformed mark price: {}", e);
                vec![]
            }
        }
    } else {
        vec![]
    }
}

/// User data stream delivering order updates for live trading.
pub struct UserStream {
    base_url: String,
    listen_key: String,
}

impl UserStream {
    pub fn new(testnet: bool, listen_key: String) -> Self {
        Self {
            base_url: ws_base_url(testnet).to_string(),
            listen_key,
        }
    }

    /// Spawn the user stream task. Order updates flow into `tx` until it
    /// is closed.
    pub fn spawn(self, tx: mpsc::Sender<OrderTradeUpdate>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let url = format!("{}/ws/{}", self.base_url, self.listen_key);
            let mut backoff = INITIAL_BACKOFF;

            loop {
                info!("Connecting to user data stream");

                match connect_async(&url).await {
                    Ok((ws_stream, _)) => {
                        backoff = INITIAL_BACKOFF;
                        let (_write, mut read) = ws_stream.split();

                        loop {
                            let msg = match tokio::time::timeout(IDLE_TIMEOUT, read.next()).await
                            {
                                Ok(Some(msg)) => msg,
                                Ok(None) => break,
                                Err(_) => {
                                    warn!("User stream idle for {:?}, reconnecting", IDLE_TIMEOUT);
                                    break;
                                }
                            };
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Some(update) = parse_user_frame(&text) {
                                        if tx.send(update).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok(Message::Close(_)) => {
                                    info!("User stream closed by server");
                                    break;
                                }
                                Err(e) => {
                                    error!("User stream error: {}", e);
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        error!("User stream connect failed: {}", e);
                    }
                }

                if tx.is_closed() {
                    return;
                }

                warn!("Reconnecting user stream in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        })
    }
}

/// Extract an order update from a user stream frame, ignoring account
/// updates and other event types.
fn parse_user_frame(text: &str) -> Option<OrderTradeUpdate> {
    let frame: UserFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Skipping malformed user frame: {}", e);
            return None;
        }
    };

    if frame.event_type != "ORDER_TRADE_UPDATE" {
        return None;
    }

    match frame.order.map(serde_json::from_value) {
        Some(Ok(update)) => Some(update),
        Some(Err(e)) => {
            warn!("Skipping malformed order update: {}", e);
            None
        }
        None => None,
    }
}
