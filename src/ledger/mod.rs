//! Append-only SQLite event ledger.
//!
//! Every state-changing event gets one row. There are no UPDATE or DELETE
//! paths; crash recovery replays the rows in insertion order to rebuild
//! positions, realized PnL, fees, and funding.

use crate::exchange::OrderSide;
use crate::risk::PositionBook;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{info, warn};

/// Event kinds the ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Signal,
    Veto,
    OrderSubmitted,
    OrderPartialFill,
    OrderFilled,
    OrderCancelled,
    OrderRejected,
    FundingAccrued,
    SessionStarted,
    SessionStopped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Veto => "veto",
            Self::OrderSubmitted => "order_submitted",
            Self::OrderPartialFill => "order_partial_fill",
            Self::OrderFilled => "order_filled",
            Self::OrderCancelled => "order_cancelled",
            Self::OrderRejected => "order_rejected",
            Self::FundingAccrued => "funding_accrued",
            Self::SessionStarted => "session_started",
            Self::SessionStopped => "session_stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal" => Some(Self::Signal),
            "veto" => Some(Self::Veto),
            "order_submitted" => Some(Self::OrderSubmitted),
            "order_partial_fill" => Some(Self::OrderPartialFill),
            "order_filled" => Some(Self::OrderFilled),
            "order_cancelled" => Some(Self::OrderCancelled),
            "order_rejected" => Some(Self::OrderRejected),
            "funding_accrued" => Some(Self::FundingAccrued),
            "session_started" => Some(Self::SessionStarted),
            "session_stopped" => Some(Self::SessionStopped),
            _ => None,
        }
    }
}

/// One ledger row before insertion. Build with the fluent setters; unset
/// fields are stored NULL.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub event: EventKind,
    pub symbol: Option<String>,
    pub client_order_id: Option<String>,
    pub side: Option<OrderSide>,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    /// Fee for fills, accrual for funding events.
    pub amount: Option<Decimal>,
    pub details: Option<serde_json::Value>,
}

impl LedgerEntry {
    pub fn new(event: EventKind) -> Self {
        Self {
            event,
            symbol: None,
            client_order_id: None,
            side: None,
            quantity: None,
            price: None,
            amount: None,
            details: None,
        }
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }

    pub fn side(mut self, side: OrderSide) -> Self {
        self.side = Some(side);
        self
    }

    pub fn quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Account state reconstructed from the ledger.
#[derive(Debug, Default)]
pub struct AccountState {
    pub positions: PositionBook,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub funding_received: Decimal,
}

/// The ledger. Interior mutex because rusqlite connections are `Send` but
/// not `Sync`; appends are short single-row inserts.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (or create) the ledger database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create ledger directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open ledger at {:?}", path.as_ref()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL")?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;

        info!("Ledger opened at {:?}", path.as_ref());
        Ok(ledger)
    }

    /// In-memory ledger for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory ledger")?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                event TEXT NOT NULL,
                symbol TEXT,
                client_order_id TEXT,
                side TEXT,
                quantity TEXT,
                price TEXT,
                amount TEXT,
                details TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_symbol ON ledger_entries(symbol);
            CREATE INDEX IF NOT EXISTS idx_ledger_event ON ledger_entries(event);
            "#,
        )
        .context("Failed to initialize ledger schema")?;
        Ok(())
    }

    /// Append one entry. Returns the row id.
    pub fn append(&self, entry: &LedgerEntry) -> Result<i64> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO ledger_entries
                (ts, event, symbol, client_order_id, side, quantity, price, amount, details)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                Utc::now().to_rfc3339(),
                entry.event.as_str(),
                entry.symbol,
                entry.client_order_id,
                entry.side.map(|s| s.to_string()),
                entry.quantity.map(|d| d.to_string()),
                entry.price.map(|d| d.to_string()),
                entry.amount.map(|d| d.to_string()),
                entry
                    .details
                    .as_ref()
                    .map(|d| d.to_string()),
            ],
        )
        .context("Failed to append ledger entry")?;

        Ok(conn.last_insert_rowid())
    }

    /// Number of entries, for the status report.
    pub fn entry_count(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let count: u64 = conn
            .query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))
            .context("Failed to count ledger entries")?;
        Ok(count)
    }

    /// Replay all entries in insertion order to rebuild account state.
    ///
    /// Fill entries are folded into the position book by intent (open
    /// fills grow positions, close fills realize PnL); funding accruals
    /// are re-applied to open positions. Replaying any prefix of the
    /// ledger yields a consistent state.
    pub fn replay(&self) -> Result<AccountState> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn
            .prepare(
                r#"
                SELECT ts, event, symbol, side, quantity, price, amount, details
                FROM ledger_entries
                ORDER BY id ASC
                "#,
            )
            .context("Failed to prepare replay query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .context("Failed to query ledger entries")?;

        let mut state = AccountState::default();

        for row in rows {
            let (ts, event, symbol, side, quantity, price, amount, details) =
                row.context("Failed to read ledger row")?;

            let Some(event) = EventKind::parse(&event) else {
                warn!(event, "Skipping unknown ledger event kind");
                continue;
            };

            match event {
                EventKind::OrderPartialFill | EventKind::OrderFilled => {
                    let (Some(symbol), Some(side), Some(quantity), Some(price)) =
                        (symbol, side, quantity, price)
                    else {
                        warn!("Skipping fill entry with missing fields");
                        continue;
                    };

                    let side = match side.as_str() {
                        "BUY" => OrderSide::Buy,
                        "SELL" => OrderSide::Sell,
                        other => {
                            warn!(side = other, "Skipping fill with unknown side");
                            continue;
                        }
                    };
                    let quantity = Decimal::from_str(&quantity).unwrap_or(Decimal::ZERO);
                    let price = Decimal::from_str(&price).unwrap_or(Decimal::ZERO);
                    let fee = amount
                        .and_then(|a| Decimal::from_str(&a).ok())
                        .unwrap_or(Decimal::ZERO);
                    let intent = details
                        .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok())
                        .and_then(|d| d.get("intent").and_then(|i| i.as_str().map(String::from)))
                        .unwrap_or_else(|| "open".to_string());
                    let at = DateTime::parse_from_rfc3339(&ts)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now());

                    state.fees_paid += fee;

                    if intent == "close" {
                        if let Some(result) =
                            state.positions.apply_close_fill(&symbol, quantity, price, fee)
                        {
                            state.realized_pnl += result.realized_pnl;
                        } else {
                            warn!(symbol, "Close fill in ledger without open position");
                        }
                    } else {
                        state
                            .positions
                            .apply_open_fill(&symbol, side, quantity, price, fee, at);
                    }
                }
                EventKind::FundingAccrued => {
                    let accrual = amount
                        .and_then(|a| Decimal::from_str(&a).ok())
                        .unwrap_or(Decimal::ZERO);
                    state.funding_received += accrual;
                    if let Some(symbol) = symbol {
                        if let Some(position) = state.positions.get_mut(&symbol) {
                            position.funding_received += accrual;
                        }
                    }
                }
                // Signals, vetoes, submissions, and session markers carry
                // no account state.
                _ => {}
            }
        }

        Ok(state)
    }
}
