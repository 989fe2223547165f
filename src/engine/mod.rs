//! The trading engine: wires market data, signals, risk, and execution
//! together and drives the periodic evaluation loop.

use crate::config::{Config, ModeConfig};
use crate::exchange::{BinanceClient, ConnectorError, SymbolMeta};
use crate::execution::{
    ExecutionError, ExecutionManager, ExecutionOutcome, LiveBackend, OrderIntent, PaperBackend,
    PaperConfig,
};
use crate::ledger::{AccountState, EventKind, Ledger, LedgerEntry};
use crate::market::MarketCache;
use crate::risk::{OrderRequest, RiskManager, Verdict};
use crate::signal::{evaluate, Evaluation, RateHistory, Signal};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How orders reach the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    /// Simulated fills against live market data. No orders leave the
    /// process.
    Paper,
    /// Real orders against the exchange.
    Live,
}

impl TradingMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "paper" => Ok(Self::Paper),
            "live" => Ok(Self::Live),
            other => bail!("unknown trading mode {:?} (expected paper or live)", other),
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Live mode needs a second, explicit confirmation on top of the mode
/// itself. A config typo must never start trading real money.
fn ensure_live_confirmed(mode: TradingMode, config: &ModeConfig) -> Result<()> {
    if mode == TradingMode::Live && !config.confirm_live {
        bail!("live mode requires confirm_live=true (or --confirm-live)");
    }
    Ok(())
}

/// Starting equity from replayed ledger state. Paper mode resumes where
/// the last session left off.
fn seed_equity(initial: Decimal, state: &AccountState) -> Decimal {
    initial + state.realized_pnl - state.fees_paid + state.funding_received
}

/// Last funding observation for a symbol. Kept so a settlement accrues
/// at the rate that was in force for the interval that just closed, not
/// the next interval's predicted rate published after the rollover.
#[derive(Debug, Clone, Copy)]
struct FundingMemo {
    next_funding_time: DateTime<Utc>,
    rate: Decimal,
    mark_price: Decimal,
}

/// Settlement rollover detection: when the advertised next funding time
/// moves forward, the previously observed interval has settled at its
/// last seen rate and mark price.
fn settlement_rolled(previous: Option<&FundingMemo>, current: DateTime<Utc>) -> Option<FundingMemo> {
    match previous {
        Some(prev) if current > prev.next_funding_time => Some(*prev),
        _ => None,
    }
}

/// Errors that must abort the whole session instead of skipping one
/// tick. Invalid credentials cannot recover on retry and every further
/// order attempt would fail the same way.
fn is_fatal(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<ExecutionError>(),
        Some(ExecutionError::Backend(ConnectorError::AuthFailure(_)))
    )
}

/// Running totals for the periodic summary.
#[derive(Debug, Default)]
struct SessionStats {
    ticks: u64,
    signals: u64,
    vetoes: u64,
    orders_filled: u64,
    orders_rejected: u64,
    funding_accrued: Decimal,
}

pub struct Engine {
    config: Config,
    mode: TradingMode,
    cache: Arc<MarketCache>,
    metas: HashMap<String, SymbolMeta>,
    ledger: Arc<Ledger>,
    execution: Arc<ExecutionManager>,
    risk: RiskManager,
    histories: HashMap<String, RateHistory>,
    last_funding_seen: HashMap<String, FundingMemo>,
    stats: SessionStats,
    started_at: DateTime<Utc>,
}

impl Engine {
    /// Build the full stack and run until ctrl-c.
    pub async fn run(config: Config, mode: TradingMode) -> Result<()> {
        config.validate()?;
        ensure_live_confirmed(mode, &config.mode)?;

        let ledger = Arc::new(Ledger::open(&config.execution.ledger_path)?);
        let replayed = ledger.replay()?;
        info!(
            "📂 Ledger replay: {} open positions, realized {:.4}, funding {:.4}",
            replayed.positions.len(),
            replayed.realized_pnl,
            replayed.funding_received
        );

        let mut risk = RiskManager::new(
            config.risk.clone(),
            seed_equity(config.trading.initial_equity, &replayed),
        );
        *risk.positions_mut() = replayed.positions;

        let client = Arc::new(
            BinanceClient::new(&config.binance).context("Failed to create exchange client")?,
        );

        // Symbol filters come from the exchange in both modes; the paper
        // backend enforces the same tick, step, and notional floors as live.
        let exchange_info = client
            .get_exchange_info()
            .await
            .context("Failed to load exchange info")?;
        let metas: HashMap<String, SymbolMeta> = exchange_info
            .symbols
            .iter()
            .filter(|s| config.trading.symbols.contains(&s.symbol))
            .map(|s| (s.symbol.clone(), SymbolMeta::from_info(s)))
            .collect();
        for symbol in &config.trading.symbols {
            if !metas.contains_key(symbol) {
                warn!(%symbol, "Symbol missing from exchange info, skipping it");
            }
        }
        info!("✅ Exchange info loaded for {} symbols", metas.len());

        if mode == TradingMode::Live {
            match client.get_account_balance().await {
                Ok(balances) => {
                    if let Some(usdt) = balances.iter().find(|b| b.asset == "USDT") {
                        info!("💰 Live equity from exchange: {}", usdt.wallet_balance);
                        risk.set_equity(usdt.wallet_balance);
                    }
                }
                Err(e) => warn!("Balance fetch failed, keeping replayed equity: {}", e),
            }
        }

        let cache = Arc::new(MarketCache::new());
        let (market_tx, market_rx) = mpsc::channel(1024);
        let _market_task =
            crate::exchange::MarketStream::new(config.binance.testnet, config.trading.symbols.clone())
                .spawn(market_tx);
        let _ingest_task = cache.spawn_ingest(market_rx);

        let (exec_tx, exec_rx) = mpsc::channel(256);
        let backend: Arc<dyn crate::execution::ExecutionBackend> = match mode {
            TradingMode::Paper => Arc::new(PaperBackend::new(
                Arc::clone(&cache),
                metas.clone(),
                PaperConfig {
                    slippage: config.execution.paper_slippage,
                    taker_fee_rate: config.trading.taker_fee_rate,
                    freshness_secs: config.trading.freshness_secs,
                },
                exec_tx.clone(),
            )),
            TradingMode::Live => {
                let listen_key = client
                    .create_listen_key()
                    .await
                    .context("Failed to create user stream listen key")?;
                let (user_tx, user_rx) = mpsc::channel(256);
                let _user_task = crate::exchange::UserStream::new(config.binance.testnet, listen_key)
                    .spawn(user_tx);
                let _bridge_task = LiveBackend::spawn_user_stream_bridge(exec_tx.clone(), user_rx);
                let _keepalive_task = LiveBackend::spawn_listen_key_keepalive(Arc::clone(&client));
                Arc::new(LiveBackend::new(Arc::clone(&client), exec_tx.clone()))
            }
        };

        let execution = Arc::new(ExecutionManager::new(
            backend,
            Arc::clone(&ledger),
            config.execution.clone(),
        ));
        let _dispatcher_task = execution.spawn_dispatcher(exec_rx);

        ledger.append(
            &LedgerEntry::new(EventKind::SessionStarted)
                .details(serde_json::json!({ "mode": mode.to_string() })),
        )?;

        let history_len = config.trading.rate_history_len;
        let histories = config
            .trading
            .symbols
            .iter()
            .map(|s| (s.clone(), RateHistory::new(history_len)))
            .collect();

        let mut engine = Self {
            config,
            mode,
            cache,
            metas,
            ledger,
            execution,
            risk,
            histories,
            last_funding_seen: HashMap::new(),
            stats: SessionStats::default(),
            started_at: Utc::now(),
        };

        engine.main_loop().await
    }

    async fn main_loop(&mut self) -> Result<()> {
        info!(
            "🚀 Engine started in {} mode, evaluating every {}s",
            self.mode, self.config.trading.check_interval_secs
        );

        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.trading.check_interval_secs,
        ));
        let mut last_summary = Utc::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("🚨 Fatal error, aborting session: {}", e);
                        self.shutdown()?;
                        return Err(e);
                    }
                    if Utc::now().signed_duration_since(last_summary) >= ChronoDuration::hours(1) {
                        self.log_summary();
                        last_summary = Utc::now();
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        self.ledger.append(
            &LedgerEntry::new(EventKind::SessionStopped)
                .details(serde_json::json!({ "mode": self.mode.to_string() })),
        )?;
        self.log_summary();
        info!("👋 Session closed cleanly");
        Ok(())
    }

    /// One evaluation pass over all configured symbols. Symbols are
    /// processed sequentially; per-symbol work happens under the symbol's
    /// execution lock so a slow order cannot race a later tick. Fatal
    /// errors propagate; anything else skips the symbol for this tick.
    async fn tick(&mut self) -> Result<()> {
        self.stats.ticks += 1;
        let symbols = self.config.trading.symbols.clone();

        for symbol in &symbols {
            if !self.metas.contains_key(symbol) {
                continue;
            }
            if let Err(e) = self.tick_symbol(symbol).await {
                if is_fatal(&e) {
                    return Err(e);
                }
                error!(%symbol, "Tick failed: {}", e);
            }
        }
        Ok(())
    }

    async fn tick_symbol(&mut self, symbol: &str) -> Result<()> {
        let now = Utc::now();

        let (evaluation, reference_price) = {
            let lock = self.execution.symbol_lock(symbol);
            let _guard = lock.lock().await;

            let Some(funding) = self.cache.funding(symbol).await else {
                debug!(symbol, "No funding data yet");
                return Ok(());
            };
            let Some(book) = self.cache.book(symbol).await else {
                debug!(symbol, "No book data yet");
                return Ok(());
            };

            self.apply_settlement(symbol, &funding)?;

            let history = self
                .histories
                .entry(symbol.to_string())
                .or_insert_with(|| RateHistory::new(self.config.trading.rate_history_len));
            history.push(funding.rate);

            let evaluation = evaluate(
                &funding,
                &book,
                self.risk.positions().get(symbol),
                history,
                &self.config.trading,
                now,
            );
            (evaluation, book.mid_price())
        };
        // The guard is dropped here: execute() takes the same lock
        // internally.

        match evaluation {
            Evaluation::Stale => {
                debug!(symbol, "Market data stale, skipping");
                Ok(())
            }
            Evaluation::Hold(reason) => {
                debug!(symbol, "Hold: {}", reason);
                Ok(())
            }
            Evaluation::Open(signal) => {
                self.journal_signal(&signal);
                let meta = self.metas.get(&signal.symbol).cloned();
                let Some(meta) = meta else { return Ok(()) };
                let verdict = self.risk.review_open(&signal, reference_price, &meta);
                self.act_on_verdict(&signal, verdict, OrderIntent::Open).await
            }
            Evaluation::Close(signal) => {
                self.journal_signal(&signal);
                let verdict = self.risk.review_close(&signal, reference_price);
                self.act_on_verdict(&signal, verdict, OrderIntent::Close).await
            }
        }
    }

    /// Apply a funding accrual when the advertised next settlement time
    /// has rolled forward since the last observation.
    fn apply_settlement(
        &mut self,
        symbol: &str,
        funding: &crate::market::FundingSnapshot,
    ) -> Result<()> {
        let previous = self.last_funding_seen.get(symbol).copied();
        self.last_funding_seen.insert(
            symbol.to_string(),
            FundingMemo {
                next_funding_time: funding.next_funding_time,
                rate: funding.rate,
                mark_price: funding.mark_price,
            },
        );

        let Some(settled) = settlement_rolled(previous.as_ref(), funding.next_funding_time) else {
            return Ok(());
        };

        let Some(accrual) = self.risk.apply_funding(
            symbol,
            settled.rate,
            settled.mark_price,
            settled.next_funding_time,
        ) else {
            return Ok(());
        };

        info!(
            symbol,
            rate = %settled.rate,
            "💸 Funding accrued: {:.6}",
            accrual
        );
        self.stats.funding_accrued += accrual;
        self.ledger.append(
            &LedgerEntry::new(EventKind::FundingAccrued)
                .symbol(symbol)
                .price(settled.mark_price)
                .amount(accrual)
                .details(serde_json::json!({
                    "rate": settled.rate.to_string(),
                    "settled_at": settled.next_funding_time.to_rfc3339(),
                })),
        )?;
        Ok(())
    }

    async fn act_on_verdict(
        &mut self,
        signal: &Signal,
        verdict: Verdict,
        intent: OrderIntent,
    ) -> Result<()> {
        match verdict {
            Verdict::Vetoed(reason) => {
                info!(symbol = %signal.symbol, "🚫 Signal vetoed: {}", reason);
                self.stats.vetoes += 1;
                self.ledger.append(
                    &LedgerEntry::new(EventKind::Veto)
                        .symbol(&signal.symbol)
                        .side(signal.side)
                        .details(serde_json::json!({ "reason": reason.to_string() })),
                )?;
                Ok(())
            }
            Verdict::Approved(request) => self.execute_approved(&request, intent).await,
        }
    }

    async fn execute_approved(
        &mut self,
        request: &OrderRequest,
        intent: OrderIntent,
    ) -> Result<()> {
        info!(
            symbol = %request.symbol,
            side = %request.side,
            quantity = %request.quantity,
            "📤 Executing {:?} order",
            intent
        );

        let outcome = match self.execution.execute(request, intent).await {
            Ok(outcome) => outcome,
            Err(e @ ExecutionError::FillOverflow { .. }) => {
                self.risk
                    .halt_symbol(&request.symbol, format!("invariant violation: {}", e));
                return Ok(());
            }
            Err(e @ ExecutionError::Backend(ConnectorError::AuthFailure(_))) => {
                error!(symbol = %request.symbol, "🚨 Credentials rejected: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                error!(symbol = %request.symbol, "Execution failed: {}", e);
                return Ok(());
            }
        };

        self.apply_outcome(&outcome, intent);
        Ok(())
    }

    /// Fold an execution outcome into the position book and equity.
    fn apply_outcome(&mut self, outcome: &ExecutionOutcome, intent: OrderIntent) {
        if outcome.filled_quantity > Decimal::ZERO {
            match intent {
                OrderIntent::Open => {
                    self.risk.positions_mut().apply_open_fill(
                        &outcome.symbol,
                        outcome.side,
                        outcome.filled_quantity,
                        outcome.avg_fill_price,
                        outcome.fees_paid,
                        Utc::now(),
                    );
                    self.risk.adjust_equity(-outcome.fees_paid);
                    info!(
                        symbol = %outcome.symbol,
                        "✅ Opened {} {} @ {}",
                        outcome.side,
                        outcome.filled_quantity,
                        outcome.avg_fill_price
                    );
                }
                OrderIntent::Close => {
                    match self.risk.positions_mut().apply_close_fill(
                        &outcome.symbol,
                        outcome.filled_quantity,
                        outcome.avg_fill_price,
                        outcome.fees_paid,
                    ) {
                        Some(result) => {
                            self.risk
                                .adjust_equity(result.realized_pnl - outcome.fees_paid);
                            info!(
                                symbol = %outcome.symbol,
                                "✅ Closed {} @ {}, realized {:.4}",
                                outcome.filled_quantity,
                                outcome.avg_fill_price,
                                result.realized_pnl
                            );
                        }
                        None => {
                            warn!(symbol = %outcome.symbol, "Close fill without open position");
                        }
                    }
                }
            }
        }

        if outcome.is_rejected() {
            self.stats.orders_rejected += 1;
            self.risk.record_rejection(&outcome.symbol);
        } else if outcome.is_filled() {
            self.stats.orders_filled += 1;
            self.risk.record_success(&outcome.symbol);
        } else {
            // Cancelled or partially filled after exhausted retries. Not a
            // rejection streak, but not a success either.
            warn!(
                symbol = %outcome.symbol,
                final_state = %outcome.final_state,
                filled = %outcome.filled_quantity,
                "Order did not complete"
            );
        }
    }

    fn journal_signal(&mut self, signal: &Signal) {
        self.stats.signals += 1;
        let entry = LedgerEntry::new(EventKind::Signal)
            .symbol(&signal.symbol)
            .side(signal.side)
            .details(serde_json::json!({
                "reason": signal.reason,
                "expected_profit_bps": signal.expected_profit_bps.to_string(),
                "confidence": signal.confidence.to_string(),
            }));
        if let Err(e) = self.ledger.append(&entry) {
            error!("Failed to journal signal: {}", e);
        }
    }

    fn log_summary(&self) {
        let uptime = Utc::now().signed_duration_since(self.started_at);
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            "📊 Session summary | mode: {} | uptime: {}h{:02}m",
            self.mode,
            uptime.num_hours(),
            uptime.num_minutes() % 60
        );
        info!(
            "   Equity: {:.2} | Open positions: {} | Funding accrued: {:.4}",
            self.risk.equity(),
            self.risk.positions().len(),
            self.stats.funding_accrued
        );
        info!(
            "   Ticks: {} | Signals: {} | Vetoes: {} | Filled: {} | Rejected: {}",
            self.stats.ticks,
            self.stats.signals,
            self.stats.vetoes,
            self.stats.orders_filled,
            self.stats.orders_rejected
        );
        for position in self.risk.positions().iter() {
            info!(
                "   {} {} {} @ {} | funding: {:.4} | fees: {:.4}",
                position.symbol,
                position.side,
                position.quantity,
                position.entry_price,
                position.funding_received,
                position.fees_paid
            );
        }
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(TradingMode::parse("paper").unwrap(), TradingMode::Paper);
        assert_eq!(TradingMode::parse("live").unwrap(), TradingMode::Live);
        assert!(TradingMode::parse("dry-run").is_err());
    }

    #[test]
    fn test_live_mode_refused_without_confirmation() {
        let config = ModeConfig {
            mode: "live".to_string(),
            confirm_live: false,
        };
        assert!(ensure_live_confirmed(TradingMode::Live, &config).is_err());

        // Paper never needs the confirmation
        assert!(ensure_live_confirmed(TradingMode::Paper, &config).is_ok());

        let confirmed = ModeConfig {
            mode: "live".to_string(),
            confirm_live: true,
        };
        assert!(ensure_live_confirmed(TradingMode::Live, &confirmed).is_ok());
    }

    #[test]
    fn test_seed_equity_resumes_from_ledger() {
        let state = AccountState {
            realized_pnl: dec!(120),
            fees_paid: dec!(8),
            funding_received: dec!(15),
            ..Default::default()
        };
        assert_eq!(seed_equity(dec!(10000), &state), dec!(10127));
    }

    #[test]
    fn test_settlement_uses_last_observed_rate() {
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::hours(8);
        let prev = FundingMemo {
            next_funding_time: t0,
            rate: dec!(0.0003),
            mark_price: dec!(50000),
        };

        // First observation establishes a baseline, no settlement yet
        assert!(settlement_rolled(None, t0).is_none());
        // Unchanged next funding time: nothing settled
        assert!(settlement_rolled(Some(&prev), t0).is_none());

        // Rolled forward: the previous interval settled at the rate and
        // mark price last observed before the rollover
        let settled = settlement_rolled(Some(&prev), t1).unwrap();
        assert_eq!(settled.next_funding_time, t0);
        assert_eq!(settled.rate, dec!(0.0003));
        assert_eq!(settled.mark_price, dec!(50000));
    }

    #[test]
    fn test_auth_failure_is_fatal() {
        let auth: anyhow::Error =
            ExecutionError::Backend(ConnectorError::AuthFailure("bad key".to_string())).into();
        assert!(is_fatal(&auth));

        let timeout: anyhow::Error = ExecutionError::Backend(ConnectorError::Timeout).into();
        assert!(!is_fatal(&timeout));

        let closed: anyhow::Error = ExecutionError::ChannelClosed.into();
        assert!(!is_fatal(&closed));
    }
}
