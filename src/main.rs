//! Funding Arb - Main Entry Point
//!
//! Runs the funding rate capture engine in paper or live mode, or prints
//! the account state reconstructed from the ledger.

use anyhow::Result;
use clap::{Parser, Subcommand};
use funding_arb::config::Config;
use funding_arb::engine::{Engine, TradingMode};
use funding_arb::ledger::Ledger;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Funding Arb CLI
#[derive(Parser)]
#[command(name = "funding-arb")]
#[command(version, about = "Funding rate capture on Binance USDT-M perpetuals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine (default)
    Run {
        /// Trading mode: paper or live (overrides config)
        #[arg(long)]
        mode: Option<String>,

        /// Second confirmation required for live trading
        #[arg(long)]
        confirm_live: bool,
    },

    /// Show account state reconstructed from the ledger
    Status {
        /// Path to the SQLite ledger (default: value from config)
        #[arg(short, long)]
        db: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let mut config = Config::load()?;

    match cli.command {
        Some(Commands::Status { db }) => {
            let path = db.unwrap_or_else(|| config.execution.ledger_path.clone());
            return show_status(&path);
        }
        Some(Commands::Run { mode, confirm_live }) => {
            if let Some(mode) = mode {
                config.mode.mode = mode;
            }
            if confirm_live {
                config.mode.confirm_live = true;
            }
        }
        None => {}
    }

    let mode = TradingMode::parse(&config.mode.mode)?;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Funding Arb v{} - {} mode                  ",
        env!("CARGO_PKG_VERSION"),
        mode
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    if mode == TradingMode::Live {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
    } else {
        info!("📝 PAPER TRADING MODE - Simulated fills against live data");
    }

    log_config(&config);

    Engine::run(config, mode).await
}

/// Initialize stdout + rolling file logging.
fn init_logging() -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "funding-arb.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("funding_arb=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log the effective configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Symbols: {}", config.trading.symbols.join(", "));
    info!(
        "   Entry threshold: {:.4}% | Exit threshold: {:.4}%",
        config.trading.entry_threshold * dec!(100),
        config.trading.exit_threshold * dec!(100)
    );
    info!(
        "   Taker fee: {:.4}% | Slippage allowance: {:.4}%",
        config.trading.taker_fee_rate * dec!(100),
        config.trading.slippage_allowance * dec!(100)
    );
    info!(
        "   Risk per trade: {:.0}% of equity | Max positions: {}",
        config.risk.risk_per_trade_pct * dec!(100),
        config.risk.max_open_positions
    );
    info!(
        "   Notional limits: {} per symbol, {} total",
        config.risk.max_symbol_notional, config.risk.max_total_notional
    );
    info!(
        "   Check interval: {}s | Max holding: {}h",
        config.trading.check_interval_secs, config.trading.max_holding_hours
    );
    info!("   Ledger: {}", config.execution.ledger_path);
}

/// Print account state replayed from the ledger without starting the
/// engine.
fn show_status(db_path: &str) -> Result<()> {
    let ledger = Ledger::open(db_path)?;
    let state = ledger.replay()?;

    println!("Ledger: {} ({} entries)", db_path, ledger.entry_count()?);
    println!();
    println!("Realized PnL:     {:.4}", state.realized_pnl);
    println!("Fees paid:        {:.4}", state.fees_paid);
    println!("Funding received: {:.4}", state.funding_received);
    println!(
        "Net:              {:.4}",
        state.realized_pnl - state.fees_paid + state.funding_received
    );
    println!();

    if state.positions.is_empty() {
        println!("No open positions.");
        return Ok(());
    }

    println!("Open positions:");
    for position in state.positions.iter() {
        let notional: Decimal = position.notional(position.entry_price);
        println!(
            "  {:<12} {:<4} qty {} @ {} (notional {:.2}) | funding {:.4} | opened {}",
            position.symbol,
            position.side,
            position.quantity,
            position.entry_price,
            notional,
            position.funding_received,
            position.opened_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}
