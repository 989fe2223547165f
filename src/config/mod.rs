//! Configuration management for the funding arbitrage engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Binance API credentials
    #[serde(default)]
    pub binance: BinanceConfig,
    /// Strategy parameters
    #[serde(default)]
    pub trading: TradingConfig,
    /// Risk management parameters
    #[serde(default)]
    pub risk: RiskConfig,
    /// Execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Trading mode selection (paper/live)
    #[serde(default)]
    pub mode: ModeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Perpetual symbols to trade
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Minimum net carry per settlement to open (signed fraction per funding interval)
    #[serde(default = "default_entry_threshold")]
    pub entry_threshold: Decimal,
    /// Held-side carry below which a position is closed
    #[serde(default = "default_exit_threshold")]
    pub exit_threshold: Decimal,
    /// Taker fee per side (round trip = 2x)
    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: Decimal,
    /// Slippage allowance floor as a fraction of price
    #[serde(default = "default_slippage_allowance")]
    pub slippage_allowance: Decimal,
    /// Maximum age of a market snapshot before it is considered stale
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
    /// Maximum hours to hold a position regardless of carry
    #[serde(default = "default_max_holding_hours")]
    pub max_holding_hours: u32,
    /// Seconds between signal evaluation ticks
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Number of funding rate observations kept per symbol for stability filters
    #[serde(default = "default_rate_history_len")]
    pub rate_history_len: usize,
    /// Starting equity (Paper mode; Live mode refreshes from the exchange)
    #[serde(default = "default_initial_equity")]
    pub initial_equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of equity risked per opened position (0.0-1.0)
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: Decimal,
    /// Maximum notional exposure per symbol in USDT
    #[serde(default = "default_max_symbol_notional")]
    pub max_symbol_notional: Decimal,
    /// Maximum aggregate notional exposure in USDT
    #[serde(default = "default_max_total_notional")]
    pub max_total_notional: Decimal,
    /// Maximum number of concurrent open positions
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u8,
    /// Minimum order notional in USDT (exchange floor)
    #[serde(default = "default_min_order_notional")]
    pub min_order_notional: Decimal,
    /// Consecutive order rejections per symbol before trading halts for it
    #[serde(default = "default_max_consecutive_rejections")]
    pub max_consecutive_rejections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Seconds to wait for an order acknowledgement/fill before cancelling
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    /// Maximum resubmission attempts after a timeout
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff between retries in milliseconds (grows linearly per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Cancel in-flight orders on shutdown instead of leaving them resting
    #[serde(default)]
    pub cancel_on_shutdown: bool,
    /// Slippage fraction applied to simulated fills in Paper mode
    #[serde(default = "default_paper_slippage")]
    pub paper_slippage: Decimal,
    /// Path to the SQLite ledger database
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    /// "paper" or "live"
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Explicit second confirmation required before Live mode will start
    #[serde(default)]
    pub confirm_live: bool,
}

// Default value functions
fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_entry_threshold() -> Decimal {
    Decimal::new(1, 2) // 0.01 (1% per settlement)
}

fn default_exit_threshold() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_taker_fee_rate() -> Decimal {
    Decimal::new(4, 4) // 0.0004 (0.04% per side)
}

fn default_slippage_allowance() -> Decimal {
    Decimal::new(5, 4) // 0.0005 (0.05%)
}

fn default_freshness_secs() -> u64 {
    10
}

fn default_max_holding_hours() -> u32 {
    48 // 6 funding cycles
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_rate_history_len() -> usize {
    20
}

fn default_initial_equity() -> Decimal {
    Decimal::new(10_000, 0) // 10000 USDT
}

fn default_risk_per_trade_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05 (5% of equity per position)
}

fn default_max_symbol_notional() -> Decimal {
    Decimal::new(2_000, 0) // 2000 USDT
}

fn default_max_total_notional() -> Decimal {
    Decimal::new(5_000, 0) // 5000 USDT
}

fn default_max_open_positions() -> u8 {
    3
}

fn default_min_order_notional() -> Decimal {
    Decimal::new(15, 0) // Binance USDT-M floor
}

fn default_max_consecutive_rejections() -> u32 {
    3
}

fn default_order_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_paper_slippage() -> Decimal {
    Decimal::new(2, 4) // 0.0002 (0.02%)
}

fn default_ledger_path() -> String {
    "data/ledger.db".to_string()
}

fn default_mode() -> String {
    "paper".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("FARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.trading.symbols.is_empty(),
            "at least one trading symbol must be configured"
        );

        anyhow::ensure!(
            self.trading.entry_threshold > Decimal::ZERO,
            "entry_threshold must be positive"
        );

        anyhow::ensure!(
            self.trading.exit_threshold < self.trading.entry_threshold,
            "exit_threshold must be below entry_threshold"
        );

        anyhow::ensure!(
            self.risk.risk_per_trade_pct > Decimal::ZERO
                && self.risk.risk_per_trade_pct <= Decimal::ONE,
            "risk_per_trade_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.max_symbol_notional <= self.risk.max_total_notional,
            "max_symbol_notional cannot exceed max_total_notional"
        );

        anyhow::ensure!(
            self.risk.max_open_positions >= 1,
            "max_open_positions must be at least 1"
        );

        anyhow::ensure!(
            self.execution.max_retries >= 1,
            "max_retries must be at least 1"
        );

        anyhow::ensure!(
            self.mode.mode == "paper" || self.mode.mode == "live",
            "mode must be \"paper\" or \"live\""
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binance: BinanceConfig::default(),
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            mode: ModeConfig::default(),
        }
    }
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            entry_threshold: default_entry_threshold(),
            exit_threshold: default_exit_threshold(),
            taker_fee_rate: default_taker_fee_rate(),
            slippage_allowance: default_slippage_allowance(),
            freshness_secs: default_freshness_secs(),
            max_holding_hours: default_max_holding_hours(),
            check_interval_secs: default_check_interval_secs(),
            rate_history_len: default_rate_history_len(),
            initial_equity: default_initial_equity(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: default_risk_per_trade_pct(),
            max_symbol_notional: default_max_symbol_notional(),
            max_total_notional: default_max_total_notional(),
            max_open_positions: default_max_open_positions(),
            min_order_notional: default_min_order_notional(),
            max_consecutive_rejections: default_max_consecutive_rejections(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_timeout_secs: default_order_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cancel_on_shutdown: false,
            paper_slippage: default_paper_slippage(),
            ledger_path: default_ledger_path(),
        }
    }
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            confirm_live: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_mode_is_paper() {
        let config = Config::default();
        assert_eq!(config.mode.mode, "paper");
        assert!(!config.mode.confirm_live);
    }

    #[test]
    fn test_exit_threshold_must_be_below_entry() {
        let mut config = Config::default();
        config.trading.exit_threshold = config.trading.entry_threshold;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_symbol_notional_bounded_by_total() {
        let mut config = Config::default();
        config.risk.max_symbol_notional = config.risk.max_total_notional + Decimal::ONE;
        assert!(config.validate().is_err());
    }
}
