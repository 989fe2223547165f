//! Funding carry signal generation.
//!
//! `evaluate` is a pure function of its inputs: the latest funding and book
//! snapshots, the held position (if any), the per-symbol rate history, and
//! the clock. The same inputs always produce the same outcome.

use crate::config::TradingConfig;
use crate::exchange::OrderSide;
use crate::market::{BookSnapshot, FundingSnapshot};
use crate::risk::Position;
use crate::utils::decimal::{sample_std_dev, to_basis_points};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;

/// Minimum history depth before the volatility/stability filters apply.
const MIN_HISTORY_FOR_FILTERS: usize = 5;

/// Advisory trading signal. Carries no sizing; the risk manager decides
/// quantity, or vetoes the signal entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub symbol: String,
    pub side: OrderSide,
    pub reason: String,
    /// Net carry estimate in basis points. Journaled only, never sized on.
    pub expected_profit_bps: Decimal,
    /// Confidence in [0, 1] from rate magnitude and history stability.
    pub confidence: Decimal,
}

/// Outcome of one evaluation pass for a symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Open(Signal),
    Close(Signal),
    /// Nothing to do; the reason is journaled at debug level.
    Hold(String),
    /// Market data is older than the freshness bound.
    Stale,
}

/// Bounded deque of recent funding rate observations for one symbol.
#[derive(Debug, Clone)]
pub struct RateHistory {
    rates: VecDeque<Decimal>,
    capacity: usize,
}

impl RateHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            rates: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, rate: Decimal) {
        if self.rates.len() == self.capacity {
            self.rates.pop_front();
        }
        self.rates.push_back(rate);
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    fn abs_rates(&self) -> Vec<Decimal> {
        self.rates.iter().map(|r| r.abs()).collect()
    }

    pub fn mean_abs(&self) -> Decimal {
        if self.rates.is_empty() {
            return Decimal::ZERO;
        }
        self.abs_rates().iter().copied().sum::<Decimal>() / Decimal::from(self.rates.len())
    }

    pub fn std_dev(&self) -> Decimal {
        sample_std_dev(&self.rates.iter().copied().collect::<Vec<_>>())
    }
}

/// Evaluate one symbol against the current market state.
pub fn evaluate(
    funding: &FundingSnapshot,
    book: &BookSnapshot,
    position: Option<&Position>,
    history: &RateHistory,
    config: &TradingConfig,
    now: DateTime<Utc>,
) -> Evaluation {
    let bound = Duration::seconds(config.freshness_secs as i64);
    if !funding.is_fresh(now, bound) || !book.is_fresh(now, bound) {
        return Evaluation::Stale;
    }

    let rate = funding.rate;
    let round_trip_fee = config.taker_fee_rate * Decimal::TWO;
    let half_spread = book.spread_fraction() / Decimal::TWO;
    let slippage = half_spread.max(config.slippage_allowance);
    let costs = round_trip_fee + slippage;

    match position {
        Some(position) => evaluate_held(position, rate, costs, config, now),
        None => evaluate_flat(funding, rate, costs, history, config),
    }
}

fn evaluate_held(
    position: &Position,
    rate: Decimal,
    costs: Decimal,
    config: &TradingConfig,
    now: DateTime<Utc>,
) -> Evaluation {
    let max_age = Duration::hours(config.max_holding_hours as i64);
    if position.age(now) > max_age {
        return Evaluation::Close(Signal {
            symbol: position.symbol.clone(),
            side: position.side.opposite(),
            reason: format!(
                "held longer than {}h maximum",
                config.max_holding_hours
            ),
            expected_profit_bps: Decimal::ZERO,
            confidence: Decimal::ONE,
        });
    }

    // Rate aligned with the position: a short earns the raw rate, a long
    // earns its negation. A sign flip against the position shows up here
    // as negative carry.
    let aligned_rate = match position.side {
        OrderSide::Sell => rate,
        OrderSide::Buy => -rate,
    };
    let held_carry = aligned_rate - costs;

    if held_carry < config.exit_threshold {
        return Evaluation::Close(Signal {
            symbol: position.symbol.clone(),
            side: position.side.opposite(),
            reason: format!(
                "carry {:.6} decayed below exit threshold {:.6}",
                held_carry, config.exit_threshold
            ),
            expected_profit_bps: to_basis_points(held_carry),
            confidence: Decimal::ONE,
        });
    }

    Evaluation::Hold(format!("carry {:.6} still above exit threshold", held_carry))
}

fn evaluate_flat(
    funding: &FundingSnapshot,
    rate: Decimal,
    costs: Decimal,
    history: &RateHistory,
    config: &TradingConfig,
) -> Evaluation {
    let net_carry = rate.abs() - costs;

    if net_carry <= config.entry_threshold {
        return Evaluation::Hold(format!(
            "net carry {:.6} below entry threshold {:.6}",
            net_carry, config.entry_threshold
        ));
    }

    if history.len() >= MIN_HISTORY_FOR_FILTERS {
        let std_dev = history.std_dev();
        if std_dev > rate.abs() / Decimal::TWO {
            return Evaluation::Hold(format!(
                "rate too volatile (std dev {:.6} vs rate {:.6})",
                std_dev, rate
            ));
        }

        let mean_abs = history.mean_abs();
        if rate.abs() < dec!(0.7) * mean_abs {
            return Evaluation::Hold(format!(
                "rate {:.6} below 70% of historical mean {:.6}",
                rate, mean_abs
            ));
        }
    }

    // Short collects positive funding, long collects negative funding.
    let side = if rate >= Decimal::ZERO {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    };

    Evaluation::Open(Signal {
        symbol: funding.symbol.clone(),
        side,
        reason: format!("net carry {:.6} above entry threshold", net_carry),
        expected_profit_bps: to_basis_points(net_carry),
        confidence: confidence(net_carry, rate, history, config),
    })
}

/// Confidence in [0, 1]: how far the carry clears the threshold, tempered
/// by how noisy the rate history is.
fn confidence(
    net_carry: Decimal,
    rate: Decimal,
    history: &RateHistory,
    config: &TradingConfig,
) -> Decimal {
    let magnitude = (net_carry / (config.entry_threshold * Decimal::TWO)).min(Decimal::ONE);

    let stability = if history.len() >= MIN_HISTORY_FOR_FILTERS && rate != Decimal::ZERO {
        (Decimal::ONE - history.std_dev() / rate.abs()).max(Decimal::ZERO)
    } else {
        dec!(0.5)
    };

    ((magnitude + stability) / Decimal::TWO)
        .max(Decimal::ZERO)
        .min(Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TradingConfig;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn test_config() -> TradingConfig {
        TradingConfig {
            entry_threshold: dec!(0.01),
            exit_threshold: dec!(0.005),
            taker_fee_rate: dec!(0.0005),
            slippage_allowance: dec!(0.001),
            freshness_secs: 10,
            max_holding_hours: 48,
            ..TradingConfig::default()
        }
    }

    fn funding(rate: Decimal) -> FundingSnapshot {
        FundingSnapshot {
            symbol: "BTCUSDT".to_string(),
            rate,
            mark_price: dec!(50000),
            next_funding_time: now() + Duration::hours(4),
            observed_at: now(),
        }
    }

    fn tight_book() -> BookSnapshot {
        BookSnapshot {
            symbol: "BTCUSDT".to_string(),
            bid_price: dec!(49999),
            bid_qty: dec!(10),
            ask_price: dec!(50001),
            ask_qty: dec!(10),
            observed_at: now(),
        }
    }

    fn short_position(opened_at: DateTime<Utc>) -> Position {
        Position::new(
            "BTCUSDT".to_string(),
            OrderSide::Sell,
            dec!(0.01),
            dec!(50000),
            Decimal::ZERO,
            opened_at,
        )
    }

    #[test]
    fn test_high_positive_rate_opens_short() {
        // rate 0.015, fees 0.001, slippage 0.001 -> net carry 0.013 > 0.01
        let config = test_config();
        let history = RateHistory::new(20);

        let eval = evaluate(
            &funding(dec!(0.015)),
            &tight_book(),
            None,
            &history,
            &config,
            now(),
        );

        match eval {
            Evaluation::Open(signal) => {
                assert_eq!(signal.side, OrderSide::Sell);
                assert_eq!(signal.expected_profit_bps, dec!(130));
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_rate_opens_long() {
        let config = test_config();
        let history = RateHistory::new(20);

        let eval = evaluate(
            &funding(dec!(-0.015)),
            &tight_book(),
            None,
            &history,
            &config,
            now(),
        );

        match eval {
            Evaluation::Open(signal) => assert_eq!(signal.side, OrderSide::Buy),
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn test_carry_below_threshold_holds() {
        let config = test_config();
        let history = RateHistory::new(20);

        // net carry = 0.011 - 0.002 = 0.009 <= 0.01
        let eval = evaluate(
            &funding(dec!(0.011)),
            &tight_book(),
            None,
            &history,
            &config,
            now(),
        );
        assert!(matches!(eval, Evaluation::Hold(_)));
    }

    #[test]
    fn test_decayed_carry_closes_position() {
        // rate 0.004, costs 0.002 -> held carry 0.002 < exit 0.005
        let config = test_config();
        let history = RateHistory::new(20);
        let position = short_position(now() - Duration::hours(10));

        let eval = evaluate(
            &funding(dec!(0.004)),
            &tight_book(),
            Some(&position),
            &history,
            &config,
            now(),
        );

        match eval {
            Evaluation::Close(signal) => assert_eq!(signal.side, OrderSide::Buy),
            other => panic!("expected Close, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_flip_against_short_closes() {
        let config = test_config();
        let history = RateHistory::new(20);
        let position = short_position(now() - Duration::hours(1));

        let eval = evaluate(
            &funding(dec!(-0.01)),
            &tight_book(),
            Some(&position),
            &history,
            &config,
            now(),
        );
        assert!(matches!(eval, Evaluation::Close(_)));
    }

    #[test]
    fn test_healthy_carry_holds_position() {
        let config = test_config();
        let history = RateHistory::new(20);
        let position = short_position(now() - Duration::hours(1));

        let eval = evaluate(
            &funding(dec!(0.012)),
            &tight_book(),
            Some(&position),
            &history,
            &config,
            now(),
        );
        assert!(matches!(eval, Evaluation::Hold(_)));
    }

    #[test]
    fn test_max_holding_period_forces_close() {
        let config = test_config();
        let history = RateHistory::new(20);
        let position = short_position(now() - Duration::hours(49));

        // Carry is still excellent, but the position is too old
        let eval = evaluate(
            &funding(dec!(0.02)),
            &tight_book(),
            Some(&position),
            &history,
            &config,
            now(),
        );
        assert!(matches!(eval, Evaluation::Close(_)));
    }

    #[test]
    fn test_stale_funding_skips_symbol() {
        let config = test_config();
        let history = RateHistory::new(20);

        let mut stale_funding = funding(dec!(0.015));
        stale_funding.observed_at = now() - Duration::seconds(11);

        let eval = evaluate(
            &stale_funding,
            &tight_book(),
            None,
            &history,
            &config,
            now(),
        );
        assert_eq!(eval, Evaluation::Stale);
    }

    #[test]
    fn test_volatility_filter_blocks_open() {
        let config = test_config();
        let mut history = RateHistory::new(20);
        // Wildly swinging history: std dev well above rate/2
        for rate in [dec!(0.05), dec!(-0.04), dec!(0.06), dec!(-0.05), dec!(0.04)] {
            history.push(rate);
        }

        let eval = evaluate(
            &funding(dec!(0.015)),
            &tight_book(),
            None,
            &history,
            &config,
            now(),
        );
        assert!(matches!(eval, Evaluation::Hold(_)));
    }

    #[test]
    fn test_stability_filter_blocks_spike_from_nothing() {
        let mut config = test_config();
        config.entry_threshold = dec!(0.005);

        let mut history = RateHistory::new(20);
        // History mean far above the current rate
        for _ in 0..6 {
            history.push(dec!(0.02));
        }

        // |0.012| < 0.7 * 0.02 = 0.014 -> stability filter trips
        let eval = evaluate(
            &funding(dec!(0.012)),
            &tight_book(),
            None,
            &history,
            &config,
            now(),
        );
        assert!(matches!(eval, Evaluation::Hold(_)));
    }

    #[test]
    fn test_filters_inactive_with_short_history() {
        let config = test_config();
        let mut history = RateHistory::new(20);
        history.push(dec!(0.05));
        history.push(dec!(-0.05));

        let eval = evaluate(
            &funding(dec!(0.015)),
            &tight_book(),
            None,
            &history,
            &config,
            now(),
        );
        assert!(matches!(eval, Evaluation::Open(_)));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let config = test_config();
        let mut history = RateHistory::new(20);
        for _ in 0..6 {
            history.push(dec!(0.014));
        }

        let first = evaluate(
            &funding(dec!(0.015)),
            &tight_book(),
            None,
            &history,
            &config,
            now(),
        );
        let second = evaluate(
            &funding(dec!(0.015)),
            &tight_book(),
            None,
            &history,
            &config,
            now(),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn test_history_deque_is_bounded() {
        let mut history = RateHistory::new(3);
        for i in 1..=5 {
            history.push(Decimal::from(i));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.mean_abs(), dec!(4)); // 3, 4, 5
    }
}
