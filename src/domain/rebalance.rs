//! Rebalancing a portfolio onto a target weight vector.
//!
//! A rebalance values every instrument involved, compares current and target
//! weights, rounds the resulting deltas to whole shares and only then touches
//! the portfolio. If any price is missing the portfolio is left unchanged.
//!
//! Cash takes part in the current weights but is never traded against: its
//! delta is carried in the delta map and skipped at execution, so the other
//! deltas are not forced to net to zero. Rounding to whole shares therefore
//! lets realised allocation drift slightly from the target.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::portfolio::{CASH, Portfolio};
use super::weights::{WeightVector, calculate_weights};
use crate::domain::error::Form13fError;
use crate::ports::price_port::PriceSource;

/// Prices and position values at one rebalance date.
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub date: NaiveDate,
    pub prices: BTreeMap<String, f64>,
    /// Value per held instrument, plus cash under [`CASH`].
    pub values: BTreeMap<String, f64>,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub instrument: String,
    /// Signed: positive buys, negative sells.
    pub shares: i64,
    pub price: f64,
}

impl Trade {
    pub fn is_buy(&self) -> bool {
        self.shares > 0
    }

    pub fn amount(&self) -> f64 {
        self.shares as f64 * self.price
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceOutcome {
    /// Portfolio value before trading, at the rebalance date's prices.
    pub total_value: f64,
    pub trades: Vec<Trade>,
}

/// A zero, negative or non-finite quote counts as no quote.
fn usable(price: Option<f64>) -> Option<f64> {
    price.filter(|p| p.is_finite() && *p > 0.0)
}

/// Price every instrument held or targeted on `date`.
///
/// Instruments being bought need an opening price on exactly `date`. Positions
/// already held may fall back to the most recent earlier price.
pub fn value_portfolio(
    prices: &dyn PriceSource,
    portfolio: &Portfolio,
    target: &WeightVector,
    date: NaiveDate,
) -> Result<Valuation, Form13fError> {
    let instruments: BTreeSet<String> = portfolio
        .positions
        .keys()
        .cloned()
        .chain(target.instruments())
        .collect();

    let mut price_map = BTreeMap::new();
    let mut values = BTreeMap::new();
    values.insert(CASH.to_string(), portfolio.cash);

    for instrument in instruments {
        let price = if portfolio.has_position(&instrument) {
            match usable(prices.exact_price(&instrument, date)?) {
                Some(p) => p,
                None => {
                    let prior = usable(prices.recent_prior_price(&instrument, date)?);
                    let Some(p) = prior else {
                        return Err(Form13fError::MissingSalePrice { instrument, date });
                    };
                    debug!(%instrument, %date, price = p, "using most recent prior price");
                    p
                }
            }
        } else {
            usable(prices.exact_price(&instrument, date)?)
                .ok_or_else(|| Form13fError::MissingBuyPrice {
                    instrument: instrument.clone(),
                    date,
                })?
        };

        if portfolio.has_position(&instrument) {
            values.insert(
                instrument.clone(),
                portfolio.quantity(&instrument) as f64 * price,
            );
        }
        price_map.insert(instrument, price);
    }

    let total = values.values().sum();
    Ok(Valuation {
        date,
        prices: price_map,
        values,
        total,
    })
}

/// Target minus current weight for every targeted instrument, and the negated
/// current weight for anything held but no longer targeted.
pub fn compare_weights(
    current: &BTreeMap<String, f64>,
    target: &WeightVector,
) -> BTreeMap<String, f64> {
    let mut delta: BTreeMap<String, f64> = current
        .iter()
        .map(|(inst, w)| (inst.clone(), -w))
        .collect();
    for (inst, w) in target.iter() {
        let held = current.get(inst).copied().unwrap_or(0.0);
        delta.insert(inst.clone(), w - held);
    }
    delta
}

/// Whole-share trades for a delta vector; ties round away from zero.
pub fn plan_trades(
    delta: &BTreeMap<String, f64>,
    prices: &BTreeMap<String, f64>,
    total: f64,
) -> Vec<Trade> {
    delta
        .iter()
        .filter(|(inst, _)| inst.as_str() != CASH)
        .filter_map(|(inst, d)| {
            let price = usable(prices.get(inst).copied())?;
            let shares = ((d * total) / price).round() as i64;
            (shares != 0).then(|| Trade {
                instrument: inst.clone(),
                shares,
                price,
            })
        })
        .collect()
}

/// Apply trades in order, then prune emptied positions.
pub fn execute_trades(portfolio: &mut Portfolio, trades: &[Trade]) {
    for trade in trades {
        portfolio.apply_trade(&trade.instrument, trade.shares, trade.price);
        if trade.is_buy() {
            debug!(instrument = %trade.instrument, shares = trade.shares, amount = trade.amount(), "bought");
        } else {
            debug!(instrument = %trade.instrument, shares = -trade.shares, amount = -trade.amount(), "sold");
        }
    }
    portfolio.prune_empty();
}

pub struct RebalanceEngine<'a> {
    prices: &'a dyn PriceSource,
}

impl<'a> RebalanceEngine<'a> {
    pub fn new(prices: &'a dyn PriceSource) -> Self {
        Self { prices }
    }

    pub fn rebalance(
        &self,
        portfolio: &mut Portfolio,
        target: &WeightVector,
        date: NaiveDate,
    ) -> Result<RebalanceOutcome, Form13fError> {
        let valuation = value_portfolio(self.prices, portfolio, target, date)?;
        info!(total = valuation.total, %date, "portfolio value");

        if valuation.total <= 0.0 {
            warn!(total = valuation.total, %date, "nothing to allocate, skipping trades");
            return Ok(RebalanceOutcome {
                total_value: valuation.total,
                trades: Vec::new(),
            });
        }

        let current = calculate_weights(&valuation.values, valuation.total);
        let delta = compare_weights(&current, target);
        let trades = plan_trades(&delta, &valuation.prices, valuation.total);
        execute_trades(portfolio, &trades);

        Ok(RebalanceOutcome {
            total_value: valuation.total,
            trades,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Quotes keyed by (instrument, date).
    #[derive(Default)]
    struct TableSource {
        quotes: HashMap<String, BTreeMap<NaiveDate, f64>>,
    }

    impl TableSource {
        fn with(mut self, instrument: &str, date: NaiveDate, price: f64) -> Self {
            self.quotes
                .entry(instrument.to_string())
                .or_default()
                .insert(date, price);
            self
        }
    }

    impl PriceSource for TableSource {
        fn exact_price(
            &self,
            instrument: &str,
            date: NaiveDate,
        ) -> Result<Option<f64>, Form13fError> {
            Ok(self
                .quotes
                .get(instrument)
                .and_then(|s| s.get(&date))
                .copied())
        }

        fn recent_prior_price(
            &self,
            instrument: &str,
            date: NaiveDate,
        ) -> Result<Option<f64>, Form13fError> {
            Ok(self
                .quotes
                .get(instrument)
                .and_then(|s| s.range(..date).next_back())
                .map(|(_, p)| *p))
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn weights(entries: &[(&str, f64)]) -> WeightVector {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn btree(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn compare_weights_simple() {
        let current = btree(&[("A", 0.20), ("B", 0.30), ("C", 0.22), ("D", 0.28)]);
        let target = weights(&[("A", 0.70), ("B", 0.20), ("E", 0.10)]);
        let delta = compare_weights(&current, &target);

        assert_eq!(delta.len(), 5);
        assert_abs_diff_eq!(delta["A"], 0.50, epsilon = 1e-12);
        assert_abs_diff_eq!(delta["E"], 0.10, epsilon = 1e-12);
        assert_abs_diff_eq!(delta["B"], -0.10, epsilon = 1e-12);
        assert_abs_diff_eq!(delta["C"], -0.22, epsilon = 1e-12);
        assert_abs_diff_eq!(delta["D"], -0.28, epsilon = 1e-12);
    }

    #[test]
    fn compare_weights_zero_target_sells_out() {
        let current = btree(&[
            ("AAPL", 0.2760664185093840),
            ("WMT", 0.0280680852812017),
            ("BA", 0.3053757792818500),
            ("AIG", 0.1439952931302880),
            ("NFLX", 0.2464944237972760),
        ]);
        let target = weights(&[
            ("AAPL", 0.5),
            ("WMT", 0.3),
            ("BA", 0.1),
            ("AIG", 0.0),
            ("NFLX", 0.10),
        ]);
        let delta = compare_weights(&current, &target);

        assert_abs_diff_eq!(delta["AAPL"], 0.223933581490616, epsilon = 1e-12);
        assert_abs_diff_eq!(delta["WMT"], 0.271931914718798, epsilon = 1e-12);
        assert_abs_diff_eq!(delta["BA"], -0.205375779281850, epsilon = 1e-12);
        assert_abs_diff_eq!(delta["AIG"], -0.143995293130288, epsilon = 1e-12);
        assert_abs_diff_eq!(delta["NFLX"], -0.146494423797276, epsilon = 1e-12);
    }

    #[test]
    fn execute_unit_prices() {
        let mut portfolio =
            Portfolio::with_positions(0.0, &[("A", 20), ("B", 30), ("C", 22), ("D", 28)]);
        let prices = btree(&[("A", 1.0), ("B", 1.0), ("C", 1.0), ("D", 1.0), ("E", 1.0)]);
        let delta = btree(&[
            ("A", 0.50),
            ("E", 0.10),
            ("B", -0.10),
            ("C", -0.22),
            ("D", -0.28),
        ]);

        let trades = plan_trades(&delta, &prices, 100.0);
        execute_trades(&mut portfolio, &trades);

        assert_eq!(
            portfolio.positions,
            BTreeMap::from([("A".to_string(), 70), ("B".to_string(), 20), ("E".to_string(), 10)])
        );
        assert_abs_diff_eq!(portfolio.cash, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn execute_uneven_prices() {
        let mut portfolio =
            Portfolio::with_positions(0.0, &[("A", 40), ("B", 30), ("C", 22), ("D", 28)]);
        let prices = btree(&[("A", 0.5), ("B", 1.0), ("C", 1.0), ("D", 1.0), ("E", 2.0)]);
        let delta = btree(&[
            ("A", 0.50),
            ("E", 0.10),
            ("B", -0.10),
            ("C", -0.22),
            ("D", -0.28),
        ]);

        let trades = plan_trades(&delta, &prices, 100.0);
        execute_trades(&mut portfolio, &trades);

        assert_eq!(portfolio.quantity("A"), 140);
        assert_eq!(portfolio.quantity("B"), 20);
        assert_eq!(portfolio.quantity("E"), 5);
        assert_eq!(portfolio.position_count(), 3);
    }

    #[test]
    fn execute_realistic_prices_leaves_rounding_cash() {
        let mut portfolio = Portfolio::with_positions(
            0.0,
            &[("AAPL", 110), ("WMT", 20), ("BA", 51), ("AIG", 230), ("NFLX", 48)],
        );
        let prices = btree(&[
            ("AAPL", 171.05),
            ("AIG", 42.67),
            ("BA", 408.10),
            ("WMT", 95.65),
            ("NFLX", 350.0),
        ]);
        let total = 110.0 * 171.05 + 20.0 * 95.65 + 51.0 * 408.10 + 230.0 * 42.67 + 48.0 * 350.0;
        let delta = btree(&[
            ("AAPL", 0.223933581490616),
            ("WMT", 0.271931914718798),
            ("BA", -0.205375779281850),
            ("AIG", -0.143995293130288),
            ("NFLX", -0.146494423797276),
        ]);

        let trades = plan_trades(&delta, &prices, total);
        execute_trades(&mut portfolio, &trades);

        assert_eq!(portfolio.quantity("AAPL"), 199);
        assert_eq!(portfolio.quantity("WMT"), 214);
        assert_eq!(portfolio.quantity("BA"), 17);
        assert_eq!(portfolio.quantity("NFLX"), 19);
        assert!(!portfolio.has_position("AIG"));
        assert_abs_diff_eq!(portfolio.cash, 59.95, epsilon = 1e-6);
    }

    #[test]
    fn half_shares_round_away_from_zero() {
        let prices = btree(&[("A", 2.0), ("B", 2.0)]);
        let delta = btree(&[("A", 0.05), ("B", -0.05)]);
        let trades = plan_trades(&delta, &prices, 100.0);
        assert_eq!(trades[0].shares, 3);
        assert_eq!(trades[1].shares, -3);
    }

    #[test]
    fn cash_delta_is_not_traded() {
        let prices = btree(&[("A", 1.0)]);
        let delta = btree(&[("A", 0.5), (CASH, -0.5)]);
        let trades = plan_trades(&delta, &prices, 100.0);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].instrument, "A");
    }

    #[test]
    fn unusable_prices_plan_no_trade() {
        let prices = btree(&[("A", 0.0), ("B", f64::NAN), ("C", -1.0), ("D", 1.0)]);
        let delta = btree(&[("A", 0.5), ("B", 0.1), ("C", 0.1), ("D", 0.2)]);
        let trades = plan_trades(&delta, &prices, 100.0);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].instrument, "D");
        assert_eq!(trades[0].shares, 20);
    }

    #[test]
    fn zero_quote_for_a_buy_is_missing() {
        let d = day(2019, 2, 11);
        let source = TableSource::default().with("A", d, 0.0);
        let mut portfolio = Portfolio::new(100.0);
        let engine = RebalanceEngine::new(&source);

        let err = engine
            .rebalance(&mut portfolio, &weights(&[("A", 1.0)]), d)
            .unwrap_err();

        assert!(matches!(err, Form13fError::MissingBuyPrice { ref instrument, .. } if instrument == "A"));
        assert_eq!(portfolio, Portfolio::new(100.0));
    }

    #[test]
    fn zero_quote_for_a_held_position_falls_back_to_prior() {
        let d = day(2019, 2, 11);
        let source = TableSource::default()
            .with("A", day(2019, 2, 8), 10.0)
            .with("A", d, 0.0);
        let mut portfolio = Portfolio::with_positions(0.0, &[("A", 5)]);
        let engine = RebalanceEngine::new(&source);

        let outcome = engine
            .rebalance(&mut portfolio, &weights(&[("A", 1.0)]), d)
            .unwrap();

        assert_abs_diff_eq!(outcome.total_value, 50.0, epsilon = 1e-9);
        assert!(outcome.trades.is_empty());
        assert_eq!(portfolio.quantity("A"), 5);
    }

    #[test]
    fn non_finite_quote_without_history_cannot_be_valued() {
        let d = day(2019, 2, 11);
        let source = TableSource::default().with("A", d, f64::INFINITY);
        let mut portfolio = Portfolio::with_positions(0.0, &[("A", 5)]);
        let engine = RebalanceEngine::new(&source);

        let err = engine
            .rebalance(&mut portfolio, &weights(&[("A", 1.0)]), d)
            .unwrap_err();
        assert!(matches!(err, Form13fError::MissingSalePrice { .. }));
    }

    #[test]
    fn buy_without_exact_price_is_fatal() {
        let d = day(2019, 2, 11);
        let source = TableSource::default()
            .with("AAPL", d, 170.0)
            .with("NEW", day(2019, 2, 8), 12.0);
        let mut portfolio = Portfolio::with_positions(1.0, &[("AAPL", 50)]);
        let before = portfolio.clone();
        let engine = RebalanceEngine::new(&source);

        let err = engine
            .rebalance(&mut portfolio, &weights(&[("AAPL", 0.0), ("NEW", 1.0)]), d)
            .unwrap_err();

        assert!(matches!(err, Form13fError::MissingBuyPrice { ref instrument, .. } if instrument == "NEW"));
        assert_eq!(portfolio, before);
    }

    #[test]
    fn sell_falls_back_to_prior_price() {
        let d = day(2019, 2, 11);
        let source = TableSource::default()
            .with("SHPG", day(2019, 1, 7), 176.6)
            .with("AAPL", d, 10.0);
        let portfolio = Portfolio::with_positions(0.0, &[("SHPG", 10)]);

        let valuation =
            value_portfolio(&source, &portfolio, &weights(&[("AAPL", 1.0)]), d).unwrap();

        assert_abs_diff_eq!(valuation.prices["SHPG"], 176.6, epsilon = 1e-12);
        assert_abs_diff_eq!(valuation.total, 1766.0, epsilon = 1e-9);
        assert!(!valuation.values.contains_key("AAPL"));
    }

    #[test]
    fn held_position_without_any_history_is_fatal() {
        let d = day(2219, 2, 11);
        let source = TableSource::default().with("AAPL", d, 10.0);
        let mut portfolio = Portfolio::with_positions(1.0, &[("AAPL", 50), ("WMT", 20)]);
        let engine = RebalanceEngine::new(&source);

        let err = engine
            .rebalance(&mut portfolio, &weights(&[("AAPL", 1.0)]), d)
            .unwrap_err();

        assert!(matches!(err, Form13fError::MissingSalePrice { ref instrument, .. } if instrument == "WMT"));
    }

    #[test]
    fn rebalance_from_cash() {
        let d = day(2019, 2, 11);
        let source = TableSource::default()
            .with("AAPL", d, 10.0)
            .with("WMT", d, 20.0);
        let mut portfolio = Portfolio::new(1_000.0);
        let engine = RebalanceEngine::new(&source);

        let outcome = engine
            .rebalance(&mut portfolio, &weights(&[("AAPL", 0.6), ("WMT", 0.4)]), d)
            .unwrap();

        assert_abs_diff_eq!(outcome.total_value, 1_000.0, epsilon = 1e-9);
        assert_eq!(portfolio.quantity("AAPL"), 60);
        assert_eq!(portfolio.quantity("WMT"), 20);
        assert_abs_diff_eq!(portfolio.cash, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn each_instrument_trades_once() {
        let d = day(2019, 2, 11);
        let source = TableSource::default()
            .with("A", d, 3.0)
            .with("B", d, 7.0)
            .with("C", d, 11.0);
        let mut portfolio = Portfolio::with_positions(500.0, &[("A", 40), ("B", 10)]);
        let engine = RebalanceEngine::new(&source);

        let outcome = engine
            .rebalance(&mut portfolio, &weights(&[("B", 0.5), ("C", 0.5)]), d)
            .unwrap();

        let mut seen = BTreeSet::new();
        for trade in &outcome.trades {
            assert!(seen.insert(trade.instrument.clone()));
        }
        assert!(!portfolio.has_position("A"));
    }

    proptest! {
        #[test]
        fn rebalancing_to_current_weights_is_a_no_op(
            positions in prop::collection::btree_map("[A-Z]{3}", (1i64..5_000, 1.0f64..500.0), 1..12),
            cash in 0.0f64..10_000.0,
        ) {
            let d = day(2019, 2, 11);
            let mut source = TableSource::default();
            let mut portfolio = Portfolio::new(cash);
            for (inst, (qty, price)) in &positions {
                source = source.with(inst, d, *price);
                portfolio.positions.insert(inst.clone(), *qty);
            }
            let valuation = value_portfolio(&source, &portfolio, &WeightVector::default(), d).unwrap();
            let target: WeightVector = valuation
                .values
                .iter()
                .filter(|(inst, _)| inst.as_str() != CASH)
                .map(|(inst, v)| (inst.clone(), v / valuation.total))
                .collect();
            let before: Vec<String> = portfolio.positions.keys().cloned().collect();

            let engine = RebalanceEngine::new(&source);
            let outcome = engine.rebalance(&mut portfolio, &target, d).unwrap();

            prop_assert!(outcome.trades.iter().all(|t| t.shares.abs() <= 1));
            let after: Vec<String> = portfolio.positions.keys().cloned().collect();
            prop_assert_eq!(before, after);
        }
    }
}
