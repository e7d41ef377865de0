//! Simulated portfolio: whole-share positions plus a cash balance.

use serde::Serialize;
use std::collections::BTreeMap;

/// Key under which cash appears when the portfolio is viewed as one map.
pub const CASH: &str = "cash";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Portfolio {
    pub cash: f64,
    pub positions: BTreeMap<String, i64>,
}

impl Portfolio {
    pub fn new(initial_bank: f64) -> Self {
        Portfolio {
            cash: initial_bank,
            positions: BTreeMap::new(),
        }
    }

    pub fn with_positions(cash: f64, positions: &[(&str, i64)]) -> Self {
        Portfolio {
            cash,
            positions: positions
                .iter()
                .map(|(inst, qty)| (inst.to_string(), *qty))
                .collect(),
        }
    }

    pub fn quantity(&self, instrument: &str) -> i64 {
        self.positions.get(instrument).copied().unwrap_or(0)
    }

    pub fn has_position(&self, instrument: &str) -> bool {
        self.positions.contains_key(instrument)
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Add `shares` (negative to sell) at `price`, moving the opposite amount of cash.
    pub fn apply_trade(&mut self, instrument: &str, shares: i64, price: f64) {
        *self.positions.entry(instrument.to_string()).or_insert(0) += shares;
        self.cash -= shares as f64 * price;
    }

    /// Drop positions left at exactly zero shares.
    pub fn prune_empty(&mut self) {
        self.positions.retain(|_, qty| *qty != 0);
    }
}
