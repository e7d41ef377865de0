//! Target weights from a holdings snapshot.
//!
//! [`WeightResolver::resolve`] ranks a snapshot's share positions by disclosed
//! value, oversamples the top of the ranking to make up for instruments that
//! turn out to have no price on the trading date, and converts the survivors to
//! fractional weights. [`WeightResolver::resolve_escalating`] drives repeated
//! resolution with a growing candidate pool until the requested count is met.
//!
//! Escalation terminates: a round that falls short without having covered the
//! whole snapshot has discovered at least one new failure, so the pool
//! (`target + failed`) strictly grows, and it is bounded above by the number of
//! instruments in the snapshot.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::domain::error::Form13fError;
use crate::domain::holdings::HoldingsMap;
use crate::ports::price_port::PriceSource;

/// Fractional allocation across instruments. Built once, never edited.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WeightVector(BTreeMap<String, f64>);

impl WeightVector {
    pub fn get(&self, instrument: &str) -> Option<f64> {
        self.0.get(instrument).copied()
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.0.contains_key(instrument)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn instruments(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }
}

impl FromIterator<(String, f64)> for WeightVector {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        WeightVector(iter.into_iter().collect())
    }
}

/// `value / total` for every entry.
pub fn calculate_weights(values: &BTreeMap<String, f64>, total: f64) -> BTreeMap<String, f64> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), v / total))
        .collect()
}

/// Each instrument's share of the summed disclosed value.
///
/// An all-zero map has no meaningful allocation and yields an empty vector.
pub fn value_to_weight(holdings: &HoldingsMap) -> WeightVector {
    let total: f64 = holdings.values().sum();
    if total == 0.0 {
        return WeightVector::default();
    }
    WeightVector(calculate_weights(holdings, total))
}

/// Instruments by disclosed value, largest first. Ties break on the
/// instrument name so the ranking is stable across runs.
pub fn rank_by_value(holdings: &HoldingsMap) -> Vec<(&str, f64)> {
    let mut ranked: Vec<(&str, f64)> = holdings.iter().map(|(k, &v)| (k.as_str(), v)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
}

/// Outcome of one resolution round.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub weights: WeightVector,
    /// Every instrument known to lack a price on the date, in discovery order.
    pub failed: Vec<String>,
}

/// Why an escalation loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// Enough priced instruments were found.
    Satisfied,
    /// The whole snapshot was examined; fewer instruments than requested are used.
    Exhausted,
    /// More instruments failed than were requested; the whole snapshot was used
    /// as the candidate pool in one last pass.
    FailureBudgetExceeded,
}

pub struct WeightResolver<'a> {
    prices: &'a dyn PriceSource,
}

impl<'a> WeightResolver<'a> {
    pub fn new(prices: &'a dyn PriceSource) -> Self {
        Self { prices }
    }

    /// One resolution round over the top `target_count + already_failed.len()`
    /// instruments.
    pub fn resolve(
        &self,
        holdings: &HoldingsMap,
        target_count: usize,
        already_failed: &[String],
        as_of: NaiveDate,
    ) -> Result<Resolution, Form13fError> {
        self.resolve_pool(
            holdings,
            target_count + already_failed.len(),
            target_count,
            already_failed,
            as_of,
        )
    }

    fn resolve_pool(
        &self,
        holdings: &HoldingsMap,
        pool_size: usize,
        target_count: usize,
        already_failed: &[String],
        as_of: NaiveDate,
    ) -> Result<Resolution, Form13fError> {
        let ranked = rank_by_value(holdings);
        let candidates = &ranked[..pool_size.min(ranked.len())];

        let mut failed = already_failed.to_vec();
        let to_check: Vec<String> = candidates
            .iter()
            .filter(|(inst, _)| !failed.iter().any(|f| f.as_str() == *inst))
            .map(|(inst, _)| inst.to_string())
            .collect();

        for instrument in self.prices.ensure_available(&to_check, as_of)? {
            warn!(%instrument, date = %as_of, "no price data, excluding from weights");
            failed.push(instrument);
        }

        let successful: HoldingsMap = candidates
            .iter()
            .filter(|(inst, _)| !failed.iter().any(|f| f.as_str() == *inst))
            .take(target_count)
            .map(|(inst, value)| (inst.to_string(), *value))
            .collect();

        let weights = value_to_weight(&successful);
        debug!(
            valid = weights.len(),
            candidates = candidates.len(),
            "calculated weights"
        );
        Ok(Resolution { weights, failed })
    }

    /// Resolve `requested` weights, enlarging the candidate pool while priced
    /// instruments are missing.
    ///
    /// A snapshot holding fewer instruments than requested uses all of them.
    pub fn resolve_escalating(
        &self,
        holdings: &HoldingsMap,
        requested: usize,
        as_of: NaiveDate,
    ) -> Result<(Resolution, EscalationOutcome), Form13fError> {
        let available = holdings.len();
        let target = if available < requested {
            warn!(
                available,
                requested, "snapshot has fewer instruments than requested, using all of them"
            );
            available
        } else {
            requested
        };

        let mut failed: Vec<String> = Vec::new();
        loop {
            let previous_failures = failed.len();
            let pool_size = target + previous_failures;
            let resolution = self.resolve(holdings, target, &failed, as_of)?;
            failed = resolution.failed.clone();

            if resolution.weights.len() >= target {
                return Ok((resolution, EscalationOutcome::Satisfied));
            }
            if pool_size >= available || failed.len() == previous_failures {
                info!(
                    valid = resolution.weights.len(),
                    requested, "snapshot exhausted before reaching requested count"
                );
                return Ok((resolution, EscalationOutcome::Exhausted));
            }
            if failed.len() > target {
                warn!(
                    failed = failed.len(),
                    requested, "price lookups failed for more instruments than requested"
                );
                let resolution = self.resolve_pool(holdings, available, target, &failed, as_of)?;
                return Ok((resolution, EscalationOutcome::FailureBudgetExceeded));
            }
            debug!(
                pool = target + failed.len(),
                failed = failed.len(),
                "escalating candidate pool"
            );
        }
    }
}
