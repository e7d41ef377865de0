//! Disclosed holdings: filings, their line items and the share-only view the
//! simulation trades on.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Instrument -> disclosed value for one snapshot.
pub type HoldingsMap = BTreeMap<String, f64>;

/// Identifies one snapshot of an entity without its holdings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRef {
    pub snapshot_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SecurityType {
    Share,
    Call,
    Put,
}

impl SecurityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityType::Share => "Share",
            SecurityType::Call => "Call",
            SecurityType::Put => "Put",
        }
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityType {
    type Err = String;

    /// Filings mark options with a put/call column; anything left blank is a share.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "" | "SHARE" | "SH" => Ok(SecurityType::Share),
            "CALL" => Ok(SecurityType::Call),
            "PUT" => Ok(SecurityType::Put),
            other => Err(format!("unknown security type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Holding {
    pub instrument: String,
    pub name: String,
    pub security_type: SecurityType,
    pub value: f64,
    pub units: i64,
}

/// One ingested filing. Line items are aggregated per (instrument, security type).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filing {
    pub entity_id: String,
    pub snapshot_id: String,
    pub date: NaiveDate,
    pub holdings: Vec<Holding>,
}

impl Filing {
    /// Build a filing, merging duplicate lines by summing value and units.
    pub fn new(
        entity_id: impl Into<String>,
        snapshot_id: impl Into<String>,
        date: NaiveDate,
        lines: Vec<Holding>,
    ) -> Self {
        let mut merged: BTreeMap<(String, SecurityType), Holding> = BTreeMap::new();
        for line in lines {
            merged
                .entry((line.instrument.clone(), line.security_type))
                .and_modify(|h| {
                    h.value += line.value;
                    h.units += line.units;
                })
                .or_insert(line);
        }
        Filing {
            entity_id: entity_id.into(),
            snapshot_id: snapshot_id.into(),
            date,
            holdings: merged.into_values().collect(),
        }
    }

    /// Only share-class positions take part in weighting.
    pub fn share_holdings(&self) -> HoldingsMap {
        self.holdings
            .iter()
            .filter(|h| h.security_type == SecurityType::Share)
            .map(|h| (h.instrument.clone(), h.value))
            .collect()
    }

    pub fn share_value(&self) -> f64 {
        self.holdings
            .iter()
            .filter(|h| h.security_type == SecurityType::Share)
            .map(|h| h.value)
            .sum()
    }

    pub fn total_value(&self) -> f64 {
        self.holdings.iter().map(|h| h.value).sum()
    }

    pub fn holding_count(&self) -> usize {
        self.holdings.len()
    }
}

/// Per-snapshot totals used for the entity overview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilingSummary {
    pub snapshot_id: String,
    pub date: NaiveDate,
    pub holding_count: usize,
    pub share_value: f64,
    pub total_value: f64,
}

impl From<&Filing> for FilingSummary {
    fn from(filing: &Filing) -> Self {
        FilingSummary {
            snapshot_id: filing.snapshot_id.clone(),
            date: filing.date,
            holding_count: filing.holding_count(),
            share_value: filing.share_value(),
            total_value: filing.total_value(),
        }
    }
}

/// Change in total disclosed value versus the previous filing, in date order.
/// The earliest filing has no predecessor and gets `None`.
pub fn filing_gains(summaries: &[FilingSummary]) -> Vec<(String, Option<f64>)> {
    let mut ordered: Vec<&FilingSummary> = summaries.iter().collect();
    ordered.sort_by(|a, b| a.date.cmp(&b.date).then(a.snapshot_id.cmp(&b.snapshot_id)));

    let mut gains = Vec::with_capacity(ordered.len());
    let mut previous: Option<f64> = None;
    for summary in ordered {
        gains.push((
            summary.snapshot_id.clone(),
            previous.map(|p| summary.total_value - p),
        ));
        previous = Some(summary.total_value);
    }
    gains
}
