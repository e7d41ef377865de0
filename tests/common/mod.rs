#![allow(dead_code)]

use chrono::NaiveDate;
use form13f::domain::backtest::BacktestResult;
use form13f::domain::error::Form13fError;
use form13f::domain::holdings::{HoldingsMap, SnapshotRef};
use form13f::ports::holdings_port::HoldingsRepository;
use form13f::ports::price_port::PriceSource;
use form13f::ports::result_port::ResultSink;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub struct MockPriceSource {
    pub quotes: HashMap<String, BTreeMap<NaiveDate, f64>>,
    pub errors: HashMap<String, String>,
    /// Report every instrument as available regardless of stored quotes.
    pub optimistic: bool,
    /// The next availability check for this date fails once.
    pub availability_failure: RefCell<Option<NaiveDate>>,
    pub availability_calls: RefCell<Vec<NaiveDate>>,
}

impl MockPriceSource {
    pub fn new() -> Self {
        Self {
            quotes: HashMap::new(),
            errors: HashMap::new(),
            optimistic: false,
            availability_failure: RefCell::new(None),
            availability_calls: RefCell::new(Vec::new()),
        }
    }

    pub fn with_price(mut self, instrument: &str, date: &str, open: f64) -> Self {
        self.quotes
            .entry(instrument.to_string())
            .or_default()
            .insert(parse_date(date), open);
        self
    }

    pub fn with_error(mut self, instrument: &str, reason: &str) -> Self {
        self.errors.insert(instrument.to_string(), reason.to_string());
        self
    }

    pub fn with_optimistic_availability(mut self) -> Self {
        self.optimistic = true;
        self
    }

    pub fn with_availability_error_once(self, date: &str) -> Self {
        *self.availability_failure.borrow_mut() = Some(parse_date(date));
        self
    }

    fn check(&self, instrument: &str) -> Result<(), Form13fError> {
        match self.errors.get(instrument) {
            Some(reason) => Err(Form13fError::DatabaseQuery {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl PriceSource for MockPriceSource {
    fn exact_price(&self, instrument: &str, date: NaiveDate) -> Result<Option<f64>, Form13fError> {
        self.check(instrument)?;
        Ok(self
            .quotes
            .get(instrument)
            .and_then(|series| series.get(&date).copied()))
    }

    fn recent_prior_price(
        &self,
        instrument: &str,
        date: NaiveDate,
    ) -> Result<Option<f64>, Form13fError> {
        self.check(instrument)?;
        Ok(self
            .quotes
            .get(instrument)
            .and_then(|series| series.range(..date).next_back().map(|(_, p)| *p)))
    }

    fn ensure_available(
        &self,
        instruments: &[String],
        date: NaiveDate,
    ) -> Result<Vec<String>, Form13fError> {
        self.availability_calls.borrow_mut().push(date);
        let mut failure = self.availability_failure.borrow_mut();
        if *failure == Some(date) {
            *failure = None;
            return Err(Form13fError::DatabaseQuery {
                reason: "availability check failed".to_string(),
            });
        }
        drop(failure);
        if self.optimistic {
            return Ok(Vec::new());
        }
        let mut missing = Vec::new();
        for instrument in instruments {
            if self.exact_price(instrument, date)?.is_none() {
                missing.push(instrument.clone());
            }
        }
        Ok(missing)
    }
}

struct StoredSnapshot {
    entity_id: String,
    snapshot: SnapshotRef,
    holdings: HoldingsMap,
}

pub struct MockRepository {
    snapshots: Vec<StoredSnapshot>,
    pub list_calls: RefCell<usize>,
}

impl MockRepository {
    pub fn new() -> Self {
        Self {
            snapshots: Vec::new(),
            list_calls: RefCell::new(0),
        }
    }

    pub fn with_snapshot(
        mut self,
        entity_id: &str,
        snapshot_id: &str,
        date: &str,
        holdings: &[(&str, f64)],
    ) -> Self {
        self.snapshots.push(StoredSnapshot {
            entity_id: entity_id.to_string(),
            snapshot: SnapshotRef {
                snapshot_id: snapshot_id.to_string(),
                date: parse_date(date),
            },
            holdings: holdings
                .iter()
                .map(|(inst, value)| (inst.to_string(), *value))
                .collect(),
        });
        self
    }
}

impl HoldingsRepository for MockRepository {
    fn list_snapshots(
        &self,
        entity_id: &str,
        min_date: NaiveDate,
        max_date: NaiveDate,
    ) -> Result<Vec<SnapshotRef>, Form13fError> {
        *self.list_calls.borrow_mut() += 1;
        let mut found: Vec<SnapshotRef> = self
            .snapshots
            .iter()
            .filter(|s| s.entity_id == entity_id)
            .filter(|s| s.snapshot.date >= min_date && s.snapshot.date <= max_date)
            .map(|s| s.snapshot.clone())
            .collect();
        found.sort_by_key(|s| s.date);
        Ok(found)
    }

    fn get_snapshot_holdings(
        &self,
        snapshot_id: &str,
        entity_id: &str,
    ) -> Result<HoldingsMap, Form13fError> {
        Ok(self
            .snapshots
            .iter()
            .find(|s| s.entity_id == entity_id && s.snapshot.snapshot_id == snapshot_id)
            .map(|s| s.holdings.clone())
            .unwrap_or_default())
    }
}

pub struct MockResultSink {
    pub saved: RefCell<Vec<BacktestResult>>,
}

impl MockResultSink {
    pub fn new() -> Self {
        Self {
            saved: RefCell::new(Vec::new()),
        }
    }
}

impl ResultSink for MockResultSink {
    fn save_result(&self, result: &BacktestResult) -> Result<(), Form13fError> {
        self.saved.borrow_mut().push(result.clone());
        Ok(())
    }
}

pub const ENTITY: &str = "0001040273";

/// Two snapshots traded on 2019-02-11 and 2019-05-16, with AAPL as the only
/// canary. Starting from 1000 the portfolio is worth 1220 at the second
/// rebalance.
pub fn two_snapshot_prices() -> MockPriceSource {
    MockPriceSource::new()
        .with_price("AAPL", "2019-02-11", 10.0)
        .with_price("WMT", "2019-02-11", 20.0)
        .with_price("AAPL", "2019-05-16", 12.0)
        .with_price("WMT", "2019-05-16", 25.0)
        .with_price("MSFT", "2019-05-16", 50.0)
}

pub fn two_snapshot_repository() -> MockRepository {
    MockRepository::new()
        .with_snapshot(ENTITY, "S1", "2019-02-08", &[("AAPL", 600.0), ("WMT", 400.0)])
        .with_snapshot(ENTITY, "S2", "2019-05-15", &[("MSFT", 500.0), ("AAPL", 500.0)])
}
