//! Follow-the-filer backtest over an entity's snapshot history.
//!
//! Each snapshot is traded on its effective date, the first open session after
//! the filing became public. Weights come from the snapshot itself; the next
//! snapshot's effective date is only used to pre-warm price data and never
//! influences the current allocation.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::portfolio::Portfolio;
use super::rebalance::RebalanceEngine;
use super::weights::WeightResolver;
use crate::domain::error::Form13fError;
use crate::ports::calendar_port::TradingCalendar;
use crate::ports::holdings_port::HoldingsRepository;
use crate::ports::price_port::PriceSource;

pub const DEFAULT_INITIAL_BANK: f64 = 100_000.0;

/// Earliest date filings are considered reliable enough to trade on.
pub fn default_min_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2014, 1, 1).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub initial_bank: f64,
    pub min_start_date: NaiveDate,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            initial_bank: DEFAULT_INITIAL_BANK,
            min_start_date: default_min_start_date(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestRequest {
    pub entity_id: String,
    pub num_stocks: usize,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running { index: usize },
    Completed,
    Failed,
}

/// Portfolio value at one rebalance, before trading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquityPoint {
    pub snapshot_id: String,
    pub date: NaiveDate,
    pub total_value: f64,
    pub positions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestResult {
    pub entity_id: String,
    pub num_stocks: usize,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    /// Percent, rounded to two decimals.
    #[serde(rename = "return")]
    pub percent_return: f64,
    pub final_value: f64,
    pub history: Vec<EquityPoint>,
}

/// `(final / initial - 1) * 100`, rounded to two decimals.
pub fn percent_return(final_value: f64, initial_bank: f64) -> f64 {
    ((final_value / initial_bank - 1.0) * 100.0 * 100.0).round() / 100.0
}

pub struct BacktestRunner<'a> {
    repository: &'a dyn HoldingsRepository,
    prices: &'a dyn PriceSource,
    calendar: &'a dyn TradingCalendar,
    config: BacktestConfig,
    state: RunState,
}

impl<'a> BacktestRunner<'a> {
    pub fn new(
        repository: &'a dyn HoldingsRepository,
        prices: &'a dyn PriceSource,
        calendar: &'a dyn TradingCalendar,
        config: BacktestConfig,
    ) -> Self {
        Self {
            repository,
            prices,
            calendar,
            config,
            state: RunState::NotStarted,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run(&mut self, request: &BacktestRequest) -> Result<BacktestResult, Form13fError> {
        self.state = RunState::NotStarted;
        self.check_request(request)?;

        let start_date = if request.start_date < self.config.min_start_date {
            warn!(
                requested = %request.start_date,
                clamped = %self.config.min_start_date,
                "start date before minimum, clamping"
            );
            self.config.min_start_date
        } else {
            request.start_date
        };

        match self.simulate(request, start_date) {
            Ok(result) => {
                self.state = RunState::Completed;
                Ok(result)
            }
            Err(e) => {
                self.state = RunState::Failed;
                Err(e)
            }
        }
    }

    fn check_request(&self, request: &BacktestRequest) -> Result<(), Form13fError> {
        if request.num_stocks == 0 {
            return Err(Form13fError::ConfigInvalid {
                section: "backtest".into(),
                key: "num_stocks".into(),
                reason: "num_stocks must be at least 1".into(),
            });
        }
        if !(self.config.initial_bank > 0.0) || !self.config.initial_bank.is_finite() {
            return Err(Form13fError::ConfigInvalid {
                section: "backtest".into(),
                key: "initial_bank".into(),
                reason: "initial_bank must be a positive finite number".into(),
            });
        }
        if request.start_date > request.end_date {
            return Err(Form13fError::ConfigInvalid {
                section: "backtest".into(),
                key: "start_date".into(),
                reason: "start_date must not be after end_date".into(),
            });
        }
        Ok(())
    }

    fn simulate(
        &mut self,
        request: &BacktestRequest,
        start_date: NaiveDate,
    ) -> Result<BacktestResult, Form13fError> {
        let mut snapshots =
            self.repository
                .list_snapshots(&request.entity_id, start_date, request.end_date)?;
        snapshots.sort_by(|a, b| a.date.cmp(&b.date).then(a.snapshot_id.cmp(&b.snapshot_id)));
        if snapshots.is_empty() {
            return Err(Form13fError::NoSnapshots {
                entity_id: request.entity_id.clone(),
            });
        }

        let effective_dates = snapshots
            .iter()
            .map(|s| self.calendar.next_trading_day(s.date))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            entity_id = %request.entity_id,
            num_stocks = request.num_stocks,
            snapshots = snapshots.len(),
            "running backtest"
        );

        let resolver = WeightResolver::new(self.prices);
        let engine = RebalanceEngine::new(self.prices);
        let mut portfolio = Portfolio::new(self.config.initial_bank);
        let mut history = Vec::with_capacity(snapshots.len());

        for (index, snapshot) in snapshots.iter().enumerate() {
            self.state = RunState::Running { index };
            let trade_date = effective_dates[index];

            let holdings = self
                .repository
                .get_snapshot_holdings(&snapshot.snapshot_id, &request.entity_id)?;
            let (resolution, outcome) =
                resolver.resolve_escalating(&holdings, request.num_stocks, trade_date)?;
            debug!(snapshot_id = %snapshot.snapshot_id, ?outcome, valid = resolution.weights.len(), "weights resolved");

            // Pre-warm the next cycle; what is missing there is its own problem.
            if let Some(&next_date) = effective_dates.get(index + 1) {
                match self
                    .prices
                    .ensure_available(&resolution.weights.instruments(), next_date)
                {
                    Ok(missing) if !missing.is_empty() => {
                        debug!(date = %next_date, missing = missing.len(), "pre-fetch incomplete, ignored")
                    }
                    Ok(_) => {}
                    Err(e) => debug!(date = %next_date, error = %e, "pre-fetch failed, ignored"),
                }
            }

            let rebalanced = engine.rebalance(&mut portfolio, &resolution.weights, trade_date)?;
            info!(
                snapshot_id = %snapshot.snapshot_id,
                date = %trade_date,
                total = rebalanced.total_value,
                trades = rebalanced.trades.len(),
                "rebalanced"
            );
            history.push(EquityPoint {
                snapshot_id: snapshot.snapshot_id.clone(),
                date: trade_date,
                total_value: rebalanced.total_value,
                positions: portfolio.position_count(),
            });
        }

        let final_value = history
            .last()
            .map(|p| p.total_value)
            .unwrap_or(self.config.initial_bank);

        Ok(BacktestResult {
            entity_id: request.entity_id.clone(),
            num_stocks: request.num_stocks,
            min_date: start_date,
            max_date: request.end_date,
            percent_return: percent_return(final_value, self.config.initial_bank),
            final_value,
            history,
        })
    }
}
