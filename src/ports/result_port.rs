//! Backtest result persistence port.

use crate::domain::backtest::BacktestResult;
use crate::domain::error::Form13fError;

pub trait ResultSink {
    /// Store `result`, replacing any earlier record for the same
    /// (entity, requested position count) pair.
    fn save_result(&self, result: &BacktestResult) -> Result<(), Form13fError>;
}
