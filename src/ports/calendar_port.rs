//! Trading calendar port.

use crate::domain::error::Form13fError;
use chrono::NaiveDate;

pub trait TradingCalendar {
    /// First open-market session strictly after `date`.
    ///
    /// Fails with [`Form13fError::CalendarExhausted`] when nothing is found within
    /// the calendar's forward window.
    fn next_trading_day(&self, date: NaiveDate) -> Result<NaiveDate, Form13fError>;
}
