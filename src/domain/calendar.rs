//! Trading calendar derived from canary instruments.
//!
//! A canary is an instrument known to trade every session. A date is an open
//! market day if any canary has a quote on it.

use chrono::{Days, NaiveDate};

use crate::domain::error::Form13fError;
use crate::ports::calendar_port::TradingCalendar;
use crate::ports::price_port::PriceSource;

pub const DEFAULT_CANARIES: [&str; 2] = ["AAPL", "WMT"];
pub const DEFAULT_WINDOW_DAYS: u32 = 7;

pub struct CanaryCalendar<'a> {
    prices: &'a dyn PriceSource,
    canaries: Vec<String>,
    window_days: u32,
}

impl<'a> CanaryCalendar<'a> {
    pub fn new(prices: &'a dyn PriceSource, canaries: Vec<String>, window_days: u32) -> Self {
        Self {
            prices,
            canaries,
            window_days,
        }
    }

    pub fn with_defaults(prices: &'a dyn PriceSource) -> Self {
        Self::new(
            prices,
            DEFAULT_CANARIES.iter().map(|c| c.to_string()).collect(),
            DEFAULT_WINDOW_DAYS,
        )
    }

    fn is_open(&self, date: NaiveDate) -> Result<bool, Form13fError> {
        for canary in &self.canaries {
            if self.prices.exact_price(canary, date)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl TradingCalendar for CanaryCalendar<'_> {
    fn next_trading_day(&self, date: NaiveDate) -> Result<NaiveDate, Form13fError> {
        for offset in 1..=self.window_days {
            let Some(candidate) = date.checked_add_days(Days::new(u64::from(offset))) else {
                break;
            };
            if self.is_open(candidate)? {
                return Ok(candidate);
            }
        }
        Err(Form13fError::CalendarExhausted {
            after: date,
            window_days: self.window_days,
        })
    }
}
