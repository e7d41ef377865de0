//! Historical price lookup port.

use crate::domain::error::Form13fError;
use chrono::NaiveDate;

/// Resolves an instrument's opening price from an immutable daily series.
///
/// `Ok(None)` means the series has no usable quote; `Err` is reserved for
/// infrastructure faults (a broken database, an unreadable file).
pub trait PriceSource {
    /// Opening price on exactly `date`.
    fn exact_price(&self, instrument: &str, date: NaiveDate) -> Result<Option<f64>, Form13fError>;

    /// Most recent opening price strictly before `date`.
    fn recent_prior_price(
        &self,
        instrument: &str,
        date: NaiveDate,
    ) -> Result<Option<f64>, Form13fError>;

    /// Make sure quotes for `date` are present, returning the instruments that
    /// still have no exact price afterwards.
    ///
    /// Sources backed by a remote provider can override this to fetch missing
    /// series; the default only checks what is already stored.
    fn ensure_available(
        &self,
        instruments: &[String],
        date: NaiveDate,
    ) -> Result<Vec<String>, Form13fError> {
        let mut missing = Vec::new();
        for instrument in instruments {
            if self.exact_price(instrument, date)?.is_none() {
                missing.push(instrument.clone());
            }
        }
        Ok(missing)
    }
}
