//! Holdings snapshot repository port.

use crate::domain::error::Form13fError;
use crate::domain::holdings::{HoldingsMap, SnapshotRef};
use chrono::NaiveDate;

pub trait HoldingsRepository {
    /// Snapshots for `entity_id` with `min_date <= date <= max_date`, in
    /// ascending date order.
    fn list_snapshots(
        &self,
        entity_id: &str,
        min_date: NaiveDate,
        max_date: NaiveDate,
    ) -> Result<Vec<SnapshotRef>, Form13fError>;

    /// Share-class holdings of one snapshot, instrument -> disclosed value.
    fn get_snapshot_holdings(
        &self,
        snapshot_id: &str,
        entity_id: &str,
    ) -> Result<HoldingsMap, Form13fError>;
}
