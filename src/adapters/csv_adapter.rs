//! CSV file adapters: per-instrument price files and holdings exports.

use crate::domain::cusip::CusipMap;
use crate::domain::error::Form13fError;
use crate::domain::holdings::{Filing, Holding, SecurityType};
use crate::ports::price_port::PriceSource;
use chrono::NaiveDate;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type Series = Vec<(NaiveDate, f64)>;

/// Price source over a directory of `<INSTRUMENT>.csv` files with a
/// `date,open[,...]` header. Series are loaded lazily and kept in memory.
pub struct CsvAdapter {
    base_path: PathBuf,
    cache: RefCell<HashMap<String, Series>>,
}

fn import_err(source: &Path, reason: impl Into<String>) -> Form13fError {
    Form13fError::Import {
        source_name: source.display().to_string(),
        reason: reason.into(),
    }
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            cache: RefCell::new(HashMap::new()),
        }
    }

    fn csv_path(&self, instrument: &str) -> PathBuf {
        self.base_path.join(format!("{}.csv", instrument))
    }

    /// Opening prices for `instrument`, sorted by date. Rows with a blank
    /// open are provider gaps and are skipped.
    pub fn read_prices(&self, instrument: &str) -> Result<Series, Form13fError> {
        let path = self.csv_path(instrument);
        let content = fs::read_to_string(&path)
            .map_err(|e| import_err(&path, format!("failed to read: {}", e)))?;

        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let mut series = Vec::new();

        for (line, result) in rdr.records().enumerate() {
            let record =
                result.map_err(|e| import_err(&path, format!("CSV parse error: {}", e)))?;

            let date_str = record
                .get(0)
                .ok_or_else(|| import_err(&path, format!("row {}: missing date column", line + 1)))?;
            let date = NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d").map_err(|e| {
                import_err(&path, format!("row {}: invalid date format: {}", line + 1, e))
            })?;

            let open_str = record
                .get(1)
                .ok_or_else(|| import_err(&path, format!("row {}: missing open column", line + 1)))?
                .trim();
            if open_str.is_empty() {
                continue;
            }
            let open: f64 = open_str.parse().map_err(|e| {
                import_err(&path, format!("row {}: invalid open value: {}", line + 1, e))
            })?;

            series.push((date, open));
        }

        series.sort_by_key(|(date, _)| *date);
        series.dedup_by_key(|(date, _)| *date);
        Ok(series)
    }

    /// Instruments with a price file in the base directory, sorted.
    pub fn list_instruments(&self) -> Result<Vec<String>, Form13fError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| {
            import_err(&self.base_path, format!("failed to read directory: {}", e))
        })?;

        let mut instruments = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                instruments.push(stem.to_string());
            }
        }

        instruments.sort();
        Ok(instruments)
    }

    fn with_series<T>(
        &self,
        instrument: &str,
        f: impl FnOnce(&Series) -> T,
    ) -> Result<Option<T>, Form13fError> {
        if let Some(series) = self.cache.borrow().get(instrument) {
            return Ok(Some(f(series)));
        }
        if !self.csv_path(instrument).is_file() {
            return Ok(None);
        }
        let series = self.read_prices(instrument)?;
        debug!(instrument, rows = series.len(), "loaded price file");
        let value = f(&series);
        self.cache.borrow_mut().insert(instrument.to_string(), series);
        Ok(Some(value))
    }
}

impl PriceSource for CsvAdapter {
    fn exact_price(&self, instrument: &str, date: NaiveDate) -> Result<Option<f64>, Form13fError> {
        let found = self.with_series(instrument, |series| {
            series
                .binary_search_by_key(&date, |(d, _)| *d)
                .ok()
                .map(|i| series[i].1)
        })?;
        Ok(found.flatten())
    }

    fn recent_prior_price(
        &self,
        instrument: &str,
        date: NaiveDate,
    ) -> Result<Option<f64>, Form13fError> {
        let found = self.with_series(instrument, |series| {
            let idx = series.partition_point(|(d, _)| *d < date);
            idx.checked_sub(1).map(|i| series[i].1)
        })?;
        Ok(found.flatten())
    }
}

/// Read a holdings export with the header
/// `snapshot_id,date,cusip,name,security_type,value,units`, one row per line
/// item, into one [`Filing`] per snapshot ordered by date.
///
/// With a `cusip_map`, the `cusip` column is translated to a ticker; without
/// one it is taken as the instrument identifier verbatim.
pub fn read_holdings_csv(
    path: &Path,
    entity_id: &str,
    cusip_map: Option<&CusipMap>,
) -> Result<Vec<Filing>, Form13fError> {
    let content =
        fs::read_to_string(path).map_err(|e| import_err(path, format!("failed to read: {}", e)))?;
    let mut rdr = csv::Reader::from_reader(content.as_bytes());

    let mut grouped: BTreeMap<String, (NaiveDate, Vec<Holding>)> = BTreeMap::new();

    for (line, result) in rdr.records().enumerate() {
        let row = line + 1;
        let record = result.map_err(|e| import_err(path, format!("CSV parse error: {}", e)))?;
        let field = |idx: usize, name: &str| {
            record
                .get(idx)
                .map(str::trim)
                .ok_or_else(|| import_err(path, format!("row {}: missing {} column", row, name)))
        };

        let snapshot_id = field(0, "snapshot_id")?;
        let date = NaiveDate::parse_from_str(field(1, "date")?, "%Y-%m-%d")
            .map_err(|e| import_err(path, format!("row {}: invalid date format: {}", row, e)))?;
        let raw_id = field(2, "cusip")?;
        let instrument = match cusip_map {
            Some(map) => map.resolve(raw_id),
            None => raw_id.to_string(),
        };
        let security_type: SecurityType = field(4, "security_type")?
            .parse()
            .map_err(|e: String| import_err(path, format!("row {}: {}", row, e)))?;
        let value: f64 = field(5, "value")?
            .parse()
            .map_err(|e| import_err(path, format!("row {}: invalid value: {}", row, e)))?;
        let units: i64 = field(6, "units")?
            .parse()
            .map_err(|e| import_err(path, format!("row {}: invalid units: {}", row, e)))?;

        let holding = Holding {
            instrument,
            name: field(3, "name")?.to_string(),
            security_type,
            value,
            units,
        };

        let entry = grouped
            .entry(snapshot_id.to_string())
            .or_insert_with(|| (date, Vec::new()));
        if entry.0 != date {
            return Err(import_err(
                path,
                format!(
                    "row {}: snapshot {} dated both {} and {}",
                    row, snapshot_id, entry.0, date
                ),
            ));
        }
        entry.1.push(holding);
    }

    let mut filings: Vec<Filing> = grouped
        .into_iter()
        .map(|(snapshot_id, (date, lines))| Filing::new(entity_id, snapshot_id, date, lines))
        .collect();
    filings.sort_by(|a, b| a.date.cmp(&b.date).then(a.snapshot_id.cmp(&b.snapshot_id)));
    Ok(filings)
}

/// Build a CUSIP map from every file in a fails-to-deliver directory.
/// Files are merged in name order, so later files win on conflicts.
pub fn load_cusip_dir(dir: &Path) -> Result<CusipMap, Form13fError> {
    let mut paths = Vec::new();
    for entry in
        fs::read_dir(dir).map_err(|e| import_err(dir, format!("failed to read directory: {}", e)))?
    {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut map = CusipMap::new();
    for path in &paths {
        let file = fs::File::open(path)?;
        let added = map.load_fails_file(BufReader::new(file), &path.display().to_string())?;
        debug!(file = %path.display(), added, "loaded fails-to-deliver file");
    }
    info!(files = paths.len(), cusips = map.len(), "CUSIP map ready");
    Ok(map)
}
