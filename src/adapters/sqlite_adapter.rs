//! SQLite storage adapter for prices, filings and backtest results.

use crate::domain::backtest::BacktestResult;
use crate::domain::error::Form13fError;
use crate::domain::holdings::{Filing, FilingSummary, HoldingsMap, SecurityType, SnapshotRef};
use crate::ports::config_port::ConfigPort;
use crate::ports::holdings_port::HoldingsRepository;
use crate::ports::price_port::PriceSource;
use crate::ports::result_port::ResultSink;
use chrono::NaiveDate;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A stored backtest outcome, one per (entity, requested position count).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedResult {
    pub num_stocks: usize,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub percent_return: f64,
    pub final_value: f64,
}

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

fn query_err(e: rusqlite::Error) -> Form13fError {
    Form13fError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date_column(raw: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            raw.len(),
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, Form13fError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| Form13fError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;

        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;

        let manager = SqliteConnectionManager::file(&db_path);
        let pool =
            Pool::builder()
                .max_size(pool_size)
                .build(manager)
                .map_err(|e: r2d2::Error| Form13fError::Database {
                    reason: e.to_string(),
                })?;

        debug!(path = %db_path, pool_size, "opened sqlite pool");
        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, Form13fError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e: r2d2::Error| Form13fError::Database {
                reason: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>, Form13fError> {
        self.pool
            .get()
            .map_err(|e: r2d2::Error| Form13fError::Database {
                reason: e.to_string(),
            })
    }

    pub fn initialize_schema(&self) -> Result<(), Form13fError> {
        let conn = self.connection()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS prices (
                instrument TEXT NOT NULL,
                date TEXT NOT NULL,
                open REAL NOT NULL,
                PRIMARY KEY (instrument, date)
            );
            CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                date TEXT NOT NULL,
                PRIMARY KEY (snapshot_id, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_entity_date ON snapshots(entity_id, date);
            CREATE TABLE IF NOT EXISTS holdings (
                snapshot_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                instrument TEXT NOT NULL,
                name TEXT NOT NULL,
                security_type TEXT NOT NULL,
                value REAL NOT NULL,
                units INTEGER NOT NULL,
                PRIMARY KEY (snapshot_id, entity_id, instrument, security_type)
            );
            CREATE TABLE IF NOT EXISTS backtest_results (
                entity_id TEXT NOT NULL,
                num_stocks INTEGER NOT NULL,
                min_date TEXT NOT NULL,
                max_date TEXT NOT NULL,
                percent_return REAL NOT NULL,
                final_value REAL NOT NULL,
                PRIMARY KEY (entity_id, num_stocks)
            );",
        )
        .map_err(query_err)?;

        Ok(())
    }

    /// Store an instrument's daily opening prices. Existing dates are overwritten.
    pub fn insert_prices(
        &self,
        instrument: &str,
        series: &[(NaiveDate, f64)],
    ) -> Result<usize, Form13fError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(query_err)?;

        for (date, open) in series {
            tx.execute(
                "INSERT OR REPLACE INTO prices (instrument, date, open) VALUES (?1, ?2, ?3)",
                params![instrument, fmt_date(*date), open],
            )
            .map_err(query_err)?;
        }

        tx.commit().map_err(query_err)?;
        Ok(series.len())
    }

    /// Store a filing, replacing any earlier import of the same snapshot.
    pub fn insert_filing(&self, filing: &Filing) -> Result<(), Form13fError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(query_err)?;

        tx.execute(
            "INSERT OR REPLACE INTO snapshots (snapshot_id, entity_id, date) VALUES (?1, ?2, ?3)",
            params![filing.snapshot_id, filing.entity_id, fmt_date(filing.date)],
        )
        .map_err(query_err)?;
        tx.execute(
            "DELETE FROM holdings WHERE snapshot_id = ?1 AND entity_id = ?2",
            params![filing.snapshot_id, filing.entity_id],
        )
        .map_err(query_err)?;

        for holding in &filing.holdings {
            tx.execute(
                "INSERT INTO holdings (snapshot_id, entity_id, instrument, name, security_type, value, units)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    filing.snapshot_id,
                    filing.entity_id,
                    holding.instrument,
                    holding.name,
                    holding.security_type.as_str(),
                    holding.value,
                    holding.units
                ],
            )
            .map_err(query_err)?;
        }

        tx.commit().map_err(query_err)?;
        Ok(())
    }

    /// Per-snapshot totals for `entity_id`, oldest first.
    pub fn filing_summaries(&self, entity_id: &str) -> Result<Vec<FilingSummary>, Form13fError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT s.snapshot_id, s.date, COUNT(h.instrument),
                        COALESCE(SUM(CASE WHEN h.security_type = ?2 THEN h.value ELSE 0.0 END), 0.0),
                        COALESCE(SUM(h.value), 0.0)
                 FROM snapshots s
                 LEFT JOIN holdings h
                   ON h.snapshot_id = s.snapshot_id AND h.entity_id = s.entity_id
                 WHERE s.entity_id = ?1
                 GROUP BY s.snapshot_id, s.date
                 ORDER BY s.date ASC, s.snapshot_id ASC",
            )
            .map_err(query_err)?;

        let rows = stmt
            .query_map(params![entity_id, SecurityType::Share.as_str()], |row| {
                let count: i64 = row.get(2)?;
                Ok(FilingSummary {
                    snapshot_id: row.get(0)?,
                    date: parse_date_column(row.get(1)?)?,
                    holding_count: count as usize,
                    share_value: row.get(3)?,
                    total_value: row.get(4)?,
                })
            })
            .map_err(query_err)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    /// First date, last date and number of stored quotes for `instrument`.
    pub fn price_range(
        &self,
        instrument: &str,
    ) -> Result<Option<(NaiveDate, NaiveDate, usize)>, Form13fError> {
        let conn = self.connection()?;

        let result: (Option<String>, Option<String>, i64) = conn
            .query_row(
                "SELECT MIN(date), MAX(date), COUNT(*) FROM prices WHERE instrument = ?1",
                params![instrument],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(query_err)?;

        match result {
            (Some(min_str), Some(max_str), count) if count > 0 => {
                let min = parse_date_column(min_str).map_err(query_err)?;
                let max = parse_date_column(max_str).map_err(query_err)?;
                Ok(Some((min, max, count as usize)))
            }
            _ => Ok(None),
        }
    }

    pub fn saved_results(&self, entity_id: &str) -> Result<Vec<SavedResult>, Form13fError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT num_stocks, min_date, max_date, percent_return, final_value
                 FROM backtest_results WHERE entity_id = ?1 ORDER BY num_stocks ASC",
            )
            .map_err(query_err)?;

        let rows = stmt
            .query_map(params![entity_id], |row| {
                let num_stocks: i64 = row.get(0)?;
                Ok(SavedResult {
                    num_stocks: num_stocks as usize,
                    min_date: parse_date_column(row.get(1)?)?,
                    max_date: parse_date_column(row.get(2)?)?,
                    percent_return: row.get(3)?,
                    final_value: row.get(4)?,
                })
            })
            .map_err(query_err)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn price_query(
        &self,
        query: &str,
        instrument: &str,
        date: NaiveDate,
    ) -> Result<Option<f64>, Form13fError> {
        let conn = self.connection()?;
        conn.query_row(query, params![instrument, fmt_date(date)], |row| row.get(0))
            .optional()
            .map_err(query_err)
    }
}

impl PriceSource for SqliteAdapter {
    fn exact_price(&self, instrument: &str, date: NaiveDate) -> Result<Option<f64>, Form13fError> {
        self.price_query(
            "SELECT open FROM prices WHERE instrument = ?1 AND date = ?2",
            instrument,
            date,
        )
    }

    fn recent_prior_price(
        &self,
        instrument: &str,
        date: NaiveDate,
    ) -> Result<Option<f64>, Form13fError> {
        self.price_query(
            "SELECT open FROM prices WHERE instrument = ?1 AND date < ?2
             ORDER BY date DESC LIMIT 1",
            instrument,
            date,
        )
    }
}

impl HoldingsRepository for SqliteAdapter {
    fn list_snapshots(
        &self,
        entity_id: &str,
        min_date: NaiveDate,
        max_date: NaiveDate,
    ) -> Result<Vec<SnapshotRef>, Form13fError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT snapshot_id, date FROM snapshots
                 WHERE entity_id = ?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date ASC, snapshot_id ASC",
            )
            .map_err(query_err)?;

        let rows = stmt
            .query_map(
                params![entity_id, fmt_date(min_date), fmt_date(max_date)],
                |row| {
                    Ok(SnapshotRef {
                        snapshot_id: row.get(0)?,
                        date: parse_date_column(row.get(1)?)?,
                    })
                },
            )
            .map_err(query_err)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn get_snapshot_holdings(
        &self,
        snapshot_id: &str,
        entity_id: &str,
    ) -> Result<HoldingsMap, Form13fError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT instrument, SUM(value) FROM holdings
                 WHERE snapshot_id = ?1 AND entity_id = ?2 AND security_type = ?3
                 GROUP BY instrument",
            )
            .map_err(query_err)?;

        let rows = stmt
            .query_map(
                params![snapshot_id, entity_id, SecurityType::Share.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )
            .map_err(query_err)?;

        rows.collect::<Result<HoldingsMap, _>>().map_err(query_err)
    }
}

impl ResultSink for SqliteAdapter {
    fn save_result(&self, result: &BacktestResult) -> Result<(), Form13fError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO backtest_results
                 (entity_id, num_stocks, min_date, max_date, percent_return, final_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (entity_id, num_stocks) DO UPDATE SET
                 min_date = excluded.min_date,
                 max_date = excluded.max_date,
                 percent_return = excluded.percent_return,
                 final_value = excluded.final_value",
            params![
                result.entity_id,
                result.num_stocks as i64,
                fmt_date(result.min_date),
                fmt_date(result.max_date),
                result.percent_return,
                result.final_value
            ],
        )
        .map_err(query_err)?;
        Ok(())
    }
}
