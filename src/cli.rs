//! CLI definition and dispatch.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

use crate::adapters::csv_adapter::{CsvAdapter, load_cusip_dir, read_holdings_csv};
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::sqlite_adapter::SqliteAdapter;
use crate::domain::backtest::{
    BacktestConfig, BacktestRequest, BacktestResult, BacktestRunner, DEFAULT_INITIAL_BANK,
    default_min_start_date,
};
use crate::domain::calendar::{CanaryCalendar, DEFAULT_CANARIES, DEFAULT_WINDOW_DAYS};
use crate::domain::config_validation::{parse_date, parse_num_stocks, validate_backtest_config};
use crate::domain::error::Form13fError;
use crate::domain::holdings::filing_gains;
use crate::ports::calendar_port::TradingCalendar;
use crate::ports::config_port::ConfigPort;
use crate::ports::holdings_port::HoldingsRepository;
use crate::ports::price_port::PriceSource;
use crate::ports::result_port::ResultSink;

#[derive(Parser, Debug)]
#[command(name = "form13f", about = "Follow-the-filer backtester for 13F holdings")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one backtest per requested position count
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Overrides [backtest] entity_id
        #[arg(long)]
        entity: Option<String>,
        /// Overrides [backtest] num_stocks, e.g. 5,9,30
        #[arg(long)]
        num_stocks: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the first open session strictly after a date
    NextTradingDay {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        date: NaiveDate,
    },
    /// Show stored snapshots and results for an entity
    Info {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        entity: String,
    },
    /// Load <INSTRUMENT>.csv price files from a directory
    ImportPrices {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        dir: PathBuf,
    },
    /// Load a holdings CSV for an entity
    ImportHoldings {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        file: PathBuf,
        /// Directory of SEC fails-to-deliver files used to map CUSIPs to tickers
        #[arg(long)]
        cusip_map: Option<PathBuf>,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let outcome = match cli.command {
        Command::Backtest {
            config,
            entity,
            num_stocks,
            dry_run,
            json,
        } => load_config(&config).and_then(|adapter| {
            let overrides = ConfigOverrides::new(&adapter)
                .set("backtest", "entity_id", entity.as_deref())
                .set("backtest", "num_stocks", num_stocks.as_deref());
            if dry_run {
                run_dry_run(&overrides)
            } else {
                run_backtest(&overrides, json)
            }
        }),
        Command::NextTradingDay { config, date } => {
            load_config(&config).and_then(|adapter| run_next_trading_day(&adapter, date))
        }
        Command::Info { config, entity } => {
            load_config(&config).and_then(|adapter| run_info(&adapter, &entity))
        }
        Command::ImportPrices { config, dir } => {
            load_config(&config).and_then(|adapter| run_import_prices(&adapter, &dir))
        }
        Command::ImportHoldings {
            config,
            entity,
            file,
            cusip_map,
        } => load_config(&config).and_then(|adapter| {
            run_import_holdings(&adapter, &entity, &file, cusip_map.as_deref())
        }),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = ?e.kind(), "command failed");
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, Form13fError> {
    info!(path = %path.display(), "loading config");
    FileConfigAdapter::from_file(path)
}

/// Command-line values layered over a config file.
pub struct ConfigOverrides<'a> {
    base: &'a dyn ConfigPort,
    values: Vec<(&'static str, &'static str, String)>,
}

impl<'a> ConfigOverrides<'a> {
    pub fn new(base: &'a dyn ConfigPort) -> Self {
        Self {
            base,
            values: Vec::new(),
        }
    }

    pub fn set(mut self, section: &'static str, key: &'static str, value: Option<&str>) -> Self {
        if let Some(v) = value {
            self.values.push((section, key, v.to_string()));
        }
        self
    }

    fn lookup(&self, section: &str, key: &str) -> Option<&str> {
        self.values
            .iter()
            .rev()
            .find(|(s, k, _)| *s == section && *k == key)
            .map(|(_, _, v)| v.as_str())
    }
}

impl ConfigPort for ConfigOverrides<'_> {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        match self.lookup(section, key) {
            Some(v) => Some(v.to_string()),
            None => self.base.get_string(section, key),
        }
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.lookup(section, key) {
            Some(v) => v.trim().parse().unwrap_or(default),
            None => self.base.get_int(section, key, default),
        }
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        match self.lookup(section, key) {
            Some(v) => v.trim().parse().unwrap_or(default),
            None => self.base.get_double(section, key, default),
        }
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.lookup(section, key) {
            Some(v) => match v.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => true,
                "false" | "no" | "0" => false,
                _ => default,
            },
            None => self.base.get_bool(section, key, default),
        }
    }
}

pub fn build_backtest_config(config: &dyn ConfigPort) -> Result<BacktestConfig, Form13fError> {
    let min_start_date = match config.get_string("backtest", "min_start_date") {
        Some(raw) => parse_date(Some(&raw), "min_start_date")?,
        None => default_min_start_date(),
    };
    Ok(BacktestConfig {
        initial_bank: config.get_double("backtest", "initial_bank", DEFAULT_INITIAL_BANK),
        min_start_date,
    })
}

/// One request per distinct count in `[backtest] num_stocks`, in listed order.
pub fn build_requests(config: &dyn ConfigPort) -> Result<Vec<BacktestRequest>, Form13fError> {
    let entity_id = config
        .get_string("backtest", "entity_id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Form13fError::ConfigMissing {
            section: "backtest".into(),
            key: "entity_id".into(),
        })?;
    let raw_counts =
        config
            .get_string("backtest", "num_stocks")
            .ok_or_else(|| Form13fError::ConfigMissing {
                section: "backtest".into(),
                key: "num_stocks".into(),
            })?;
    let start_date = parse_date(
        config.get_string("backtest", "start_date").as_deref(),
        "start_date",
    )?;
    let end_date = parse_date(
        config.get_string("backtest", "end_date").as_deref(),
        "end_date",
    )?;

    Ok(parse_num_stocks(&raw_counts)?
        .into_iter()
        .map(|num_stocks| BacktestRequest {
            entity_id: entity_id.clone(),
            num_stocks,
            start_date,
            end_date,
        })
        .collect())
}

pub fn build_calendar<'a>(
    config: &dyn ConfigPort,
    prices: &'a dyn PriceSource,
) -> Result<CanaryCalendar<'a>, Form13fError> {
    let canaries = config
        .get_list("calendar", "canaries")
        .unwrap_or_else(|| DEFAULT_CANARIES.iter().map(|c| c.to_string()).collect());
    let window_days = config.get_int("calendar", "window_days", DEFAULT_WINDOW_DAYS.into());
    let window_days = u32::try_from(window_days)
        .ok()
        .filter(|w| *w >= 1)
        .ok_or_else(|| Form13fError::ConfigInvalid {
            section: "calendar".into(),
            key: "window_days".into(),
            reason: "window_days must be at least 1".into(),
        })?;
    Ok(CanaryCalendar::new(prices, canaries, window_days))
}

fn open_database(config: &dyn ConfigPort) -> Result<SqliteAdapter, Form13fError> {
    let db = SqliteAdapter::from_config(config)?;
    db.initialize_schema()?;
    Ok(db)
}

/// Price files named by `[prices] csv_dir`, read in place of the database's
/// price table when set.
fn price_files(config: &dyn ConfigPort) -> Result<Option<CsvAdapter>, Form13fError> {
    let Some(dir) = config.get_string("prices", "csv_dir") else {
        return Ok(None);
    };
    let dir = PathBuf::from(dir);
    if !dir.is_dir() {
        return Err(Form13fError::ConfigInvalid {
            section: "prices".into(),
            key: "csv_dir".into(),
            reason: format!("{} is not a directory", dir.display()),
        });
    }
    info!(dir = %dir.display(), "reading prices from CSV files");
    Ok(Some(CsvAdapter::new(dir)))
}

/// Run every request independently, each from a fresh portfolio, and persist
/// each result as soon as it completes.
pub fn run_sweep(
    repository: &dyn HoldingsRepository,
    prices: &dyn PriceSource,
    calendar: &dyn TradingCalendar,
    sink: &dyn ResultSink,
    config: &BacktestConfig,
    requests: &[BacktestRequest],
) -> Result<Vec<BacktestResult>, Form13fError> {
    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
        let mut runner = BacktestRunner::new(repository, prices, calendar, config.clone());
        let result = runner.run(request)?;
        sink.save_result(&result)?;
        info!(
            entity_id = %result.entity_id,
            num_stocks = result.num_stocks,
            percent_return = result.percent_return,
            "backtest complete"
        );
        results.push(result);
    }
    Ok(results)
}

pub fn run_backtest(config: &dyn ConfigPort, json: bool) -> Result<(), Form13fError> {
    validate_backtest_config(config)?;
    let backtest_config = build_backtest_config(config)?;
    let requests = build_requests(config)?;

    let db = open_database(config)?;
    let files = price_files(config)?;
    let prices: &dyn PriceSource = match &files {
        Some(files) => files,
        None => &db,
    };
    let calendar = build_calendar(config, prices)?;
    let results = run_sweep(&db, prices, &calendar, &db, &backtest_config, &requests)?;

    if json {
        let out = serde_json::to_string_pretty(&results).map_err(std::io::Error::from)?;
        println!("{out}");
    } else {
        print_results(&results);
    }
    Ok(())
}

fn print_results(results: &[BacktestResult]) {
    let Some(first) = results.first() else {
        return;
    };
    println!(
        "entity {}  {} .. {}",
        first.entity_id, first.min_date, first.max_date
    );
    println!("{:>10}  {:>9}  {:>14}  {:>10}", "num_stocks", "return", "final_value", "rebalances");
    for r in results {
        println!(
            "{:>10}  {:>8.2}%  {:>14.2}  {:>10}",
            r.num_stocks,
            r.percent_return,
            r.final_value,
            r.history.len()
        );
    }
}

pub fn run_dry_run(config: &dyn ConfigPort) -> Result<(), Form13fError> {
    validate_backtest_config(config)?;
    let backtest_config = build_backtest_config(config)?;
    let requests = build_requests(config)?;

    println!("Config validated successfully");
    println!("  initial bank:   {:.2}", backtest_config.initial_bank);
    println!("  min start date: {}", backtest_config.min_start_date);
    for request in &requests {
        if request.start_date < backtest_config.min_start_date {
            warn!(
                requested = %request.start_date,
                clamped = %backtest_config.min_start_date,
                "start date before minimum, will be clamped"
            );
        }
        println!(
            "  run: entity {} num_stocks {} from {} to {}",
            request.entity_id,
            request.num_stocks,
            request.start_date.max(backtest_config.min_start_date),
            request.end_date
        );
    }
    Ok(())
}

fn run_next_trading_day(config: &dyn ConfigPort, date: NaiveDate) -> Result<(), Form13fError> {
    let db = open_database(config)?;
    let files = price_files(config)?;
    let prices: &dyn PriceSource = match &files {
        Some(files) => files,
        None => &db,
    };
    let calendar = build_calendar(config, prices)?;
    println!("{}", calendar.next_trading_day(date)?);
    Ok(())
}

fn run_info(config: &dyn ConfigPort, entity_id: &str) -> Result<(), Form13fError> {
    let db = open_database(config)?;
    let summaries = db.filing_summaries(entity_id)?;
    if summaries.is_empty() {
        return Err(Form13fError::NoSnapshots {
            entity_id: entity_id.to_string(),
        });
    }

    let gains = filing_gains(&summaries);
    println!("entity {}: {} snapshots", entity_id, summaries.len());
    println!(
        "{:<10}  {:<22}  {:>8}  {:>16}  {:>16}  {:>16}",
        "date", "snapshot", "holdings", "share_value", "total_value", "gain"
    );
    for (summary, (_, gain)) in summaries.iter().zip(gains.iter()) {
        let gain = gain.map(|g| format!("{g:.2}")).unwrap_or_else(|| "-".into());
        println!(
            "{:<10}  {:<22}  {:>8}  {:>16.2}  {:>16.2}  {:>16}",
            summary.date.to_string(),
            summary.snapshot_id,
            summary.holding_count,
            summary.share_value,
            summary.total_value,
            gain
        );
    }

    let saved = db.saved_results(entity_id)?;
    if !saved.is_empty() {
        println!("\nsaved backtests:");
        for r in saved {
            println!(
                "  num_stocks {:>3}  {} .. {}  {:>8.2}%  {:.2}",
                r.num_stocks, r.min_date, r.max_date, r.percent_return, r.final_value
            );
        }
    }
    Ok(())
}

pub fn run_import_prices(config: &dyn ConfigPort, dir: &Path) -> Result<(), Form13fError> {
    let db = open_database(config)?;
    let csv = CsvAdapter::new(dir.to_path_buf());

    let instruments = csv.list_instruments()?;
    let mut total = 0;
    for instrument in &instruments {
        let series = csv.read_prices(instrument)?;
        let inserted = db.insert_prices(instrument, &series)?;
        info!(instrument = %instrument, rows = inserted, "imported prices");
        total += inserted;
    }

    println!(
        "imported {} price rows for {} instruments",
        total,
        instruments.len()
    );
    Ok(())
}

pub fn run_import_holdings(
    config: &dyn ConfigPort,
    entity_id: &str,
    file: &Path,
    cusip_dir: Option<&Path>,
) -> Result<(), Form13fError> {
    let db = open_database(config)?;
    let cusip_map = cusip_dir.map(load_cusip_dir).transpose()?;
    let filings = read_holdings_csv(file, entity_id, cusip_map.as_ref())?;

    for filing in &filings {
        db.insert_filing(filing)?;
        info!(
            snapshot_id = %filing.snapshot_id,
            date = %filing.date,
            holdings = filing.holding_count(),
            "imported filing"
        );
    }

    println!("imported {} filings for entity {}", filings.len(), entity_id);
    Ok(())
}
