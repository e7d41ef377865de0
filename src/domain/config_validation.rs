//! Configuration validation.
//!
//! Validates all config fields before any backtest runs.

use crate::domain::error::Form13fError;
use crate::ports::config_port::ConfigPort;
use chrono::NaiveDate;

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), Form13fError> {
    validate_initial_bank(config)?;
    validate_entity(config)?;
    validate_num_stocks(config)?;
    validate_dates(config)?;
    validate_calendar(config)?;
    Ok(())
}

fn validate_initial_bank(config: &dyn ConfigPort) -> Result<(), Form13fError> {
    let value = config.get_double("backtest", "initial_bank", 100_000.0);
    if !(value > 0.0) || !value.is_finite() {
        return Err(Form13fError::ConfigInvalid {
            section: "backtest".to_string(),
            key: "initial_bank".to_string(),
            reason: "initial_bank must be a positive finite number".to_string(),
        });
    }
    Ok(())
}

fn validate_entity(config: &dyn ConfigPort) -> Result<(), Form13fError> {
    match config.get_string("backtest", "entity_id") {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(Form13fError::ConfigMissing {
            section: "backtest".to_string(),
            key: "entity_id".to_string(),
        }),
    }
}

fn validate_num_stocks(config: &dyn ConfigPort) -> Result<(), Form13fError> {
    let raw = config.get_string("backtest", "num_stocks");
    match raw {
        None => Err(Form13fError::ConfigMissing {
            section: "backtest".to_string(),
            key: "num_stocks".to_string(),
        }),
        Some(s) => parse_num_stocks(&s).map(|_| ()),
    }
}

/// Parse a comma-separated list of requested position counts, e.g. `5,9,30`.
pub fn parse_num_stocks(raw: &str) -> Result<Vec<usize>, Form13fError> {
    let invalid = |reason: String| Form13fError::ConfigInvalid {
        section: "backtest".to_string(),
        key: "num_stocks".to_string(),
        reason,
    };

    let mut counts = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(invalid("empty entry in num_stocks".to_string()));
        }
        let count: usize = token
            .parse()
            .map_err(|_| invalid(format!("'{token}' is not a whole number")))?;
        if count == 0 {
            return Err(invalid("num_stocks must be at least 1".to_string()));
        }
        if !counts.contains(&count) {
            counts.push(count);
        }
    }
    Ok(counts)
}

fn validate_dates(config: &dyn ConfigPort) -> Result<(), Form13fError> {
    let start_date = parse_date(
        config.get_string("backtest", "start_date").as_deref(),
        "start_date",
    )?;
    let end_date = parse_date(
        config.get_string("backtest", "end_date").as_deref(),
        "end_date",
    )?;

    if start_date > end_date {
        return Err(Form13fError::ConfigInvalid {
            section: "backtest".to_string(),
            key: "start_date".to_string(),
            reason: "start_date must not be after end_date".to_string(),
        });
    }

    if let Some(raw) = config.get_string("backtest", "min_start_date") {
        parse_date(Some(&raw), "min_start_date")?;
    }
    Ok(())
}

pub fn parse_date(value: Option<&str>, field: &str) -> Result<NaiveDate, Form13fError> {
    match value {
        None => Err(Form13fError::ConfigMissing {
            section: "backtest".to_string(),
            key: field.to_string(),
        }),
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
            Form13fError::ConfigInvalid {
                section: "backtest".to_string(),
                key: field.to_string(),
                reason: format!("invalid {} format, expected YYYY-MM-DD", field),
            }
        }),
    }
}

fn validate_calendar(config: &dyn ConfigPort) -> Result<(), Form13fError> {
    if let Some(canaries) = config.get_list("calendar", "canaries") {
        if canaries.is_empty() {
            return Err(Form13fError::ConfigInvalid {
                section: "calendar".to_string(),
                key: "canaries".to_string(),
                reason: "at least one canary instrument is required".to_string(),
            });
        }
    }
    if config.get_int("calendar", "window_days", 7) < 1 {
        return Err(Form13fError::ConfigInvalid {
            section: "calendar".to_string(),
            key: "window_days".to_string(),
            reason: "window_days must be at least 1".to_string(),
        });
    }
    Ok(())
}
