//! Domain error types.

use chrono::NaiveDate;

/// Broad classification used when deciding how a failure surfaces to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unrecoverable gap in historical data; aborts the run.
    Data,
    /// Rejected before any run starts.
    Configuration,
    /// Storage, file or import failures outside the simulation itself.
    Infrastructure,
}

/// Top-level error type for form13f.
#[derive(Debug, thiserror::Error)]
pub enum Form13fError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("import error in {source_name}: {reason}")]
    Import { source_name: String, reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("no opening price for {instrument} on {date}; cannot buy without same-day data")]
    MissingBuyPrice { instrument: String, date: NaiveDate },

    #[error("cannot value {instrument} on {date}: no price on or before that date")]
    MissingSalePrice { instrument: String, date: NaiveDate },

    #[error("no open market session within {window_days} days after {after}; update the trading calendar")]
    CalendarExhausted { after: NaiveDate, window_days: u32 },

    #[error("no holdings snapshots for entity {entity_id} in the requested window")]
    NoSnapshots { entity_id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Form13fError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Form13fError::MissingBuyPrice { .. }
            | Form13fError::MissingSalePrice { .. }
            | Form13fError::CalendarExhausted { .. }
            | Form13fError::NoSnapshots { .. } => ErrorKind::Data,
            Form13fError::ConfigParse { .. }
            | Form13fError::ConfigMissing { .. }
            | Form13fError::ConfigInvalid { .. } => ErrorKind::Configuration,
            Form13fError::Database { .. }
            | Form13fError::DatabaseQuery { .. }
            | Form13fError::Import { .. }
            | Form13fError::Io(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<&Form13fError> for std::process::ExitCode {
    fn from(err: &Form13fError) -> Self {
        let code: u8 = match err {
            Form13fError::Io(_) => 1,
            Form13fError::ConfigParse { .. }
            | Form13fError::ConfigMissing { .. }
            | Form13fError::ConfigInvalid { .. } => 2,
            Form13fError::Database { .. } | Form13fError::DatabaseQuery { .. } => 3,
            Form13fError::Import { .. } => 4,
            Form13fError::MissingBuyPrice { .. }
            | Form13fError::MissingSalePrice { .. }
            | Form13fError::CalendarExhausted { .. }
            | Form13fError::NoSnapshots { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
