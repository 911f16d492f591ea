//! Error types for patientdb.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The configured input directory does not exist.
    #[error("Input directory not found: {}", .0.display())]
    InputDirMissing(PathBuf),

    /// The roster file is not present in the input directory.
    #[error("Roster file '{0}' not found")]
    RosterMissing(String),

    /// The roster file exists but could not be parsed.
    #[error("Roster file '{roster}' cannot be read: {reason}")]
    RosterUnreadable { roster: String, reason: String },

    /// The roster file has no rows.
    #[error("Roster file '{0}' is empty")]
    RosterEmpty(String),

    /// None of the identifier aliases is a column of the roster.
    #[error("Roster file '{roster}' has no identifier column (tried: {tried})")]
    RosterIdMissing { roster: String, tried: String },

    /// Two patients sanitize to the same table name.
    #[error("Table name collision: '{table}' is produced by both '{first}' and '{second}'")]
    TableNameCollision {
        table: String,
        first: String,
        second: String,
    },

    /// Two columns of one table sanitize to the same name.
    #[error("Column name collision in {table}: '{column}'")]
    ColumnNameCollision { table: String, column: String },

    /// A merged table without any column cannot become a SQL table.
    #[error("Table {0} has no columns")]
    NoColumns(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Execution error: {0}")]
    Execution(String),

    /// CSV read/write error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create a roster-without-identifier error.
    pub fn roster_id_missing(roster: impl Into<String>, aliases: &[String]) -> Self {
        Self::RosterIdMissing {
            roster: roster.into(),
            tried: aliases.join(", "),
        }
    }

    /// True for the conditions that abort segregation before any folder exists.
    pub fn is_roster_condition(&self) -> bool {
        matches!(
            self,
            Self::InputDirMissing(_)
                | Self::RosterMissing(_)
                | Self::RosterUnreadable { .. }
                | Self::RosterEmpty(_)
                | Self::RosterIdMissing { .. }
        )
    }
}

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
