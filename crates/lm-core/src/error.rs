//! Error types for lm-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lm-core
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to read a file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CSV parsing error from the csv crate
    #[error("CSV error in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// Workbook could not be opened or its first sheet read
    #[error("failed to read workbook '{path}': {message}")]
    Workbook { path: PathBuf, message: String },

    /// File extension is neither a delimited text file nor a workbook
    #[error("unsupported file format: '{0}'")]
    UnsupportedFormat(PathBuf),

    /// A header definition document is invalid
    #[error("invalid header definition in '{source_name}': {message}")]
    InvalidHeader {
        source_name: String,
        message: String,
    },

    /// Directory traversal error
    #[error("failed to traverse directory: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// A sum pattern failed to compile
    #[error("invalid sum pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A group total left the range of the decimal type
    #[error("sum of group {key} under '{header}' exceeds the supported decimal range")]
    SumOverflow { header: String, key: String },

    /// Writing the export artifact failed
    #[error("export to '{path}' failed: {message}")]
    Export { path: PathBuf, message: String },

    /// Validation found issues and the job is configured to stop
    #[error("{summary} Export aborted.")]
    ValidationFailed {
        summary: String,
        report_path: Option<PathBuf>,
    },

    /// The validator itself broke; never treated as "no issues"
    #[error("validation failed, export aborted for safety: {0}")]
    ValidationAborted(String),

    /// Job was abandoned by the caller between stages
    #[error("job cancelled before stage '{0}'")]
    Cancelled(&'static str),

    /// Worker thread ended without reporting an outcome
    #[error("merge worker terminated unexpectedly: {0}")]
    Worker(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
