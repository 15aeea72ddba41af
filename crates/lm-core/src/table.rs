//! Raw text rows read from a single source file

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The ordered text rows of one source file, before any header handling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTable {
    /// Row data, one `Vec<String>` per physical row (ragged rows allowed)
    pub rows: Vec<Vec<String>>,
    /// Source file path
    pub source_path: PathBuf,
}

impl SourceTable {
    /// Create a new table
    pub fn new(source_path: PathBuf, rows: Vec<Vec<String>>) -> Self {
        Self { rows, source_path }
    }

    /// Get the number of rows, blank rows included
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Index of the last row holding at least one non-blank cell
    pub fn last_non_blank_index(&self) -> Option<usize> {
        self.rows.iter().rposition(|row| !is_blank_row(row))
    }

    /// First physical row, or an empty slice for an empty table
    pub fn first_row(&self) -> &[String] {
        self.rows.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Get a row by index
    pub fn get(&self, index: usize) -> Option<&[String]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Check whether the table has no non-blank row at all
    pub fn is_blank(&self) -> bool {
        self.last_non_blank_index().is_none()
    }
}

/// A row is blank when every cell is empty or whitespace
pub fn is_blank_row<S: AsRef<str>>(row: &[S]) -> bool {
    row.iter().all(|cell| cell.as_ref().trim().is_empty())
}
