//! Shared fixtures for unit tests

use crate::catalog::HeaderCatalog;
use crate::error::{Error, Result};
use crate::header::HeaderDefinition;
use crate::parser::{parse_csv_str, RowSource};
use crate::table::SourceTable;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// In-memory row source keyed by path
#[derive(Debug, Default)]
pub struct MemorySource {
    files: HashMap<PathBuf, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &str, content: &str) -> Self {
        self.files.insert(PathBuf::from(path), content.to_string());
        self
    }
}

impl RowSource for MemorySource {
    fn read_rows(&self, path: &Path) -> Result<SourceTable> {
        match self.files.get(path) {
            Some(content) => parse_csv_str(content, &path.display().to_string()),
            None => Err(Error::FileRead {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            }),
        }
    }
}

pub fn labels(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

/// `Main: Name;Amount`, summing `Amount`
pub fn main_header() -> HeaderDefinition {
    HeaderDefinition::new("Main", labels(&["Name", "Amount"])).with_sum_column("Amount")
}

pub fn catalog_of(definitions: Vec<HeaderDefinition>) -> HeaderCatalog {
    HeaderCatalog::from_definitions(definitions)
}
