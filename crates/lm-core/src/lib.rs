//! lm-core: Core library for merging tabular list exports
//!
//! This library provides functionality to:
//! - Read CSV and workbook files into ordered text rows
//! - Resolve each file against a catalog of known header templates
//! - Group and aggregate rows into a count and an optional decimal sum
//! - Validate the aggregation against expectations and an independent recomputation
//! - Export the merge result as XLSX or JSON from a cancellable background job

pub mod catalog;
pub mod config;
pub mod error;
pub mod export;
pub mod header;
pub mod merger;
pub mod parser;
pub mod pipeline;
pub mod resolver;
pub mod table;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use catalog::HeaderCatalog;
pub use config::JobConfig;
pub use error::{Error, Result};
pub use export::{build_sections, export, ExportFormat, ExportRow, ExportSection};
pub use header::{HeaderDefinition, HeaderPosition};
pub use merger::{merge_files, AggregationResult, GroupKey, GroupMap, MergeResult};
pub use parser::{parse_rows, FileRowSource, RowSource};
pub use pipeline::{CancelToken, JobEvent, JobHandle, JobOptions, JobOutcome, MergeJob, Progress, Stage};
pub use resolver::{resolve_header, resolve_table, MatchKind, Resolution};
pub use table::SourceTable;
pub use validation::{
    validate, validate_guarded, IssueCode, ReferenceSources, ValidationContext, ValidationIssue,
    ValidationReport,
};
