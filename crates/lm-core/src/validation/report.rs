//! Validation issues and the report persisted next to the export

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Issues shown in the one-line status summary
const SUMMARY_ISSUE_LIMIT: usize = 3;

/// Stable issue codes, serialized in SCREAMING_SNAKE_CASE.
///
/// `EmptyGroup`, `NullAggregation` and `NullSumValue` describe absent values
/// that [`MergeResult`](crate::merger::MergeResult) cannot hold, so the
/// validator never emits them. They stay part of the code set so report
/// documents from other producers still load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    EmptyMergedData,
    InvalidHeader,
    EmptyGroup,
    NullAggregation,
    InvalidRowCount,
    NullSumValue,
    CountMismatch,
    MissingExpectedRowCount,
    MissingExpectedSum,
    SumMismatch,
    ReferenceMissingKey,
    ReferenceCountMismatch,
    ReferenceSumMismatch,
    ReferencePathError,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::EmptyMergedData => "EMPTY_MERGED_DATA",
            IssueCode::InvalidHeader => "INVALID_HEADER",
            IssueCode::EmptyGroup => "EMPTY_GROUP",
            IssueCode::NullAggregation => "NULL_AGGREGATION",
            IssueCode::InvalidRowCount => "INVALID_ROW_COUNT",
            IssueCode::NullSumValue => "NULL_SUM_VALUE",
            IssueCode::CountMismatch => "COUNT_MISMATCH",
            IssueCode::MissingExpectedRowCount => "MISSING_EXPECTED_ROW_COUNT",
            IssueCode::MissingExpectedSum => "MISSING_EXPECTED_SUM",
            IssueCode::SumMismatch => "SUM_MISMATCH",
            IssueCode::ReferenceMissingKey => "REFERENCE_MISSING_KEY",
            IssueCode::ReferenceCountMismatch => "REFERENCE_COUNT_MISMATCH",
            IssueCode::ReferenceSumMismatch => "REFERENCE_SUM_MISMATCH",
            IssueCode::ReferencePathError => "REFERENCE_PATH_ERROR",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    pub header_name: Option<String>,
    pub details: Option<String>,
}

impl ValidationIssue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            header_name: None,
            details: None,
        }
    }

    pub fn with_header(mut self, header_name: impl Into<String>) -> Self {
        self.header_name = Some(header_name.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(header) = self.header_name.as_deref().filter(|h| !h.trim().is_empty()) {
            write!(f, " [{}]", header)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Outcome of one validation run; valid exactly when there are no issues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    valid: bool,
    issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        Self {
            valid: issues.is_empty(),
            issues,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn has_code(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }

    /// Issues with the given code, in report order
    pub fn issues_with_code(&self, code: IssueCode) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(move |i| i.code == code)
    }

    /// One-line status: OK, or the issue count and the first few issues
    pub fn summary(&self) -> String {
        if self.valid {
            return "Validation: OK (0 issues).".to_string();
        }

        let top: Vec<String> = self
            .issues
            .iter()
            .take(SUMMARY_ISSUE_LIMIT)
            .map(ToString::to_string)
            .collect();
        let suffix = if self.issues.len() > SUMMARY_ISSUE_LIMIT {
            " | …"
        } else {
            ""
        };
        format!(
            "Validation: ERROR ({} issues). {}{}",
            self.issues.len(),
            top.join(" | "),
            suffix
        )
    }

    /// Load a report from JSON; validity is recomputed from the issues
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| Error::FileRead {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        let report: ValidationReport = serde_json::from_str(&content)?;
        Ok(Self::from_issues(report.issues))
    }

    /// Save the report as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
