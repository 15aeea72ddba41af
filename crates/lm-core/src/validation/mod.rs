//! Validation engine: structural checks, expectation checks and the optional
//! reference recomputation, all feeding one issue list.

mod context;
pub mod reference;
mod report;

pub use context::{HeaderExpectation, ValidationContext};
pub use report::{IssueCode, ValidationIssue, ValidationReport};

use crate::catalog::HeaderCatalog;
use crate::error::{Error, Result};
use crate::header::HeaderDefinition;
use crate::merger::MergeResult;
use crate::parser::RowSource;
use rust_decimal::{Decimal, RoundingStrategy};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Inputs the reference pass re-reads
#[derive(Clone, Copy)]
pub struct ReferenceSources<'a> {
    pub files: &'a [PathBuf],
    pub catalog: &'a HeaderCatalog,
    pub source: &'a dyn RowSource,
}

/// Round half-up to `scale` digits and pad to exactly that many
pub(crate) fn scaled(value: Decimal, scale: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(scale);
    rounded
}

/// Absolute difference of two sums, `None` when it leaves the decimal range
pub(crate) fn sum_delta(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_sub(b).map(|d| d.abs())
}

pub(crate) fn show_delta(delta: Option<Decimal>) -> String {
    delta.map_or_else(|| "overflow".to_string(), |d| d.to_string())
}

/// [`validate`], with a panic inside the validator turned into
/// [`Error::ValidationAborted`] so a broken validator never reads as a pass.
pub fn validate_guarded(
    merged: &MergeResult,
    context: &ValidationContext,
    reference: Option<&ReferenceSources<'_>>,
) -> Result<ValidationReport> {
    panic::catch_unwind(AssertUnwindSafe(|| validate(merged, context, reference))).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        error!(%message, "validator panicked");
        Error::ValidationAborted(message)
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Validate a merge result.
///
/// The reference pass only runs when the context enables it and sources are
/// given.
pub fn validate(
    merged: &MergeResult,
    context: &ValidationContext,
    reference: Option<&ReferenceSources<'_>>,
) -> ValidationReport {
    if merged.is_empty() {
        warn!("validation called with an empty merge result");
        return ValidationReport::from_issues(vec![ValidationIssue::new(
            IssueCode::EmptyMergedData,
            "No aggregated data available for validation.",
        )]);
    }

    info!(headers = merged.len(), "validating merge result");
    let mut issues = Vec::new();

    for (header, groups) in merged.iter() {
        if header.has_blank_name() {
            warn!("header bucket without a name");
            issues.push(
                ValidationIssue::new(IssueCode::InvalidHeader, "Header must have a non-blank name.")
                    .with_header(header.name())
                    .with_details(format!("header={}", header)),
            );
            continue;
        }
        let name = header.name();

        if groups.is_empty() {
            debug!(header = name, "header bucket has no data rows");
        }

        let mut actual_rows: u64 = 0;
        let mut actual_sum = Some(Decimal::ZERO);
        for (key, aggregation) in groups {
            if aggregation.row_count < 1 {
                warn!(header = name, row_count = aggregation.row_count, "invalid row count");
                issues.push(
                    ValidationIssue::new(IssueCode::InvalidRowCount, "Row count must be at least 1.")
                        .with_header(name)
                        .with_details(format!(
                            "key={:?}, rowCount={}",
                            key, aggregation.row_count
                        )),
                );
            }
            actual_rows = actual_rows.saturating_add(aggregation.row_count.max(0).unsigned_abs());
            actual_sum = actual_sum.and_then(|sum| sum.checked_add(aggregation.sum_value));
        }

        check_row_count(name, actual_rows, context, &mut issues);
        match actual_sum {
            Some(actual_sum) => check_sum(header, actual_sum, context, &mut issues),
            None if header.has_sum_column() => {
                warn!(header = name, "header total exceeds the decimal range");
                issues.push(
                    ValidationIssue::new(
                        IssueCode::SumMismatch,
                        "Header total exceeds the supported decimal range.",
                    )
                    .with_header(name)
                    .with_details(format!("groups={}", groups.len())),
                );
            }
            None => {}
        }
    }

    if context.reference_pass_enabled() {
        match reference {
            Some(sources) if !sources.files.is_empty() => {
                issues.extend(reference::reference_issues(
                    merged,
                    sources.files,
                    sources.catalog,
                    sources.source,
                    context.tolerance(),
                    context.scale(),
                ));
            }
            _ => warn!("reference pass enabled but no source files given, skipped"),
        }
    }

    let report = ValidationReport::from_issues(issues);
    info!(
        valid = report.is_valid(),
        issues = report.issues().len(),
        "validation finished"
    );
    report
}

fn check_row_count(
    name: &str,
    actual: u64,
    context: &ValidationContext,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(expected) = context.expected_row_count(name) else {
        missing_expectation(
            context,
            issues,
            IssueCode::MissingExpectedRowCount,
            "No expected row count configured.",
            name,
        );
        return;
    };

    if expected != actual {
        warn!(header = name, expected, actual, "row count mismatch");
        issues.push(
            ValidationIssue::new(
                IssueCode::CountMismatch,
                "Data row count does not match the expected value.",
            )
            .with_header(name)
            .with_details(format!("expected={}, actual={}", expected, actual)),
        );
    } else {
        debug!(header = name, actual, "row count check passed");
    }
}

fn check_sum(
    header: &HeaderDefinition,
    actual: Decimal,
    context: &ValidationContext,
    issues: &mut Vec<ValidationIssue>,
) {
    let name = header.name();
    if !header.has_sum_column() {
        debug!(header = name, "no sum column, sum check skipped");
        return;
    }

    let Some(expected) = context.expected_sum(name) else {
        missing_expectation(
            context,
            issues,
            IssueCode::MissingExpectedSum,
            "No expected sum configured.",
            name,
        );
        return;
    };

    let scale = context.scale();
    let tolerance = context.tolerance();
    let expected = scaled(expected, scale);
    let actual = scaled(actual, scale);
    let delta = sum_delta(actual, expected);

    if delta.map_or(true, |d| d > tolerance) {
        let delta = show_delta(delta);
        warn!(
            header = name,
            %expected,
            %actual,
            %tolerance,
            %delta,
            "sum mismatch"
        );
        issues.push(
            ValidationIssue::new(IssueCode::SumMismatch, "Sum check failed.")
                .with_header(name)
                .with_details(format!(
                    "expected={}, actual={}, tolerance={}, delta={}",
                    expected, actual, tolerance, delta
                )),
        );
    } else {
        debug!(header = name, %expected, %actual, "sum check passed");
    }
}

fn missing_expectation(
    context: &ValidationContext,
    issues: &mut Vec<ValidationIssue>,
    code: IssueCode,
    message: &str,
    name: &str,
) {
    if context.missing_expectations_as_warning() {
        warn!(header = name, code = %code, "{}", message);
        return;
    }
    issues.push(ValidationIssue::new(code, message).with_header(name));
}
