//! Reference pass: regroup the source files from scratch and diff the result
//! against the merge engine's output.
//!
//! The regrouping shares only file reading and header resolution with the
//! merge engine. Grouping, sum-column lookup and value extraction are done
//! again here so a defect in one path shows up as a difference.

use super::report::{IssueCode, ValidationIssue};
use super::{scaled, show_delta, sum_delta};
use crate::catalog::HeaderCatalog;
use crate::error::{Error, Result};
use crate::header::{normalize_row, HeaderDefinition, HeaderPosition};
use crate::merger::{AggregationResult, MergeResult, DEFAULT_SUM_PATTERN};
use crate::parser::RowSource;
use crate::resolver::resolve_header;
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Joins normalized cells into a canonical key
pub const KEY_SEPARATOR: char = '\u{1F}';

/// Header name -> canonical key -> aggregation
pub type ReferenceView = BTreeMap<String, BTreeMap<String, AggregationResult>>;

/// Canonical form of a key: cells trimmed and lower-cased, trailing blank
/// cells dropped, joined by [`KEY_SEPARATOR`].
///
/// A cell that itself contains the separator is indistinguishable from two
/// adjacent cells.
pub fn canonical_key<S: AsRef<str>>(cells: &[S]) -> String {
    let mut key = String::new();
    for (i, cell) in normalize_row(cells).iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(cell);
    }
    key
}

/// Render a canonical key for issue details
pub fn display_key(key: &str) -> String {
    let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    format!("[{}]", parts.join(", "))
}

/// A source file the reference pass could not process
#[derive(Debug)]
pub struct ReferenceFailure {
    pub path: PathBuf,
    pub error: Error,
}

/// Regroup every file independently into a [`ReferenceView`].
///
/// Files are read one at a time; the first failure stops the rebuild.
pub fn build_reference<P: AsRef<Path>>(
    files: &[P],
    catalog: &HeaderCatalog,
    source: &dyn RowSource,
) -> std::result::Result<ReferenceView, ReferenceFailure> {
    let mut view = ReferenceView::new();

    for path in files {
        let path = path.as_ref();
        regroup_file(path, catalog, source, &mut view).map_err(|error| ReferenceFailure {
            path: path.to_path_buf(),
            error,
        })?;
    }

    Ok(view)
}

fn regroup_file(
    path: &Path,
    catalog: &HeaderCatalog,
    source: &dyn RowSource,
    view: &mut ReferenceView,
) -> Result<()> {
    let table = source.read_rows(path)?;
    let rows = &table.rows;

    let Some(last_index) = rows.iter().rposition(|row| !row_is_blank(row)) else {
        debug!(file = %path.display(), "reference: no non-blank rows");
        return Ok(());
    };
    let first = rows.first().map(Vec::as_slice).unwrap_or(&[]);
    let header = resolve_header(first, &rows[last_index], catalog).definition;
    if header.has_blank_name() {
        return Ok(());
    }

    let header_index = match header.header_position() {
        HeaderPosition::First => 0,
        HeaderPosition::Last => last_index,
    };
    let sum_index = sum_index_of(&header);
    let pattern = sum_regex_of(&header)?;

    let bucket = view.entry(header.name().to_string()).or_default();
    for (index, row) in rows.iter().enumerate() {
        if index == header_index || row_is_blank(row) {
            continue;
        }
        let key_cells: Vec<&str> = row
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != sum_index)
            .map(|(_, cell)| cell.as_str())
            .collect();
        let value = sum_index
            .and_then(|i| row.get(i))
            .map(|cell| read_sum(&pattern, cell))
            .unwrap_or(Decimal::ZERO);

        add_to_bucket(bucket, header.name(), canonical_key(&key_cells), AggregationResult::single(value))?;
    }

    Ok(())
}

fn add_to_bucket(
    bucket: &mut BTreeMap<String, AggregationResult>,
    header_name: &str,
    key: String,
    aggregation: AggregationResult,
) -> Result<()> {
    let total = match bucket.get(&key) {
        Some(existing) => existing.checked_add(aggregation),
        None => Some(aggregation),
    };
    match total {
        Some(total) => {
            bucket.insert(key, total);
            Ok(())
        }
        None => Err(Error::SumOverflow {
            header: header_name.to_string(),
            key: display_key(&key),
        }),
    }
}

fn row_is_blank(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

fn sum_index_of(header: &HeaderDefinition) -> Option<usize> {
    let label = header.sum_column()?.trim().to_lowercase();
    header
        .headers()
        .iter()
        .position(|h| h.trim().to_lowercase() == label)
}

fn sum_regex_of(header: &HeaderDefinition) -> Result<Regex> {
    let pattern = header.sum_pattern().unwrap_or(DEFAULT_SUM_PATTERN);
    Regex::new(pattern).map_err(|e| Error::Pattern {
        pattern: pattern.to_string(),
        source: e,
    })
}

fn read_sum(pattern: &Regex, cell: &str) -> Decimal {
    if cell.trim().is_empty() {
        return Decimal::ZERO;
    }
    let Some(found) = pattern.captures(cell) else {
        return Decimal::ZERO;
    };
    let text = match found.get(1) {
        Some(group) => group.as_str(),
        None => found.get(0).map_or("", |m| m.as_str()),
    };
    let text = text.replace(',', ".");
    Decimal::from_str(text.trim_end_matches('.')).unwrap_or(Decimal::ZERO)
}

/// Canonicalize the merge result into the same shape as the reference.
///
/// Buckets with a blank header name are left out. Groups that share a
/// canonical key are added up, which can overflow.
pub fn merged_view(merged: &MergeResult) -> Result<ReferenceView> {
    let mut view = ReferenceView::new();
    for (header, groups) in merged.iter() {
        if header.has_blank_name() {
            continue;
        }
        let bucket = view.entry(header.name().to_string()).or_default();
        for (key, aggregation) in groups {
            add_to_bucket(bucket, header.name(), canonical_key(key), *aggregation)?;
        }
    }
    Ok(view)
}

/// Diff the reference against the merged view.
///
/// Only reference keys are checked; keys present solely in the merge result
/// are not reported.
pub fn compare(
    merged: &ReferenceView,
    reference: &ReferenceView,
    tolerance: Decimal,
    scale: u32,
) -> Vec<ValidationIssue> {
    let empty = BTreeMap::new();
    let mut issues = Vec::new();

    for (header_name, reference_bucket) in reference {
        let merged_bucket = merged.get(header_name).unwrap_or(&empty);

        for (key, expected) in reference_bucket {
            let shown = display_key(key);
            let Some(actual) = merged_bucket.get(key) else {
                issues.push(
                    ValidationIssue::new(
                        IssueCode::ReferenceMissingKey,
                        "Key from the source files is missing in the merge result.",
                    )
                    .with_header(header_name.as_str())
                    .with_details(format!(
                        "key={}, referenceCount={}, referenceSum={}",
                        shown,
                        expected.row_count,
                        scaled(expected.sum_value, scale)
                    )),
                );
                continue;
            };

            if expected.row_count != actual.row_count {
                issues.push(
                    ValidationIssue::new(
                        IssueCode::ReferenceCountMismatch,
                        "Row count differs for the same key.",
                    )
                    .with_header(header_name.as_str())
                    .with_details(format!(
                        "key={}, referenceCount={}, mergedCount={}",
                        shown, expected.row_count, actual.row_count
                    )),
                );
            }

            let reference_sum = scaled(expected.sum_value, scale);
            let merged_sum = scaled(actual.sum_value, scale);
            let delta = sum_delta(reference_sum, merged_sum);
            if delta.map_or(true, |d| d > tolerance) {
                issues.push(
                    ValidationIssue::new(
                        IssueCode::ReferenceSumMismatch,
                        "Sum differs for the same key.",
                    )
                    .with_header(header_name.as_str())
                    .with_details(format!(
                        "key={}, referenceSum={}, mergedSum={}, delta={}",
                        shown,
                        reference_sum,
                        merged_sum,
                        show_delta(delta)
                    )),
                );
            }
        }
    }

    issues
}

/// Run the whole reference pass and return its issues
pub fn reference_issues<P: AsRef<Path>>(
    merged: &MergeResult,
    files: &[P],
    catalog: &HeaderCatalog,
    source: &dyn RowSource,
    tolerance: Decimal,
    scale: u32,
) -> Vec<ValidationIssue> {
    let reference = match build_reference(files, catalog, source) {
        Ok(reference) => reference,
        Err(failure) => {
            warn!(file = %failure.path.display(), error = %failure.error, "reference pass could not read file");
            return vec![ValidationIssue::new(
                IssueCode::ReferencePathError,
                format!(
                    "Reference aggregation could not be computed for {}.",
                    failure.path.display()
                ),
            )
            .with_details(failure.error.to_string())];
        }
    };

    let view = match merged_view(merged) {
        Ok(view) => view,
        Err(error) => {
            warn!(error = %error, "merged view could not be canonicalized");
            return vec![ValidationIssue::new(
                IssueCode::ReferenceSumMismatch,
                "Merged groups sharing a canonical key exceed the decimal range.",
            )
            .with_details(error.to_string())];
        }
    };
    let issues = compare(&view, &reference, tolerance, scale);
    info!(
        headers = reference.len(),
        issues = issues.len(),
        "reference pass finished"
    );
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::merge_files;
    use crate::test_support::{catalog_of, dec, labels, main_header, MemorySource};

    fn tolerance() -> Decimal {
        dec("0.01")
    }

    #[test]
    fn test_canonical_key_normalizes_cells() {
        assert_eq!(canonical_key(&["  Alice ", "X", ""]), "alice\u{1F}x");
        assert_eq!(canonical_key::<&str>(&[]), "");
        assert_eq!(display_key("alice\u{1F}x"), "[alice, x]");
    }

    #[test]
    fn test_reference_agrees_with_merge() {
        let catalog = catalog_of(vec![main_header()]);
        let source = MemorySource::new()
            .with("a.csv", "Name;Amount\nAlice;10\nBob;5\n\nalice ;2,5\n")
            .with("b.csv", "x;y;z\n1;2;3\n");
        let files = ["a.csv", "b.csv"];
        let merged = merge_files(&files, &catalog, &source).unwrap();

        let issues = reference_issues(&merged, &files, &catalog, &source, tolerance(), 2);
        assert!(issues.is_empty(), "{:?}", issues);

        let reference = build_reference(&files, &catalog, &source).unwrap();
        // "Alice" and "alice " are separate merge groups but one canonical key
        assert_eq!(
            reference["Main"]["alice"],
            AggregationResult::new(2, dec("12.5"))
        );
        assert!(reference.contains_key("Unknown_3"));
    }

    #[test]
    fn test_inflated_count_and_dropped_key_are_reported() {
        let catalog = catalog_of(vec![main_header()]);
        let source = MemorySource::new().with("sample.csv", "Name;Amount\nAlice;10\nBob;5\n");

        let mut merged = MergeResult::new();
        merged.insert(main_header(), labels(&["Alice"]), AggregationResult::new(2, dec("10"))).unwrap();

        let issues = reference_issues(&merged, &["sample.csv"], &catalog, &source, tolerance(), 2);
        let codes: Vec<IssueCode> = issues.iter().map(|i| i.code).collect();
        assert!(codes.contains(&IssueCode::ReferenceCountMismatch));
        assert!(codes.contains(&IssueCode::ReferenceMissingKey));
        assert!(issues
            .iter()
            .all(|i| i.details.as_deref().is_some_and(|d| d.contains("key="))));

        let count = issues
            .iter()
            .find(|i| i.code == IssueCode::ReferenceCountMismatch)
            .unwrap();
        assert_eq!(
            count.details.as_deref(),
            Some("key=[alice], referenceCount=1, mergedCount=2")
        );
    }

    #[test]
    fn test_sum_difference_beyond_tolerance() {
        let catalog = catalog_of(vec![main_header()]);
        let source = MemorySource::new().with("a.csv", "Name;Amount\nAlice;10\n");

        let mut merged = MergeResult::new();
        merged.insert(main_header(), labels(&["Alice"]), AggregationResult::new(1, dec("10.01"))).unwrap();
        assert!(reference_issues(&merged, &["a.csv"], &catalog, &source, tolerance(), 2).is_empty());

        let mut merged = MergeResult::new();
        merged.insert(main_header(), labels(&["Alice"]), AggregationResult::new(1, dec("10.02"))).unwrap();
        let issues = reference_issues(&merged, &["a.csv"], &catalog, &source, tolerance(), 2);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::ReferenceSumMismatch);
        assert_eq!(
            issues[0].details.as_deref(),
            Some("key=[alice], referenceSum=10.00, mergedSum=10.02, delta=0.02")
        );
    }

    #[test]
    fn test_extra_merged_keys_are_not_reported() {
        let catalog = catalog_of(vec![main_header()]);
        let source = MemorySource::new().with("a.csv", "Name;Amount\nAlice;10\n");

        let mut merged = MergeResult::new();
        merged.insert(main_header(), labels(&["Alice"]), AggregationResult::new(1, dec("10"))).unwrap();
        merged.insert(main_header(), labels(&["Ghost"]), AggregationResult::new(4, dec("1"))).unwrap();

        assert!(reference_issues(&merged, &["a.csv"], &catalog, &source, tolerance(), 2).is_empty());
    }

    #[test]
    fn test_read_failure_is_reported_not_raised() {
        let catalog = catalog_of(vec![main_header()]);
        let source = MemorySource::new().with("a.csv", "Name;Amount\nAlice;10\n");
        let merged = merge_files(&["a.csv"], &catalog, &source).unwrap();

        let issues = reference_issues(&merged, &["a.csv", "gone.csv"], &catalog, &source, tolerance(), 2);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::ReferencePathError);
        assert!(issues[0].message.contains("gone.csv"));
        assert!(issues[0].header_name.is_none());
    }

    #[test]
    fn test_separator_inside_cell_collides_with_split_cells() {
        let header = HeaderDefinition::new("Pairs", labels(&["First", "Second", "Amount"]))
            .with_sum_column("Amount");
        let catalog = catalog_of(vec![header]);
        let source = MemorySource::new().with(
            "pairs.csv",
            "First;Second;Amount\na\u{1F}b;;5\na;b;7\n",
        );
        let merged = merge_files(&["pairs.csv"], &catalog, &source).unwrap();

        // two distinct structured keys in the merge result
        assert_eq!(merged.get_by_name("Pairs").unwrap().len(), 2);
        assert_eq!(
            canonical_key(&["a\u{1F}b", ""]),
            canonical_key(&["a", "b"])
        );

        // both collapse onto one canonical key, so the diff cannot tell them apart
        let view = merged_view(&merged).unwrap();
        assert_eq!(view["Pairs"].len(), 1);
        assert_eq!(view["Pairs"]["a\u{1F}b"], AggregationResult::new(2, dec("12")));
        assert!(reference_issues(&merged, &["pairs.csv"], &catalog, &source, tolerance(), 2).is_empty());
    }

    #[test]
    fn test_blank_named_buckets_are_ignored() {
        let blank = HeaderDefinition::new(" ", labels(&["Name", "Amount"]));
        let catalog = catalog_of(vec![blank.clone()]);
        let source = MemorySource::new().with("a.csv", "Name;Amount\nAlice;10\n");

        let mut merged = MergeResult::new();
        merged.insert(blank, labels(&["Alice", "10"]), AggregationResult::single(Decimal::ZERO)).unwrap();

        assert!(merged_view(&merged).unwrap().is_empty());
        assert!(build_reference(&["a.csv"], &catalog, &source).unwrap().is_empty());
    }

    #[test]
    fn test_last_position_header_is_skipped() {
        let footer = HeaderDefinition::new("Footer", labels(&["Customer", "Total"]))
            .with_position(HeaderPosition::Last)
            .with_sum_column("total");
        let catalog = catalog_of(vec![footer]);
        let source = MemorySource::new().with("f.csv", "Alice;10\nBob;5\nCustomer;Total\n;\n");

        let reference = build_reference(&["f.csv"], &catalog, &source).unwrap();
        assert_eq!(reference["Footer"].len(), 2);
        assert_eq!(reference["Footer"]["bob"], AggregationResult::new(1, dec("5")));
    }

    #[test]
    fn test_overflowing_totals_become_issues() {
        let catalog = catalog_of(vec![main_header()]);
        let content = format!("Name;Amount\nAlice;{}\nAlice;{}\n", Decimal::MAX, Decimal::MAX);
        let source = MemorySource::new().with("a.csv", &content);

        let mut merged = MergeResult::new();
        merged.insert(main_header(), labels(&["Alice"]), AggregationResult::single(Decimal::MAX)).unwrap();
        merged.insert(main_header(), labels(&["alice "]), AggregationResult::single(Decimal::MAX)).unwrap();
        assert!(matches!(merged_view(&merged), Err(Error::SumOverflow { .. })));

        let issues = reference_issues(&merged, &["a.csv"], &catalog, &source, tolerance(), 2);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::ReferencePathError);
        assert!(issues[0].details.as_deref().unwrap().contains("decimal range"));

        let single = MemorySource::new().with("a.csv", "Name;Amount\nAlice;1\n");
        let issues = reference_issues(&merged, &["a.csv"], &catalog, &single, tolerance(), 2);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::ReferenceSumMismatch);
    }
}
