//! Merge engine: group rows per header template and aggregate count and sum

use crate::catalog::HeaderCatalog;
use crate::error::{Error, Result};
use crate::header::HeaderDefinition;
use crate::parser::RowSource;
use crate::resolver::{resolve_table, MatchKind};
use crate::table::{is_blank_row, SourceTable};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Default sum extraction: a run of digits with an optional `.` or `,` separator
pub const DEFAULT_SUM_PATTERN: &str = r"([0-9]+[.,]?[0-9]*)";

/// Raw cell values of a data row, minus the sum column
pub type GroupKey = Vec<String>;

/// Aggregated groups of one header template
pub type GroupMap = BTreeMap<GroupKey, AggregationResult>;

/// Row count and summed value of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Number of source rows in the group; a valid aggregation never drops below 1
    pub row_count: i64,
    /// Sum of the extracted values, zero when the template has no sum column
    pub sum_value: Decimal,
}

impl AggregationResult {
    pub fn new(row_count: i64, sum_value: Decimal) -> Self {
        Self {
            row_count,
            sum_value,
        }
    }

    /// Aggregation of a single row
    pub fn single(sum_value: Decimal) -> Self {
        Self::new(1, sum_value)
    }

    /// Component-wise sum, `None` when the count or the sum overflows
    pub fn checked_add(self, other: AggregationResult) -> Option<AggregationResult> {
        Some(AggregationResult::new(
            self.row_count.checked_add(other.row_count)?,
            self.sum_value.checked_add(other.sum_value)?,
        ))
    }
}

/// Fold one aggregation into a group map.
///
/// Fails with [`Error::SumOverflow`] when the group total leaves the decimal
/// range; the map keeps the previous total for that key.
pub fn accumulate(
    groups: &mut GroupMap,
    header_name: &str,
    key: GroupKey,
    aggregation: AggregationResult,
) -> Result<()> {
    match groups.get_mut(&key) {
        Some(existing) => match existing.checked_add(aggregation) {
            Some(total) => *existing = total,
            None => {
                return Err(Error::SumOverflow {
                    header: header_name.to_string(),
                    key: format!("{:?}", key),
                })
            }
        },
        None => {
            groups.insert(key, aggregation);
        }
    }
    Ok(())
}

/// Job-wide merge result: template -> group key -> aggregation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeResult {
    buckets: BTreeMap<HeaderDefinition, GroupMap>,
}

impl MergeResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a group map into the bucket of `header`.
    ///
    /// The bucket is created even when `groups` is empty, so a template whose
    /// files hold no data rows is still validated.
    pub fn merge_groups(&mut self, header: HeaderDefinition, groups: GroupMap) -> Result<()> {
        let name = header.name().to_string();
        let bucket = self.buckets.entry(header).or_default();
        for (key, aggregation) in groups {
            accumulate(bucket, &name, key, aggregation)?;
        }
        Ok(())
    }

    /// Add a single aggregation under `header`
    pub fn insert(
        &mut self,
        header: HeaderDefinition,
        key: GroupKey,
        aggregation: AggregationResult,
    ) -> Result<()> {
        let name = header.name().to_string();
        accumulate(self.buckets.entry(header).or_default(), &name, key, aggregation)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of header buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderDefinition, &GroupMap)> {
        self.buckets.iter()
    }

    pub fn get(&self, header: &HeaderDefinition) -> Option<&GroupMap> {
        self.buckets.get(header)
    }

    /// Bucket of the first template with the given name
    pub fn get_by_name(&self, name: &str) -> Option<&GroupMap> {
        self.buckets
            .iter()
            .find(|(header, _)| header.name() == name)
            .map(|(_, groups)| groups)
    }

    /// Total number of data rows over all buckets
    pub fn total_rows(&self) -> i64 {
        self.buckets
            .values()
            .flat_map(|groups| groups.values())
            .map(|a| a.row_count.max(0))
            .sum()
    }
}

/// Location and extraction rule of a template's sum column
#[derive(Debug, Clone)]
pub struct SumColumn {
    index: usize,
    pattern: Regex,
}

impl SumColumn {
    /// Resolve the sum column of a template.
    ///
    /// Returns `None` when no sum column is configured, or when the configured
    /// label is not among the template's labels (logged, not an error).
    pub fn for_header(header: &HeaderDefinition) -> Result<Option<Self>> {
        let Some(label) = header.sum_column() else {
            return Ok(None);
        };
        if header.headers().is_empty() {
            return Ok(None);
        }
        let Some(index) = header.sum_column_index() else {
            warn!(
                sum_column = label,
                header = header.name(),
                "configured sum column not found in header set"
            );
            return Ok(None);
        };

        let pattern = header.sum_pattern().unwrap_or(DEFAULT_SUM_PATTERN);
        let pattern = Regex::new(pattern).map_err(|e| Error::Pattern {
            pattern: pattern.to_string(),
            source: e,
        })?;
        Ok(Some(Self { index, pattern }))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Extract the numeric value of a row; anything unparsable counts as zero
    pub fn extract<S: AsRef<str>>(&self, row: &[S]) -> Decimal {
        row.get(self.index)
            .map(|cell| extract_decimal(&self.pattern, cell.as_ref()))
            .unwrap_or(Decimal::ZERO)
    }
}

/// Find the first match of `pattern` in `cell` and read it as a decimal
pub fn extract_decimal(pattern: &Regex, cell: &str) -> Decimal {
    if cell.trim().is_empty() {
        return Decimal::ZERO;
    }
    let Some(captures) = pattern.captures(cell) else {
        return Decimal::ZERO;
    };
    let matched = captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str())
        .unwrap_or_default();

    let normalized = matched.replace(',', ".");
    let normalized = normalized.trim_end_matches('.');
    match Decimal::from_str(normalized) {
        Ok(value) => value,
        Err(_) => {
            debug!(value = normalized, cell, "could not parse sum value");
            Decimal::ZERO
        }
    }
}

/// Build the grouping key of a row: every cell except the sum column
pub fn group_key<S: AsRef<str>>(row: &[S], sum_index: Option<usize>) -> GroupKey {
    row.iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != sum_index)
        .map(|(_, cell)| cell.as_ref().to_string())
        .collect()
}

/// Aggregated rows of a single file
#[derive(Debug, Clone)]
pub struct FileAggregation {
    pub header: HeaderDefinition,
    pub match_kind: MatchKind,
    pub header_index: usize,
    pub groups: GroupMap,
    pub data_rows: usize,
}

/// Group and aggregate the data rows of one table.
///
/// Returns `None` when the table holds no non-blank row.
pub fn aggregate_table(table: &SourceTable, catalog: &HeaderCatalog) -> Result<Option<FileAggregation>> {
    let Some((resolution, header_index)) = resolve_table(table, catalog) else {
        return Ok(None);
    };
    let header = resolution.definition;
    let sum_column = SumColumn::for_header(&header)?;
    let sum_index = sum_column.as_ref().map(SumColumn::index);

    let mut groups = GroupMap::new();
    let mut data_rows = 0;
    for (index, row) in table.rows.iter().enumerate() {
        if index == header_index || is_blank_row(row) {
            continue;
        }
        let value = sum_column
            .as_ref()
            .map(|column| column.extract(row))
            .unwrap_or(Decimal::ZERO);
        accumulate(
            &mut groups,
            header.name(),
            group_key(row, sum_index),
            AggregationResult::single(value),
        )?;
        data_rows += 1;
    }

    Ok(Some(FileAggregation {
        header,
        match_kind: resolution.kind,
        header_index,
        groups,
        data_rows,
    }))
}

/// Merge every file, strictly one after another, into one result.
///
/// A read failure on any file aborts the whole merge.
pub fn merge_files<P: AsRef<Path>>(
    files: &[P],
    catalog: &HeaderCatalog,
    source: &dyn RowSource,
) -> Result<MergeResult> {
    let mut result = MergeResult::new();

    for path in files {
        let path = path.as_ref();
        let table = source.read_rows(path)?;

        let Some(file) = aggregate_table(&table, catalog)? else {
            warn!(file = %path.display(), "file has no non-blank rows, skipped");
            continue;
        };

        if file.match_kind == MatchKind::Unknown {
            warn!(
                file = %path.display(),
                header = file.header.name(),
                "no header template matched, rows grouped under placeholder"
            );
        }
        info!(
            file = %path.display(),
            header = file.header.name(),
            matched = %file.match_kind,
            rows = file.data_rows,
            groups = file.groups.len(),
            "file merged"
        );

        if file.groups.is_empty() {
            debug!(file = %path.display(), header = file.header.name(), "no data rows");
        }
        result.merge_groups(file.header, file.groups)?;
    }

    Ok(result)
}
