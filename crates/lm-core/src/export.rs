//! Export: render a merge result as an XLSX workbook or a JSON document.
//!
//! Both writers produce the same section model. The artifact is written to a
//! hidden sibling file first and renamed into place once complete, so the
//! final path never holds a partial file.

use crate::error::{Error, Result};
use crate::header::HeaderDefinition;
use crate::merger::{GroupMap, MergeResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Synthetic column holding the number of merged rows
pub const COUNT_COLUMN: &str = "Count";

/// Base file name of the export artifact
pub const EXPORT_STEM: &str = "merged";

/// Longest sheet name a workbook accepts
const MAX_SHEET_NAME: usize = 31;

/// Output format of the export artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Xlsx,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Json => "json",
        }
    }

    /// Final artifact path inside `output_dir`
    pub fn artifact_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}.{}", EXPORT_STEM, self.extension()))
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xlsx" => Ok(ExportFormat::Xlsx),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("unknown export format '{}'", other)),
        }
    }
}

/// One merged group as it appears in the output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow {
    pub key: Vec<String>,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<Decimal>,
}

/// All groups of one header template
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSection {
    pub name: String,
    /// Empty for templates without labels; no header row is written then
    pub columns: Vec<String>,
    pub rows: Vec<ExportRow>,
}

/// Build the ordered sections of a merge result.
///
/// Sections are ordered by template name, ignoring case. Rows are ordered by
/// descending sum, or descending count when the template has no sum column,
/// then by key.
pub fn build_sections(merged: &MergeResult) -> Vec<ExportSection> {
    let mut sections: Vec<ExportSection> = merged
        .iter()
        .map(|(header, groups)| build_section(header, groups))
        .collect();
    sections.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
    sections
}

fn build_section(header: &HeaderDefinition, groups: &GroupMap) -> ExportSection {
    let sum_index = header.sum_column_index();

    let mut columns = Vec::new();
    if !header.headers().is_empty() {
        columns.extend(
            header
                .headers()
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != sum_index)
                .map(|(_, label)| label.clone()),
        );
        columns.push(COUNT_COLUMN.to_string());
        if let Some(index) = sum_index {
            columns.push(header.headers()[index].clone());
        }
    }

    let mut rows: Vec<ExportRow> = groups
        .iter()
        .map(|(key, aggregation)| ExportRow {
            key: key.clone(),
            count: aggregation.row_count,
            sum: sum_index.map(|_| aggregation.sum_value),
        })
        .collect();
    rows.sort_by(|a, b| rank(b, a).then_with(|| a.key.cmp(&b.key)));

    ExportSection {
        name: header.name().to_string(),
        columns,
        rows,
    }
}

fn rank(a: &ExportRow, b: &ExportRow) -> Ordering {
    match (a.sum, b.sum) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.count.cmp(&b.count),
    }
}

/// Make a template name usable as a worksheet name
pub fn sanitize_sheet_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            ':' | '\\' | '/' | '?' | '*' | '[' | ']' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('\'');
    let cleaned: String = cleaned.chars().take(MAX_SHEET_NAME).collect();
    if cleaned.trim().is_empty() {
        "Sheet".to_string()
    } else {
        cleaned
    }
}

/// Sanitized sheet names, made unique case-insensitively with a ` (n)` suffix
pub fn unique_sheet_names<'a, I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut taken = HashSet::new();
    let mut result = Vec::new();

    for name in names {
        let base = sanitize_sheet_name(name);
        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(&candidate.to_lowercase()) {
            let suffix = format!(" ({})", n);
            let keep = MAX_SHEET_NAME.saturating_sub(suffix.chars().count());
            candidate = format!("{}{}", base.chars().take(keep).collect::<String>(), suffix);
            n += 1;
        }
        taken.insert(candidate.to_lowercase());
        result.push(candidate);
    }

    result
}

/// Export a merge result into `output_dir` and return the artifact path
pub fn export(merged: &MergeResult, output_dir: &Path, format: ExportFormat) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let target = format.artifact_path(output_dir);
    let sections = build_sections(merged);

    write_atomically(&target, |temp| match format {
        ExportFormat::Xlsx => write_xlsx(&sections, temp),
        ExportFormat::Json => write_json(&sections, temp),
    })?;

    info!(
        path = %target.display(),
        sections = sections.len(),
        format = %format,
        "export written"
    );
    Ok(target)
}

/// Write through a hidden sibling and rename it onto `target` on success
pub fn write_atomically<F>(target: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let temp = temp_sibling(target);
    let outcome = write(&temp).and_then(|_| fs::rename(&temp, target).map_err(Error::from));
    if outcome.is_err() && temp.exists() {
        debug!(path = %temp.display(), "removing incomplete export");
        let _ = fs::remove_file(&temp);
    }
    outcome
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| EXPORT_STEM.to_string());
    target.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

fn write_json(sections: &[ExportSection], path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(sections)?;
    fs::write(path, content)?;
    Ok(())
}

fn write_xlsx(sections: &[ExportSection], path: &Path) -> Result<()> {
    let xlsx_error = |e: XlsxError| Error::Export {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let position_error = || Error::Export {
        path: path.to_path_buf(),
        message: "section exceeds the worksheet size".to_string(),
    };

    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let names = unique_sheet_names(sections.iter().map(|s| s.name.as_str()));

    for (section, sheet_name) in sections.iter().zip(&names) {
        let worksheet = workbook
            .add_worksheet()
            .set_name(sheet_name)
            .map_err(xlsx_error)?;

        let mut row: u32 = 0;
        if !section.columns.is_empty() {
            for (col, label) in section.columns.iter().enumerate() {
                let col = u16::try_from(col).map_err(|_| position_error())?;
                worksheet
                    .write_string_with_format(row, col, label, &bold)
                    .map_err(xlsx_error)?;
            }
            row += 1;
        }

        for entry in &section.rows {
            for (col, cell) in entry.key.iter().enumerate() {
                let col = u16::try_from(col).map_err(|_| position_error())?;
                worksheet.write_string(row, col, cell).map_err(xlsx_error)?;
            }
            let count_col = u16::try_from(entry.key.len()).map_err(|_| position_error())?;
            worksheet
                .write_number(row, count_col, entry.count as f64)
                .map_err(xlsx_error)?;
            if let Some(sum) = entry.sum {
                let sum_col = count_col.checked_add(1).ok_or_else(position_error)?;
                worksheet
                    .write_number(row, sum_col, sum.to_f64().unwrap_or_default())
                    .map_err(xlsx_error)?;
            }
            row = row.checked_add(1).ok_or_else(position_error)?;
        }
    }

    workbook.save(path).map_err(xlsx_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::AggregationResult;
    use crate::test_support::{dec, labels, main_header};
    use calamine::{open_workbook_auto, Data, Reader};

    fn sample() -> MergeResult {
        let mut merged = MergeResult::new();
        merged.insert(main_header(), labels(&["Alice"]), AggregationResult::new(1, dec("10"))).unwrap();
        merged.insert(main_header(), labels(&["Bob"]), AggregationResult::new(3, dec("25.5"))).unwrap();
        merged.insert(main_header(), labels(&["Carol"]), AggregationResult::new(2, dec("10"))).unwrap();

        let plain = HeaderDefinition::new("archive", labels(&["Id", "Label"]));
        merged.insert(plain.clone(), labels(&["1", "x"]), AggregationResult::new(1, Decimal::ZERO)).unwrap();
        merged.insert(plain, labels(&["2", "y"]), AggregationResult::new(4, Decimal::ZERO)).unwrap();

        merged.insert(HeaderDefinition::unknown(3), labels(&["a", "b", "c"]), AggregationResult::single(Decimal::ZERO)).unwrap();
        merged
    }

    #[test]
    fn test_sections_order_and_columns() {
        let sections = build_sections(&sample());
        let names: Vec<&str> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["archive", "Main", "Unknown_3"]);

        assert_eq!(sections[0].columns, labels(&["Id", "Label", "Count"]));
        assert_eq!(sections[1].columns, labels(&["Name", "Count", "Amount"]));
        assert!(sections[2].columns.is_empty());
    }

    #[test]
    fn test_rows_by_descending_sum_then_key() {
        let sections = build_sections(&sample());
        let keys: Vec<&str> = sections[1].rows.iter().map(|r| r.key[0].as_str()).collect();
        assert_eq!(keys, vec!["Bob", "Alice", "Carol"]);
        assert_eq!(sections[1].rows[0].sum, Some(dec("25.5")));
    }

    #[test]
    fn test_rows_by_descending_count_without_sum_column() {
        let sections = build_sections(&sample());
        let archive = &sections[0];
        assert_eq!(archive.rows[0].key, labels(&["2", "y"]));
        assert!(archive.rows.iter().all(|r| r.sum.is_none()));
    }

    #[test]
    fn test_sheet_names_are_sanitized_and_unique() {
        assert_eq!(sanitize_sheet_name("Q1/Q2: [draft]"), "Q1_Q2_ _draft_");
        assert_eq!(sanitize_sheet_name("   "), "Sheet");
        assert_eq!(sanitize_sheet_name(&"x".repeat(40)).len(), 31);

        let long = "y".repeat(40);
        let names = unique_sheet_names(["Main", "main", "Main", long.as_str(), long.as_str()]);
        assert_eq!(names[0], "Main");
        assert_eq!(names[1], "main (2)");
        assert_eq!(names[2], "Main (3)");
        assert_eq!(names[3].chars().count(), 31);
        assert!(names[4].ends_with(" (2)"));
        assert_eq!(names[4].chars().count(), 31);
    }

    #[test]
    fn test_json_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = export(&sample(), dir.path(), ExportFormat::Json).unwrap();
        assert_eq!(path, dir.path().join("merged.json"));

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value[1]["name"], "Main");
        assert_eq!(value[1]["rows"][0]["key"][0], "Bob");
        assert_eq!(value[1]["rows"][0]["count"], 3);
        assert!(value[0]["rows"][0].get("sum").is_none());
    }

    #[test]
    fn test_xlsx_export_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = export(&sample(), dir.path(), ExportFormat::Xlsx).unwrap();

        let mut workbook = open_workbook_auto(&path).unwrap();
        assert_eq!(workbook.sheet_names(), vec!["archive", "Main", "Unknown_3"]);

        let main = workbook.worksheet_range("Main").unwrap();
        assert_eq!(main.get_value((0, 0)), Some(&Data::String("Name".to_string())));
        assert_eq!(main.get_value((0, 2)), Some(&Data::String("Amount".to_string())));
        assert_eq!(main.get_value((1, 0)), Some(&Data::String("Bob".to_string())));
        assert_eq!(main.get_value((1, 1)), Some(&Data::Float(3.0)));
        assert_eq!(main.get_value((1, 2)), Some(&Data::Float(25.5)));

        // no header row for the label-less placeholder
        let unknown = workbook.worksheet_range("Unknown_3").unwrap();
        assert_eq!(unknown.get_value((0, 0)), Some(&Data::String("a".to_string())));
    }

    #[test]
    fn test_failed_write_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("merged.json");

        let err = write_atomically(&target, |temp| {
            fs::write(temp, "partial")?;
            Err(Error::Export {
                path: temp.to_path_buf(),
                message: "boom".to_string(),
            })
        })
        .unwrap_err();

        assert!(err.to_string().contains("boom"));
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("XLSX".parse::<ExportFormat>().unwrap(), ExportFormat::Xlsx);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("csv".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::default(), ExportFormat::Xlsx);
    }
}
