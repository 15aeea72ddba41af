//! Row source adapter: turns a CSV or workbook file into ordered text rows

use crate::error::{Error, Result};
use crate::table::SourceTable;
use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveTime;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Field delimiter of delimited text sources
pub const CSV_DELIMITER: u8 = b';';

/// Supported source formats, detected from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// `;`-delimited UTF-8 text
    Csv,
    /// Spreadsheet workbook, first sheet only
    Workbook,
}

impl FileFormat {
    /// Detect the format of a path, failing for anything unsupported
    pub fn detect(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("csv") | Some("txt") => Ok(FileFormat::Csv),
            Some("xlsx") | Some("xlsm") | Some("xlsb") | Some("xls") | Some("ods") => {
                Ok(FileFormat::Workbook)
            }
            _ => Err(Error::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Anything that can produce the ordered text rows of a file.
///
/// The merge engine and the reference pass only see files through this trait,
/// so tests can substitute in-memory sources.
pub trait RowSource {
    /// Read every row of `path`
    fn read_rows(&self, path: &Path) -> Result<SourceTable>;
}

/// Reads rows from disk, dispatching on the file extension
#[derive(Debug, Clone, Copy, Default)]
pub struct FileRowSource;

impl RowSource for FileRowSource {
    fn read_rows(&self, path: &Path) -> Result<SourceTable> {
        parse_rows(path)
    }
}

/// Parse a source file into a table of text rows
pub fn parse_rows<P: AsRef<Path>>(path: P) -> Result<SourceTable> {
    let path = path.as_ref();
    match FileFormat::detect(path)? {
        FileFormat::Csv => parse_csv(path),
        FileFormat::Workbook => parse_workbook(path),
    }
}

/// Parse a `;`-delimited file
pub fn parse_csv<P: AsRef<Path>>(path: P) -> Result<SourceTable> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let rows = read_csv_rows(BufReader::new(file), path)?;
    Ok(SourceTable::new(path.to_path_buf(), rows))
}

/// Parse CSV from a string (useful for testing)
pub fn parse_csv_str(content: &str, source_name: &str) -> Result<SourceTable> {
    let path = PathBuf::from(source_name);
    let rows = read_csv_rows(content.as_bytes(), &path)?;
    Ok(SourceTable::new(path, rows))
}

fn read_csv_rows<R: Read>(reader: R, path: &Path) -> Result<Vec<Vec<String>>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(CSV_DELIMITER)
        .has_headers(false) // header detection happens later
        .flexible(true)
        .from_reader(reader);

    let mut rows = Vec::new();
    for result in csv_reader.records() {
        let record = result.map_err(|e| Error::Csv {
            path: path.to_path_buf(),
            source: e,
        })?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

/// Parse the first sheet of a workbook
pub fn parse_workbook<P: AsRef<Path>>(path: P) -> Result<SourceTable> {
    let path = path.as_ref();
    let workbook_error = |message: String| Error::Workbook {
        path: path.to_path_buf(),
        message,
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| workbook_error(e.to_string()))?;
    let range = match workbook.worksheet_range_at(0) {
        Some(range) => range.map_err(|e| workbook_error(e.to_string()))?,
        None => return Err(workbook_error("workbook has no sheets".to_string())),
    };

    let rows = range
        .rows()
        .map(|row| {
            let mut cells: Vec<String> = row.iter().map(cell_to_string).collect();
            // physical rows end at their last populated cell
            while cells.last().is_some_and(|c| c.is_empty()) {
                cells.pop();
            }
            cells
        })
        .collect();

    Ok(SourceTable::new(path.to_path_buf(), rows))
}

/// Render a workbook cell the way it reads in the sheet
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(n) => {
            // integers without decimals
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{}", n)
            }
        }
        Data::Int(n) => n.to_string(),
        Data::Bool(true) => "TRUE".to_string(),
        Data::Bool(false) => "FALSE".to_string(),
        Data::DateTime(dt) if dt.is_datetime() => match dt.as_datetime() {
            Some(value) if value.time() == NaiveTime::MIN => value.format("%Y-%m-%d").to_string(),
            Some(value) => value.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => dt.as_f64().to_string(),
        },
        Data::DateTime(dt) => match dt.as_duration() {
            Some(duration) => {
                let seconds = duration.num_seconds();
                format!("{}:{:02}:{:02}", seconds / 3600, seconds % 3600 / 60, seconds % 60)
            }
            None => dt.as_f64().to_string(),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_semicolon_rows() {
        let table = parse_csv_str("Name;Amount\nAlice;10\nBob;5\n", "test.csv").unwrap();

        assert_eq!(table.row_count(), 3);
        assert_eq!(table.rows[0], vec!["Name", "Amount"]);
        assert_eq!(table.rows[2], vec!["Bob", "5"]);
    }

    #[test]
    fn test_parse_ragged_rows() {
        let table = parse_csv_str("a;b;c\n1\n2;3;4;5\n", "test.csv").unwrap();

        assert_eq!(table.rows[1], vec!["1"]);
        assert_eq!(table.rows[2].len(), 4);
    }

    #[test]
    fn test_commas_are_not_delimiters() {
        let table = parse_csv_str("Item;Price\nWidget;1,50\n", "test.csv").unwrap();
        assert_eq!(table.rows[1], vec!["Widget", "1,50"]);
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(FileFormat::detect(Path::new("a.CSV")).unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::detect(Path::new("a.txt")).unwrap(), FileFormat::Csv);
        assert_eq!(
            FileFormat::detect(Path::new("dir/a.xlsx")).unwrap(),
            FileFormat::Workbook
        );
        assert_eq!(FileFormat::detect(Path::new("a.xls")).unwrap(), FileFormat::Workbook);
    }

    #[test]
    fn test_unsupported_format_names_file() {
        let err = parse_rows("reports/list.pdf").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        assert!(err.to_string().contains("list.pdf"));

        assert!(FileFormat::detect(Path::new("no_extension")).is_err());
    }

    #[test]
    fn test_missing_csv_file() {
        let err = parse_rows("definitely/missing.csv").unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }

    #[test]
    fn test_parse_workbook_first_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.xlsx");

        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Name").unwrap();
        sheet.write_string(0, 1, "Amount").unwrap();
        sheet.write_string(1, 0, "Alice").unwrap();
        sheet.write_number(1, 1, 10.0).unwrap();
        sheet.write_string(2, 0, "Bob").unwrap();
        sheet.write_number(2, 1, 2.5).unwrap();
        sheet.write_string(3, 0, "Carol").unwrap();
        workbook.add_worksheet().write_string(0, 0, "ignored").unwrap();
        workbook.save(&path).unwrap();

        let table = parse_rows(&path).unwrap();
        assert_eq!(table.row_count(), 4);
        assert_eq!(table.rows[0], vec!["Name", "Amount"]);
        assert_eq!(table.rows[1], vec!["Alice", "10"]);
        assert_eq!(table.rows[2], vec!["Bob", "2.5"]);
        assert_eq!(table.rows[3], vec!["Carol"]);
    }

    #[test]
    fn test_cell_to_string() {
        assert_eq!(cell_to_string(&Data::Float(10.0)), "10");
        assert_eq!(cell_to_string(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_to_string(&Data::Int(7)), "7");
        assert_eq!(cell_to_string(&Data::Empty), "");
        assert_eq!(cell_to_string(&Data::Bool(true)), "TRUE");
    }

    #[test]
    fn test_date_cells_render_as_dates() {
        use calamine::{ExcelDateTime, ExcelDateTimeType};

        let date = ExcelDateTime::new(45488.0, ExcelDateTimeType::DateTime, false);
        assert_eq!(cell_to_string(&Data::DateTime(date)), "2024-07-15");
        let noon = ExcelDateTime::new(45488.5, ExcelDateTimeType::DateTime, false);
        assert_eq!(cell_to_string(&Data::DateTime(noon)), "2024-07-15 12:00:00");
        let duration = ExcelDateTime::new(1.5, ExcelDateTimeType::TimeDelta, false);
        assert_eq!(cell_to_string(&Data::DateTime(duration)), "36:00:00");
        assert_eq!(
            cell_to_string(&Data::DateTimeIso("2024-07-15T08:30:00".to_string())),
            "2024-07-15T08:30:00"
        );
    }

    #[test]
    fn test_workbook_date_column_reads_as_text_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dates.xlsx");

        let mut workbook = rust_xlsxwriter::Workbook::new();
        let date_format = rust_xlsxwriter::Format::new().set_num_format("yyyy-mm-dd");
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Delivered").unwrap();
        sheet.write_string(0, 1, "Amount").unwrap();
        let delivered = rust_xlsxwriter::ExcelDateTime::from_ymd(2024, 7, 15).unwrap();
        sheet.write_datetime_with_format(1, 0, &delivered, &date_format).unwrap();
        sheet.write_number(1, 1, 3.0).unwrap();
        workbook.save(&path).unwrap();

        let table = parse_rows(&path).unwrap();
        assert_eq!(table.rows[1], vec!["2024-07-15", "3"]);
    }
}
