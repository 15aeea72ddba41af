//! Header resolution: pick the template matching a file's boundary rows
//!
//! Resolution order (first match wins):
//! 1. exact match of the normalized labels
//! 2. match against one of the alias label sets
//! 3. the only template whose label count equals the row length
//! 4. an `Unknown_<len>` placeholder
//!
//! Templates positioned `FIRST` are compared against the first row, templates
//! positioned `LAST` against the last non-blank row.

use crate::catalog::HeaderCatalog;
use crate::header::{normalize_row, HeaderDefinition, HeaderPosition};
use crate::table::SourceTable;
use serde::Serialize;
use std::fmt;

/// How a template was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Alias,
    UniqueLength,
    Unknown,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchKind::Exact => write!(f, "exact"),
            MatchKind::Alias => write!(f, "alias"),
            MatchKind::UniqueLength => write!(f, "unique length"),
            MatchKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// The chosen template and the rule that selected it
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub definition: HeaderDefinition,
    pub kind: MatchKind,
}

/// Choose a template for a file given its first and last non-blank rows
pub fn resolve_header<S: AsRef<str>>(
    first_row: &[S],
    last_row: &[S],
    catalog: &HeaderCatalog,
) -> Resolution {
    let first = normalize_row(first_row);
    let last = normalize_row(last_row);

    if let Some(def) = catalog
        .iter()
        .find(|def| def.normalized_headers() == candidate(def, &first, &last))
    {
        return chosen(def, MatchKind::Exact);
    }

    if let Some(def) = catalog.iter().find(|def| {
        let row = candidate(def, &first, &last);
        def.normalized_aliases().iter().any(|alias| alias.as_slice() == row)
    }) {
        return chosen(def, MatchKind::Alias);
    }

    let mut same_length = catalog
        .iter()
        .filter(|def| def.normalized_headers().len() == candidate(def, &first, &last).len());
    if let (Some(def), None) = (same_length.next(), same_length.next()) {
        return chosen(def, MatchKind::UniqueLength);
    }

    Resolution {
        definition: HeaderDefinition::unknown(first.len()),
        kind: MatchKind::Unknown,
    }
}

/// Resolve the template of a whole table.
///
/// Returns the resolution and the index of the header row, or `None` when
/// the table has no non-blank row.
pub fn resolve_table(table: &SourceTable, catalog: &HeaderCatalog) -> Option<(Resolution, usize)> {
    let last_index = table.last_non_blank_index()?;
    let last_row = table.get(last_index).unwrap_or(&[]);
    let resolution = resolve_header(table.first_row(), last_row, catalog);
    let header_index = header_row_index(&resolution.definition, last_index);
    Some((resolution, header_index))
}

/// Index of the header row for a template, given the last non-blank row index
pub fn header_row_index(definition: &HeaderDefinition, last_non_blank: usize) -> usize {
    match definition.header_position() {
        HeaderPosition::First => 0,
        HeaderPosition::Last => last_non_blank,
    }
}

/// The normalized row a template is compared against
fn candidate<'a>(def: &HeaderDefinition, first: &'a [String], last: &'a [String]) -> &'a [String] {
    match def.header_position() {
        HeaderPosition::First => first,
        HeaderPosition::Last => last,
    }
}

fn chosen(def: &HeaderDefinition, kind: MatchKind) -> Resolution {
    Resolution {
        definition: def.clone(),
        kind,
    }
}
