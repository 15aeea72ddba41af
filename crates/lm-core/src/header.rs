//! Header templates describing the column layout of a source file

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Where the header row sits inside a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HeaderPosition {
    /// First physical row
    #[default]
    First,
    /// Last non-blank row (footer-style layouts)
    Last,
}

impl HeaderPosition {
    /// Parse a position name case-insensitively; blank means `First`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "" | "FIRST" => Some(HeaderPosition::First),
            "LAST" => Some(HeaderPosition::Last),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderPosition::First => write!(f, "FIRST"),
            HeaderPosition::Last => write!(f, "LAST"),
        }
    }
}

impl<'de> Deserialize<'de> for HeaderPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(HeaderPosition::First),
            Some(value) => HeaderPosition::parse(&value).ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "unknown header position '{}', expected FIRST or LAST",
                    value
                ))
            }),
        }
    }
}

/// A named header template.
///
/// Immutable once built; the catalog owns the canonical instances and the
/// merge result uses them as bucket keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderDefinition {
    name: String,
    headers: Vec<String>,
    header_aliases: Vec<Vec<String>>,
    header_position: HeaderPosition,
    sum_column: Option<String>,
    sum_pattern: Option<String>,
}

impl HeaderDefinition {
    /// Create a template with the given labels and default settings
    pub fn new(name: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            headers,
            header_aliases: Vec::new(),
            header_position: HeaderPosition::First,
            sum_column: None,
            sum_pattern: None,
        }
    }

    /// Placeholder for files no template matched
    pub fn unknown(column_count: usize) -> Self {
        Self::new(format!("Unknown_{}", column_count), Vec::new())
    }

    /// Add alternative label sets
    pub fn with_aliases(mut self, aliases: Vec<Vec<String>>) -> Self {
        self.header_aliases = aliases;
        self
    }

    /// Set the header position
    pub fn with_position(mut self, position: HeaderPosition) -> Self {
        self.header_position = position;
        self
    }

    /// Declare the column whose values are summed; blank labels are ignored
    pub fn with_sum_column(mut self, label: impl Into<String>) -> Self {
        self.sum_column = non_blank(label.into());
        self
    }

    /// Override the sum extraction pattern; blank patterns are ignored
    pub fn with_sum_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.sum_pattern = non_blank(pattern.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn header_aliases(&self) -> &[Vec<String>] {
        &self.header_aliases
    }

    pub fn header_position(&self) -> HeaderPosition {
        self.header_position
    }

    pub fn sum_column(&self) -> Option<&str> {
        self.sum_column.as_deref()
    }

    pub fn sum_pattern(&self) -> Option<&str> {
        self.sum_pattern.as_deref()
    }

    /// True when the template declares a sum column, found or not
    pub fn has_sum_column(&self) -> bool {
        self.sum_column.is_some()
    }

    /// Position of the sum column among the labels, compared case-insensitively
    pub fn sum_column_index(&self) -> Option<usize> {
        let wanted = self.sum_column.as_deref()?.to_lowercase();
        self.headers
            .iter()
            .position(|label| label.to_lowercase() == wanted)
    }

    /// Labels in normalized form (see [`normalize_row`])
    pub fn normalized_headers(&self) -> Vec<String> {
        normalize_row(&self.headers)
    }

    /// Alias label sets in normalized form
    pub fn normalized_aliases(&self) -> Vec<Vec<String>> {
        self.header_aliases.iter().map(|a| normalize_row(a)).collect()
    }

    /// Blank names are only possible for programmatically built catalogs
    pub fn has_blank_name(&self) -> bool {
        self.name.trim().is_empty()
    }
}

impl fmt::Display for HeaderDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] ({})",
            self.name,
            self.headers.join(", "),
            self.header_position
        )
    }
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Trim and lower-case a single cell
pub fn normalize_cell(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Normalize every cell, then drop trailing blank cells
pub fn normalize_row<S: AsRef<str>>(row: &[S]) -> Vec<String> {
    let mut normalized: Vec<String> = row.iter().map(|c| normalize_cell(c.as_ref())).collect();
    while normalized.last().is_some_and(|c| c.is_empty()) {
        normalized.pop();
    }
    normalized
}
