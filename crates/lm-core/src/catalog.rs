//! Header catalog: bundled templates plus external overrides
//!
//! The bundled templates are compiled into the library (`headers/index.json`
//! lists them in load order). An optional external directory of `*.json`
//! documents replaces bundled entries that share a name.

use crate::error::{Error, Result};
use crate::header::{HeaderDefinition, HeaderPosition};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const BUNDLED_INDEX: &str = include_str!("../headers/index.json");

const BUNDLED_FILES: &[(&str, &str)] = &[
    ("article-list.json", include_str!("../headers/article-list.json")),
    ("order-summary.json", include_str!("../headers/order-summary.json")),
];

/// On-disk shape of a header template
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeaderDocument {
    name: Option<String>,
    headers: Option<Vec<String>>,
    header_aliases: Option<Vec<Vec<String>>>,
    #[serde(default)]
    header_position: HeaderPosition,
    sum_column: Option<String>,
    sum_pattern: Option<String>,
}

impl HeaderDocument {
    fn into_definition(self, source_name: &str) -> Result<HeaderDefinition> {
        let invalid = |message: &str| Error::InvalidHeader {
            source_name: source_name.to_string(),
            message: message.to_string(),
        };

        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| invalid("missing name"))?;
        let headers = self
            .headers
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing headers"))?;

        if let Some(pattern) = self.sum_pattern.as_deref().filter(|p| !p.trim().is_empty()) {
            Regex::new(pattern).map_err(|e| Error::Pattern {
                pattern: pattern.to_string(),
                source: e,
            })?;
        }

        let mut definition = HeaderDefinition::new(name, headers)
            .with_aliases(self.header_aliases.unwrap_or_default())
            .with_position(self.header_position);
        if let Some(sum_column) = self.sum_column {
            definition = definition.with_sum_column(sum_column);
        }
        if let Some(sum_pattern) = self.sum_pattern {
            definition = definition.with_sum_pattern(sum_pattern);
        }
        Ok(definition)
    }
}

/// Parse and validate one header document
pub fn parse_definition(content: &str, source_name: &str) -> Result<HeaderDefinition> {
    let document: HeaderDocument = serde_json::from_str(content).map_err(|e| Error::InvalidHeader {
        source_name: source_name.to_string(),
        message: e.to_string(),
    })?;
    document.into_definition(source_name)
}

/// The ordered, immutable set of header templates used by one job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderCatalog {
    definitions: Vec<HeaderDefinition>,
}

impl HeaderCatalog {
    /// Build a catalog from definitions as given, without validation
    pub fn from_definitions(definitions: Vec<HeaderDefinition>) -> Self {
        Self { definitions }
    }

    /// The templates compiled into the library
    pub fn bundled() -> Result<Self> {
        let index: Vec<String> = serde_json::from_str(BUNDLED_INDEX).map_err(|e| Error::InvalidHeader {
            source_name: "headers/index.json".to_string(),
            message: e.to_string(),
        })?;

        let mut definitions = Vec::with_capacity(index.len());
        for file_name in &index {
            let source_name = format!("headers/{}", file_name);
            match BUNDLED_FILES.iter().find(|(name, _)| name == file_name) {
                Some((_, content)) => definitions.push(parse_definition(content, &source_name)?),
                None => warn!(file = %source_name, "bundled header listed in index but not found"),
            }
        }

        Ok(Self { definitions })
    }

    /// Bundled templates, overridden by the documents in `external_dir` if it exists
    pub fn load(external_dir: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::bundled()?;
        if let Some(dir) = external_dir {
            catalog.apply_overrides(dir)?;
        }
        info!(templates = catalog.len(), "header catalog loaded");
        Ok(catalog)
    }

    /// Replace same-named entries with the `*.json` documents found in `dir`.
    ///
    /// Overridden entries are removed and all external entries appended, in
    /// file name order. A missing directory is not an error.
    pub fn apply_overrides(&mut self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            info!(dir = %dir.display(), "no external headers directory (optional)");
            return Ok(());
        }

        let mut overrides: Vec<HeaderDefinition> = Vec::new();
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file() || !is_override_document(path) {
                continue;
            }

            let content = fs::read_to_string(path).map_err(|e| Error::FileRead {
                path: path.to_path_buf(),
                source: e,
            })?;
            let definition = parse_definition(&content, &path.display().to_string())?;
            debug!(name = definition.name(), file = %path.display(), "external header loaded");

            match overrides.iter_mut().find(|d| d.name() == definition.name()) {
                Some(existing) => *existing = definition,
                None => overrides.push(definition),
            }
        }

        if !overrides.is_empty() {
            self.definitions
                .retain(|d| !overrides.iter().any(|o| o.name() == d.name()));
            info!(count = overrides.len(), "external header definitions applied");
            self.definitions.extend(overrides);
        }
        Ok(())
    }

    pub fn definitions(&self) -> &[HeaderDefinition] {
        &self.definitions
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HeaderDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Find a template by exact name
    pub fn find(&self, name: &str) -> Option<&HeaderDefinition> {
        self.definitions.iter().find(|d| d.name() == name)
    }
}

impl<'a> IntoIterator for &'a HeaderCatalog {
    type Item = &'a HeaderDefinition;
    type IntoIter = std::slice::Iter<'a, HeaderDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn is_override_document(path: &Path) -> bool {
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let is_index = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.eq_ignore_ascii_case("index.json"));
    is_json && !is_index
}
