//! Job configuration files

use crate::error::{Error, Result};
use crate::export::ExportFormat;
use crate::pipeline::{JobOptions, MergeJob};
use crate::validation::ValidationContext;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A merge job described as JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    /// Source files, merged in this order
    pub files: Vec<PathBuf>,
    /// Directory receiving the export and the report
    pub output_dir: PathBuf,
    /// External header definitions overriding the bundled ones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers_dir: Option<PathBuf>,
    pub validation: ValidationContext,
    pub continue_on_validation_errors: bool,
    pub write_report: bool,
    pub format: ExportFormat,
}

impl JobConfig {
    /// Load a job configuration from JSON.
    ///
    /// Relative paths are resolved against the directory holding the file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config: JobConfig = serde_json::from_str(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Save the configuration to JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// A starting point for `create-config`
    pub fn template() -> Self {
        Self {
            files: vec![PathBuf::from("input/first.csv"), PathBuf::from("input/second.xlsx")],
            output_dir: PathBuf::from("output"),
            headers_dir: Some(PathBuf::from("headers")),
            validation: ValidationContext::default(),
            continue_on_validation_errors: false,
            write_report: true,
            format: ExportFormat::Xlsx,
        }
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &Path| {
            if p.is_relative() {
                base.join(p)
            } else {
                p.to_path_buf()
            }
        };
        self.files = self.files.iter().map(|f| resolve(f.as_path())).collect();
        self.output_dir = resolve(self.output_dir.as_path());
        self.headers_dir = self.headers_dir.as_deref().map(resolve);
    }

    pub fn options(&self) -> JobOptions {
        JobOptions {
            continue_on_validation_errors: self.continue_on_validation_errors,
            write_report: self.write_report,
            format: self.format,
        }
    }

    /// Build the merge job this configuration describes
    pub fn to_job(&self) -> MergeJob {
        let mut job = MergeJob::new(self.files.clone(), self.output_dir.clone())
            .with_context(self.validation.clone())
            .with_options(self.options());
        if let Some(dir) = &self.headers_dir {
            job = job.with_headers_dir(dir.clone());
        }
        job
    }
}
