//! Merge job: load headers, merge, validate and export on a worker thread.
//!
//! The caller gets a [`JobHandle`] and polls its channel for progress events
//! and the final outcome. Cancellation is checked between stages; nothing is
//! written to the export path before the export stage completes.

use crate::catalog::HeaderCatalog;
use crate::error::{Error, Result};
use crate::export::{export, ExportFormat};
use crate::merger::{merge_files, MergeResult};
use crate::parser::{FileRowSource, RowSource};
use crate::validation::{
    panic_message, validate_guarded, ReferenceSources, ValidationContext, ValidationReport,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// File name of the persisted validation report
pub const REPORT_FILE_NAME: &str = "merged.validation.json";

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LoadHeaders,
    Merge,
    Validate,
    Export,
}

impl Stage {
    pub const COUNT: u32 = 4;

    /// 1-based position of the stage
    pub fn number(&self) -> u32 {
        match self {
            Stage::LoadHeaders => 1,
            Stage::Merge => 2,
            Stage::Validate => 3,
            Stage::Export => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::LoadHeaders => "load headers",
            Stage::Merge => "merge",
            Stage::Validate => "validate",
            Stage::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared flag a caller sets to abandon a job
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Progress after a completed stage; advisory only
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub stage: Stage,
    pub message: String,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {}",
            self.stage.number(),
            Stage::COUNT,
            self.message
        )
    }
}

/// Messages sent from the worker to the caller
#[derive(Debug)]
pub enum JobEvent {
    Progress(Progress),
    Finished(Result<JobOutcome>),
}

/// Result of a successful job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub export_path: PathBuf,
    pub report: ValidationReport,
    pub report_path: Option<PathBuf>,
    pub summary: String,
    pub headers: usize,
    pub total_rows: i64,
    pub finished_at: DateTime<Utc>,
}

/// Behaviour switches of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Export even when validation reports issues
    pub continue_on_validation_errors: bool,
    /// Persist the validation report next to the export
    pub write_report: bool,
    pub format: ExportFormat,
}

/// A fully configured merge job
pub struct MergeJob {
    files: Vec<PathBuf>,
    output_dir: PathBuf,
    headers_dir: Option<PathBuf>,
    catalog: Option<HeaderCatalog>,
    context: ValidationContext,
    options: JobOptions,
    source: Arc<dyn RowSource + Send + Sync>,
}

impl MergeJob {
    pub fn new(files: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            files,
            output_dir: output_dir.into(),
            headers_dir: None,
            catalog: None,
            context: ValidationContext::default(),
            options: JobOptions::default(),
            source: Arc::new(FileRowSource),
        }
    }

    /// External directory whose definitions override the bundled catalog
    pub fn with_headers_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.headers_dir = Some(dir.into());
        self
    }

    /// Use this catalog instead of loading one
    pub fn with_catalog(mut self, catalog: HeaderCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_context(mut self, context: ValidationContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the file reader, mainly for tests
    pub fn with_source(mut self, source: Arc<dyn RowSource + Send + Sync>) -> Self {
        self.source = source;
        self
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run the job on a dedicated worker thread
    pub fn spawn(self) -> Result<JobHandle> {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();

        let thread = thread::Builder::new()
            .name("lm-merge-job".to_string())
            .spawn(move || {
                let outcome = self.run(&worker_cancel, &|progress| {
                    let _ = tx.send(JobEvent::Progress(progress));
                });
                // the caller may have dropped the handle
                let _ = tx.send(JobEvent::Finished(outcome));
            })?;

        Ok(JobHandle {
            events: rx,
            cancel,
            thread: Some(thread),
        })
    }

    /// Run all four stages on the current thread
    pub fn run(&self, cancel: &CancelToken, progress: &dyn Fn(Progress)) -> Result<JobOutcome> {
        let report_stage = |stage: Stage, message: String| {
            info!(stage = %stage, "{}", message);
            progress(Progress { stage, message });
        };

        checkpoint(cancel, Stage::LoadHeaders)?;
        let catalog = match &self.catalog {
            Some(catalog) => catalog.clone(),
            None => HeaderCatalog::load(self.headers_dir.as_deref())?,
        };
        report_stage(
            Stage::LoadHeaders,
            format!("Loaded {} header definitions.", catalog.len()),
        );

        checkpoint(cancel, Stage::Merge)?;
        let merged = merge_files(&self.files, &catalog, self.source.as_ref())?;
        report_stage(
            Stage::Merge,
            format!(
                "Merged {} files into {} header groups.",
                self.files.len(),
                merged.len()
            ),
        );

        checkpoint(cancel, Stage::Validate)?;
        let report = self.run_validation(&merged, &catalog)?;
        let summary = report.summary();
        let report_path = if self.options.write_report {
            fs::create_dir_all(&self.output_dir)?;
            let path = self.output_dir.join(REPORT_FILE_NAME);
            report.save(&path)?;
            Some(path)
        } else {
            None
        };
        report_stage(Stage::Validate, summary.clone());

        if !report.is_valid() {
            if !self.options.continue_on_validation_errors {
                return Err(Error::ValidationFailed {
                    summary,
                    report_path,
                });
            }
            warn!(issues = report.issues().len(), "exporting despite validation issues");
        }

        checkpoint(cancel, Stage::Export)?;
        let export_path = export(&merged, &self.output_dir, self.options.format)?;
        report_stage(
            Stage::Export,
            format!("Exported to {}.", export_path.display()),
        );

        Ok(JobOutcome {
            export_path,
            report,
            report_path,
            summary,
            headers: merged.len(),
            total_rows: merged.total_rows(),
            finished_at: Utc::now(),
        })
    }

    /// Validate, turning a panic inside the validator into an error
    fn run_validation(&self, merged: &MergeResult, catalog: &HeaderCatalog) -> Result<ValidationReport> {
        let sources = ReferenceSources {
            files: &self.files,
            catalog,
            source: self.source.as_ref(),
        };
        validate_guarded(merged, &self.context, Some(&sources))
    }
}

fn checkpoint(cancel: &CancelToken, stage: Stage) -> Result<()> {
    if cancel.is_cancelled() {
        info!(stage = %stage, "job cancelled");
        return Err(Error::Cancelled(stage.name()));
    }
    Ok(())
}

/// Caller side of a spawned job
pub struct JobHandle {
    events: Receiver<JobEvent>,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl JobHandle {
    /// Channel of progress events followed by exactly one `Finished`
    pub fn events(&self) -> &Receiver<JobEvent> {
        &self.events
    }

    /// Ask the worker to stop before its next stage
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block until the job finishes, handing each progress event to `on_progress`
    pub fn wait_with(mut self, mut on_progress: impl FnMut(&Progress)) -> Result<JobOutcome> {
        let mut outcome = None;
        for event in self.events.iter() {
            match event {
                JobEvent::Progress(progress) => on_progress(&progress),
                JobEvent::Finished(result) => {
                    outcome = Some(result);
                    break;
                }
            }
        }

        let joined = self.thread.take().map(JoinHandle::join);
        match (outcome, joined) {
            (Some(result), _) => result,
            (None, Some(Err(payload))) => Err(Error::Worker(panic_message(payload.as_ref()))),
            (None, _) => Err(Error::Worker("no outcome reported".to_string())),
        }
    }

    /// Block until the job finishes, discarding progress
    pub fn wait(self) -> Result<JobOutcome> {
        self.wait_with(|_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{catalog_of, dec, main_header, MemorySource};
    use crate::table::SourceTable;
    use crate::validation::IssueCode;
    use std::sync::atomic::AtomicUsize;
    use std::cell::RefCell;

    fn job(dir: &Path) -> MergeJob {
        let source = MemorySource::new().with("a.csv", "Name;Amount\nAlice;10\nBob;5\n");
        MergeJob::new(vec![PathBuf::from("a.csv")], dir)
            .with_catalog(catalog_of(vec![main_header()]))
            .with_source(Arc::new(source))
    }

    #[test]
    fn test_run_reports_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let seen = RefCell::new(Vec::new());
        let outcome = job(dir.path())
            .with_context(ValidationContext::new().expect_sum("Main", dec("15")))
            .run(&CancelToken::new(), &|p| seen.borrow_mut().push(p))
            .unwrap();

        let stages: Vec<u32> = seen.borrow().iter().map(|p| p.stage.number()).collect();
        assert_eq!(stages, vec![1, 2, 3, 4]);
        assert_eq!(seen.borrow()[2].message, "Validation: OK (0 issues).");
        assert_eq!(outcome.export_path, dir.path().join("merged.xlsx"));
        assert!(outcome.export_path.exists());
        assert_eq!(outcome.total_rows, 2);
        assert!(outcome.report_path.is_none());
    }

    #[test]
    fn test_validation_failure_blocks_export_but_keeps_report() {
        let dir = tempfile::tempdir().unwrap();
        let options = JobOptions {
            write_report: true,
            ..JobOptions::default()
        };
        let err = job(dir.path())
            .with_context(ValidationContext::new().expect_sum("Main", dec("8")))
            .with_options(options)
            .run(&CancelToken::new(), &|_| {})
            .unwrap_err();

        match err {
            Error::ValidationFailed {
                summary,
                report_path,
            } => {
                assert!(summary.starts_with("Validation: ERROR (1 issues). SUM_MISMATCH [Main]"));
                let report = ValidationReport::load(report_path.unwrap()).unwrap();
                assert!(report.has_code(IssueCode::SumMismatch));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!dir.path().join("merged.xlsx").exists());
    }

    #[test]
    fn test_continue_on_validation_errors_exports() {
        let dir = tempfile::tempdir().unwrap();
        let options = JobOptions {
            continue_on_validation_errors: true,
            format: ExportFormat::Json,
            ..JobOptions::default()
        };
        let outcome = job(dir.path())
            .with_context(ValidationContext::new().expect_row_count("Main", 9))
            .with_options(options)
            .run(&CancelToken::new(), &|_| {})
            .unwrap();

        assert!(!outcome.report.is_valid());
        assert_eq!(outcome.export_path, dir.path().join("merged.json"));
        assert!(outcome.export_path.exists());
    }

    #[test]
    fn test_cancelled_job_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = job(&out).run(&cancel, &|_| {}).unwrap_err();
        assert!(matches!(err, Error::Cancelled("load headers")));
        assert!(!out.exists());
    }

    #[test]
    fn test_cancel_between_stages() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let err = job(dir.path())
            .run(&cancel, &|p| {
                if p.stage == Stage::Merge {
                    cancel.cancel();
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled("validate")));
        assert!(!dir.path().join("merged.xlsx").exists());
    }

    #[test]
    fn test_spawned_job_delivers_progress_and_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let handle = job(dir.path()).spawn().unwrap();

        let mut lines = Vec::new();
        let outcome = handle.wait_with(|p| lines.push(p.to_string())).unwrap();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("[1/4] Loaded 1 header definitions."));
        assert!(outcome.report.is_valid());
    }

    #[test]
    fn test_read_failure_aborts_job() {
        let dir = tempfile::tempdir().unwrap();
        let err = MergeJob::new(vec![PathBuf::from("missing.csv")], dir.path())
            .with_catalog(catalog_of(vec![main_header()]))
            .with_source(Arc::new(MemorySource::new()))
            .spawn()
            .unwrap()
            .wait()
            .unwrap_err();
        assert!(err.to_string().contains("missing.csv"));
    }

    /// Serves files normally until the reference pass re-reads them
    struct FailingRereadSource {
        inner: MemorySource,
        reads: AtomicUsize,
    }

    impl RowSource for FailingRereadSource {
        fn read_rows(&self, path: &Path) -> Result<SourceTable> {
            if self.reads.fetch_add(1, Ordering::SeqCst) > 0 {
                panic!("row source broke during re-read");
            }
            self.inner.read_rows(path)
        }
    }

    #[test]
    fn test_validator_panic_aborts_without_export() {
        let dir = tempfile::tempdir().unwrap();
        let source = FailingRereadSource {
            inner: MemorySource::new().with("a.csv", "Name;Amount\nAlice;10\nBob;5\n"),
            reads: AtomicUsize::new(0),
        };

        let err = MergeJob::new(vec![PathBuf::from("a.csv")], dir.path())
            .with_catalog(catalog_of(vec![main_header()]))
            .with_context(ValidationContext::new().with_reference_pass(true))
            .with_options(JobOptions {
                continue_on_validation_errors: true,
                write_report: true,
                ..JobOptions::default()
            })
            .with_source(Arc::new(source))
            .spawn()
            .unwrap()
            .wait()
            .unwrap_err();

        assert!(matches!(err, Error::ValidationAborted(ref m) if m.contains("re-read")), "{}", err);
        assert!(err.to_string().contains("export aborted for safety"));
        assert!(!dir.path().join("merged.xlsx").exists());
        assert!(!dir.path().join("merged.json").exists());
        assert!(!dir.path().join(REPORT_FILE_NAME).exists());
    }

    #[test]
    fn test_merge_overflow_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let max = rust_decimal::Decimal::MAX;
        let source = MemorySource::new().with("a.csv", &format!("Name;Amount\nA;{}\nA;{}\n", max, max));

        let err = MergeJob::new(vec![PathBuf::from("a.csv")], dir.path())
            .with_catalog(catalog_of(vec![main_header()]))
            .with_source(Arc::new(source))
            .spawn()
            .unwrap()
            .wait()
            .unwrap_err();

        assert!(matches!(err, Error::SumOverflow { .. }), "{}", err);
        assert!(!dir.path().join("merged.xlsx").exists());
    }
}
