//! List Merge CLI
//!
//! Command-line tool for merging, validating and exporting tabular list exports.

use clap::{Args, Parser, Subcommand};
use lm_core::merger::merge_files;
use lm_core::resolver::resolve_table;
use lm_core::{
    parse_rows, validate_guarded, Error, ExportFormat, FileRowSource, HeaderCatalog, JobConfig,
    ReferenceSources,
};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lm-cli")]
#[command(about = "Merge, aggregate and validate tabular list exports", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the effective header catalog
    Headers {
        /// Directory with header definitions overriding the bundled ones
        #[arg(long)]
        headers_dir: Option<PathBuf>,
    },

    /// Parse and display the rows of a single file
    Parse {
        /// Path to a CSV or workbook file
        #[arg(short, long)]
        file: PathBuf,

        /// Maximum number of rows to display
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show which header template a file resolves to
    Resolve {
        /// Path to a CSV or workbook file
        #[arg(short, long)]
        file: PathBuf,

        /// Directory with header definitions overriding the bundled ones
        #[arg(long)]
        headers_dir: Option<PathBuf>,
    },

    /// Merge, validate and export files
    Merge(JobArgs),

    /// Merge and validate only; prints the report as JSON
    Validate(JobArgs),

    /// Create a job configuration template
    CreateConfig {
        /// Output path for the configuration file
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args)]
struct JobArgs {
    /// Job configuration file (JSON); flags below are applied on top
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source files, merged in the given order
    #[arg(short, long)]
    file: Vec<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory with header definitions overriding the bundled ones
    #[arg(long)]
    headers_dir: Option<PathBuf>,

    /// Expected row count (NAME=COUNT)
    #[arg(long, value_parser = parse_expected_count)]
    expect: Vec<(String, u64)>,

    /// Expected sum (NAME=SUM)
    #[arg(long, value_parser = parse_expected_sum)]
    expect_sum: Vec<(String, Decimal)>,

    /// Report missing expectations as issues
    #[arg(long)]
    strict: bool,

    /// Cross-check the merge against an independent recomputation
    #[arg(long)]
    reference: bool,

    /// Allowed absolute sum difference
    #[arg(long, value_parser = parse_decimal)]
    tolerance: Option<Decimal>,

    /// Fractional digits sums are rounded to before comparison
    #[arg(long)]
    scale: Option<u32>,

    /// Export even when validation reports issues
    #[arg(long)]
    continue_on_errors: bool,

    /// Write merged.validation.json next to the export
    #[arg(long)]
    write_report: bool,

    /// Export format (xlsx or json)
    #[arg(long)]
    format: Option<ExportFormat>,
}

impl JobArgs {
    /// Combine the configuration file (if any) with the command line flags
    fn into_config(self) -> lm_core::Result<JobConfig> {
        let mut config = match &self.config {
            Some(path) => JobConfig::load(path)?,
            None => JobConfig::default(),
        };

        config.files.extend(self.file);
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if self.headers_dir.is_some() {
            config.headers_dir = self.headers_dir;
        }

        let mut context = config.validation;
        for (name, count) in self.expect {
            context = context.expect_row_count(name, count);
        }
        for (name, sum) in self.expect_sum {
            context = context.expect_sum(name, sum);
        }
        if self.strict {
            context = context.strict();
        }
        if self.reference {
            context = context.with_reference_pass(true);
        }
        if let Some(tolerance) = self.tolerance {
            context = context.with_tolerance(tolerance);
        }
        if let Some(scale) = self.scale {
            context = context.with_scale(scale);
        }
        config.validation = context;

        config.continue_on_validation_errors |= self.continue_on_errors;
        config.write_report |= self.write_report;
        if let Some(format) = self.format {
            config.format = format;
        }
        Ok(config)
    }
}

fn parse_decimal(value: &str) -> Result<Decimal, String> {
    Decimal::from_str(value.trim().replace(',', ".").as_str())
        .map_err(|e| format!("invalid number '{}': {}", value, e))
}

fn split_assignment(value: &str) -> Result<(String, &str), String> {
    match value.rsplit_once('=') {
        Some((name, rhs)) if !name.trim().is_empty() => Ok((name.trim().to_string(), rhs.trim())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", value)),
    }
}

fn parse_expected_count(value: &str) -> Result<(String, u64), String> {
    let (name, count) = split_assignment(value)?;
    let count = count
        .parse()
        .map_err(|_| format!("invalid row count '{}'", count))?;
    Ok((name, count))
}

fn parse_expected_sum(value: &str) -> Result<(String, Decimal), String> {
    let (name, sum) = split_assignment(value)?;
    Ok((name, parse_decimal(sum)?))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn,lm_core=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_tracing();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> lm_core::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Headers { headers_dir } => cmd_headers(headers_dir.as_deref()),
        Commands::Parse { file, limit } => cmd_parse(&file, limit),
        Commands::Resolve { file, headers_dir } => cmd_resolve(&file, headers_dir.as_deref()),
        Commands::Merge(args) => cmd_merge(args.into_config()?),
        Commands::Validate(args) => cmd_validate(args.into_config()?),
        Commands::CreateConfig { output } => cmd_create_config(&output),
    }
}

fn cmd_headers(headers_dir: Option<&Path>) -> lm_core::Result<()> {
    let catalog = HeaderCatalog::load(headers_dir)?;

    println!("Header templates ({}):", catalog.len());
    println!();
    for definition in &catalog {
        println!("{} ({})", definition.name(), definition.header_position());
        println!("  Labels: {}", definition.headers().join(", "));
        for alias in definition.header_aliases() {
            println!("  Alias:  {}", alias.join(", "));
        }
        if let Some(sum_column) = definition.sum_column() {
            let pattern = definition
                .sum_pattern()
                .unwrap_or(lm_core::merger::DEFAULT_SUM_PATTERN);
            println!("  Sum:    {} ~ {}", sum_column, pattern);
        }
    }

    Ok(())
}

fn cmd_parse(file: &Path, limit: usize) -> lm_core::Result<()> {
    let table = parse_rows(file)?;

    println!("File: {}", file.display());
    println!("Rows: {}", table.row_count());
    println!();

    for (i, row) in table.rows.iter().take(limit).enumerate() {
        println!("{:>4}  {}", i + 1, row.join("\t"));
    }

    if table.row_count() > limit {
        println!("... ({} more rows)", table.row_count() - limit);
    }

    Ok(())
}

fn cmd_resolve(file: &Path, headers_dir: Option<&Path>) -> lm_core::Result<()> {
    let catalog = HeaderCatalog::load(headers_dir)?;
    let table = parse_rows(file)?;

    println!("File: {}", file.display());
    match resolve_table(&table, &catalog) {
        Some((resolution, header_index)) => {
            println!("Template: {}", resolution.definition.name());
            println!("Matched:  {}", resolution.kind);
            println!("Header row: {}", header_index + 1);
            match resolution.definition.sum_column_index() {
                Some(index) => println!("Sum column: {} (column {})", resolution.definition.headers()[index], index + 1),
                None => println!("Sum column: none"),
            }
        }
        None => println!("No non-blank rows; the file contributes nothing."),
    }

    Ok(())
}

fn cmd_merge(config: JobConfig) -> lm_core::Result<()> {
    require_files(&config)?;
    if config.output_dir.as_os_str().is_empty() {
        return Err(invalid_input("no output directory given (use --output or outputDir)"));
    }

    debug!(
        files = config.files.len(),
        output = %config.output_dir.display(),
        format = %config.format,
        "starting merge job"
    );
    let handle = config.to_job().spawn()?;
    match handle.wait_with(|progress| println!("{}", progress)) {
        Ok(outcome) => {
            println!();
            println!("{}", outcome.summary);
            println!(
                "Merged {} rows into {} header groups",
                outcome.total_rows, outcome.headers
            );
            println!("Export: {}", outcome.export_path.display());
            if let Some(path) = &outcome.report_path {
                println!("Report: {}", path.display());
            }
            Ok(())
        }
        Err(Error::ValidationFailed {
            summary,
            report_path,
        }) => {
            if let Some(path) = &report_path {
                println!("Report: {}", path.display());
            }
            Err(Error::ValidationFailed {
                summary,
                report_path,
            })
        }
        Err(e) => Err(e),
    }
}

fn cmd_validate(config: JobConfig) -> lm_core::Result<()> {
    require_files(&config)?;

    let catalog = HeaderCatalog::load(config.headers_dir.as_deref())?;
    let source = FileRowSource;
    let merged = merge_files(&config.files, &catalog, &source)?;
    let sources = ReferenceSources {
        files: &config.files,
        catalog: &catalog,
        source: &source,
    };
    let report = validate_guarded(&merged, &config.validation, Some(&sources))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    eprintln!("{}", report.summary());

    if !report.is_valid() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_create_config(output: &Path) -> lm_core::Result<()> {
    let config = JobConfig::template();
    config.save(output)?;

    println!("Created job configuration: {}", output.display());
    println!();
    println!("Edit the file to list your sources and expectations, then run:");
    println!("  lm-cli merge --config {}", output.display());

    Ok(())
}

fn require_files(config: &JobConfig) -> lm_core::Result<()> {
    if config.files.is_empty() {
        return Err(invalid_input("no source files given (use --file or a config with files)"));
    }
    Ok(())
}

fn invalid_input(message: &str) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, message.to_string()))
}
