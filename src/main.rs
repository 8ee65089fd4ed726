use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use decl_annotate::config::{load_default, load_from_path, OutputFormat, Settings};
use decl_annotate::edit::EditRecord;
use decl_annotate::frontend::CompilationDatabase;
use decl_annotate::{init_tracing, Driver, DriverOptions, RunReport};
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use walkdir::WalkDir;

const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "c++"];

#[derive(Parser)]
#[command(name = "decl-annotate")]
#[command(
    about = "Insert a descriptive comment before every C/C++ record and field declaration",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Source files, or directories to search for C/C++ sources
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// Compiler flags used for every file instead of a compilation database
    #[arg(last = true)]
    compiler_args: Vec<String>,

    /// Directory containing compile_commands.json (or the file itself)
    #[arg(short = 'p', long)]
    build_path: Option<PathBuf>,

    /// Only annotate records that declare at least one field
    #[arg(long)]
    require_field: bool,

    /// Format of the edit listing
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Do not print rewritten buffers
    #[arg(long)]
    no_rewrite: bool,

    /// Show a unified diff instead of whole rewritten buffers
    #[arg(long)]
    diff: bool,

    /// Write the rewritten files back to disk
    #[arg(long)]
    in_place: bool,

    /// Settings file (defaults to .decl-annotate.toml in the working directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

/// Effective options after merging the settings file with flags.
struct Resolved {
    format: OutputFormat,
    rewrite: bool,
    diff: bool,
    build_path: Option<PathBuf>,
    driver: DriverOptions,
}

impl Resolved {
    fn new(cli: &Cli, settings: Settings) -> Self {
        Self {
            format: cli.format.unwrap_or(settings.output.format),
            rewrite: !cli.no_rewrite && settings.output.rewrite_buffers,
            diff: cli.diff || settings.output.diff,
            build_path: cli.build_path.clone().or(settings.compile.build_path),
            driver: DriverOptions {
                require_at_least_one_field: cli.require_field
                    || settings.matcher.require_at_least_one_field,
                extra_args: settings.compile.extra_args,
            },
        }
    }
}

#[derive(Serialize)]
struct JsonOutput {
    edits: Vec<EditRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    buffers: Vec<JsonBuffer>,
}

#[derive(Serialize)]
struct JsonBuffer {
    file: String,
    text: String,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }
    init_tracing(cli.verbose);

    let cwd = env::current_dir().context("cannot determine working directory")?;
    let settings = match &cli.config {
        Some(path) => load_from_path(path)?,
        None => load_default(&cwd)?.unwrap_or_default(),
    };
    let resolved = Resolved::new(&cli, settings);

    let sources = collect_sources(&cli.sources)?;
    if sources.is_empty() {
        anyhow::bail!("no C/C++ sources found in the given paths");
    }

    let database = resolve_database(&cli, &resolved, &cwd, &sources)?;
    let report = Driver::new(database, resolved.driver.clone()).run(&sources);

    // a failed translation unit suppresses all output
    if !report.is_success() {
        eprintln!(
            "{}",
            format!("{} file(s) failed; no edits were emitted", report.failed()).red()
        );
        return Ok(exit_code(&report));
    }

    print_report(&report, &resolved)?;

    if cli.in_place {
        for result in report.edits.save_all()? {
            eprintln!(
                "{} {} ({} edits, {:+} bytes)",
                "✓".green(),
                result.file.display(),
                result.edits_applied,
                result.byte_delta
            );
        }
    }

    Ok(exit_code(&report))
}

fn exit_code(report: &RunReport) -> ExitCode {
    ExitCode::from(report.exit_code() as u8)
}

/// Expand directories into the C/C++ sources they contain, sorted per
/// directory. Files are taken as given.
fn collect_sources(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if !input.is_dir() {
            files.push(input.clone());
            continue;
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(input) {
            let entry = entry?;
            if entry.file_type().is_file() && is_source_file(entry.path()) {
                found.push(entry.into_path());
            }
        }
        found.sort();
        files.extend(found);
    }
    Ok(files)
}

fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

/// Pick the compile commands: explicit flags, then `-p`/settings, then a
/// `compile_commands.json` next to the first source, then no flags at all.
fn resolve_database(
    cli: &Cli,
    resolved: &Resolved,
    cwd: &Path,
    sources: &[PathBuf],
) -> Result<CompilationDatabase> {
    if !cli.compiler_args.is_empty() {
        return Ok(CompilationDatabase::fixed(cwd, cli.compiler_args.clone()));
    }

    if let Some(path) = &resolved.build_path {
        return Ok(CompilationDatabase::load(path)?);
    }

    let start = sources
        .first()
        .and_then(|first| std::path::absolute(first).ok())
        .and_then(|first| first.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| cwd.to_path_buf());
    if let Some(found) = CompilationDatabase::auto_detect(&start) {
        tracing::info!(database = %found.display(), "using compilation database");
        return Ok(CompilationDatabase::load(&found)?);
    }

    tracing::warn!("no compilation database found; running without compile flags");
    Ok(CompilationDatabase::fixed(cwd, Vec::new()))
}

fn print_report(report: &RunReport, resolved: &Resolved) -> Result<()> {
    let buffers = if resolved.rewrite {
        report.rewritten_buffers()?
    } else {
        Vec::new()
    };

    match resolved.format {
        OutputFormat::Json => {
            let output = JsonOutput {
                edits: report.edits.records(),
                buffers: buffers
                    .into_iter()
                    .map(|buffer| JsonBuffer {
                        file: buffer.file.display().to_string(),
                        text: buffer.text().into_owned(),
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Edits collected by the tool:");
            print!("{}", report.edits.serialize());

            for buffer in buffers {
                if resolved.diff {
                    let original = report.original(&buffer.file).unwrap_or_default();
                    let original = String::from_utf8_lossy(original);
                    display_diff(&buffer.file, &original, &buffer.text());
                } else {
                    println!("Rewrite buffer for file: {}", buffer.file.display());
                    println!("{}", buffer.text().yellow());
                }
            }
        }
    }
    Ok(())
}

/// Show unified diff between original and annotated content
fn display_diff(file: &Path, original: &str, modified: &str) {
    println!(
        "\n{}",
        format!("--- {} (original)", file.display()).dimmed()
    );
    println!("{}", format!("+++ {} (annotated)", file.display()).dimmed());

    let diff = TextDiff::from_lines(original, modified);

    for change in diff.iter_all_changes() {
        let line = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", line);
    }
}
