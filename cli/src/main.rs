//! Ingest - Command-line interface for the mapping and transfer engine.
//!
//! Three subcommands cover the pipeline:
//! - `plan` scans a directory and writes the proposals as JSON for review
//! - `run` executes a (possibly edited) plan as a copy or move batch
//! - `status` shows batches recorded in a progress state directory

mod logging;

use clap::{Parser, Subcommand};
use ingest_engine::{
    Batch, BatchReport, BatchStatus, DirectoryScanner, EngineConfig, FileOutcome, FileResult,
    MappingConfig, MappingEvent, MappingGenerator, MappingProgress, MappingStatus, OperationKind, OverwritePolicy,
    PatternSet, Profile, ProgressCallback, ProgressState, ProgressStore, Proposal, ProposalStatus,
    Scanner, TransferEngine,
};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

/// Ingest - sort production assets into a project structure
#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(version = "0.1.0")]
#[command(about = "Map scanned production assets to project folders and transfer them")]
struct Cli {
    /// Enable verbose output (debug logging, one line per file)
    #[arg(long, global = true)]
    verbose: bool,

    /// JSON settings file with optional "engine" and "mapping" sections
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a directory and write transfer proposals
    Plan(PlanArgs),
    /// Execute a plan
    Run(RunArgs),
    /// Show recorded batch progress
    Status(StatusArgs),
}

#[derive(clap::Args, Debug)]
struct PlanArgs {
    /// Directory to scan
    #[arg(long, value_name = "PATH")]
    src: PathBuf,

    /// Project root that destinations are resolved under
    #[arg(long, value_name = "PATH")]
    dst: PathBuf,

    /// Folder-rule profile (JSON)
    #[arg(long, value_name = "FILE")]
    profile: PathBuf,

    /// Tag pattern set (JSON)
    #[arg(long, value_name = "FILE")]
    patterns: PathBuf,

    /// Where to write the proposals; stdout if omitted
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// Mapping worker threads
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Proposals written by `plan`
    #[arg(long, value_name = "FILE")]
    plan: PathBuf,

    /// Operation mode: copy or move
    #[arg(long, value_name = "MODE", default_value = "copy")]
    mode: String,

    /// Overwrite policy: skip, overwrite, or smart; config file value if omitted
    #[arg(long, value_name = "POLICY")]
    overwrite: Option<String>,

    /// Also transfer proposals with status "manual"
    #[arg(long)]
    include_manual: bool,

    /// Directory for durable progress snapshots
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// File worker threads
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct StatusArgs {
    /// Progress state directory used by `run`
    #[arg(long, value_name = "DIR")]
    state_dir: PathBuf,

    /// Show a single batch in detail
    #[arg(long, value_name = "ID")]
    batch: Option<String>,
}

/// Settings file contents.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    engine: EngineConfig,
    mapping: MappingConfig,
}

/// How a successful invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliOutcome {
    /// Everything requested was done
    Success,
    /// The batch finished with errors or was cancelled
    Incomplete,
}

/// CLI implementation of ProgressCallback for displaying transfer progress
struct CliProgress {
    verbose: bool,
    start_time: Instant,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

fn progress_bar(percent: f64) -> String {
    let percent = percent.clamp(0.0, 100.0) as usize;
    let filled = percent / 5;
    format!("[{}{}] {:3}%", "=".repeat(filled), " ".repeat(20 - filled), percent)
}

impl ProgressCallback for CliProgress {
    fn on_batch_started(&self, state: &ProgressState) {
        eprintln!("Starting batch {}", state.batch_id);
        eprintln!(
            "  Total: {} across {} files",
            format_bytes(state.total_bytes),
            state.total_files
        );
        eprintln!();
    }

    fn on_progress(&self, state: &ProgressState) {
        let eta = state
            .eta_seconds
            .map(|secs| format_duration(Duration::from_secs_f64(secs)))
            .unwrap_or_else(|| "--".to_string());
        eprint!(
            "\rProgress: {} | {}/{} files | {} | ETA {}   ",
            progress_bar(state.percent()),
            state.files_processed,
            state.total_files,
            format_bytes(state.processed_bytes),
            eta
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_file_completed(&self, _state: &ProgressState, result: &FileResult) {
        if !self.verbose {
            return;
        }
        let name = result
            .source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("(unknown)");
        match &result.outcome {
            FileOutcome::Succeeded { bytes } => eprintln!("  Done: {} ({})", name, format_bytes(*bytes)),
            FileOutcome::Skipped => eprintln!("  Skipped: {}", name),
            FileOutcome::Cancelled => eprintln!("  Cancelled: {}", name),
            FileOutcome::Failed { message } => eprintln!("  Failed: {}: {}", name, message),
        }
    }

    fn on_batch_completed(&self, state: &ProgressState) {
        eprintln!();
        eprintln!("Batch {}", state.status);
        eprintln!(
            "Summary: {} done, {} skipped, {} failed, {} cancelled",
            state.succeeded, state.skipped, state.failed, state.cancelled
        );
        eprintln!("Bytes transferred: {}", format_bytes(state.processed_bytes));
        eprintln!("Elapsed: {}", format_duration(self.start_time.elapsed()));
    }
}

/// Parse arguments, run the command, and map the result to an exit code
fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    // 0 = success, 1 = batch incomplete, 2 = usage or setup error
    let exit_code = match run_cli(&cli) {
        Ok(CliOutcome::Success) => 0,
        Ok(CliOutcome::Incomplete) => 1,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(cli: &Cli) -> Result<CliOutcome, String> {
    let settings = load_settings(cli.config.as_deref())?;
    match &cli.command {
        Command::Plan(args) => run_plan(args, settings.mapping, cli.verbose),
        Command::Run(args) => run_batch(args, settings.engine, cli.verbose),
        Command::Status(args) => run_status(args),
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings, String> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let json = fs::read_to_string(path)
        .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
    serde_json::from_str(&json).map_err(|e| format!("Invalid config {}: {}", path.display(), e))
}

fn read_file(path: &Path, what: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Cannot read {} {}: {}", what, path.display(), e))
}

fn parse_mode(mode: &str) -> Result<OperationKind, String> {
    match mode.to_lowercase().as_str() {
        "copy" => Ok(OperationKind::Copy),
        "move" => Ok(OperationKind::Move),
        _ => Err(format!("Invalid mode '{}'. Must be 'copy' or 'move'", mode)),
    }
}

fn parse_policy(policy: &str) -> Result<OverwritePolicy, String> {
    match policy.to_lowercase().as_str() {
        "skip" => Ok(OverwritePolicy::Skip),
        "overwrite" => Ok(OverwritePolicy::Overwrite),
        "smart" | "smart-update" => Ok(OverwritePolicy::SmartUpdate),
        _ => Err(format!(
            "Invalid overwrite policy '{}'. Must be 'skip', 'overwrite', or 'smart'",
            policy
        )),
    }
}

fn run_plan(args: &PlanArgs, mut config: MappingConfig, verbose: bool) -> Result<CliOutcome, String> {
    if !args.src.is_dir() {
        return Err(format!("Source is not a directory: {}", args.src.display()));
    }
    let patterns = PatternSet::from_json(&read_file(&args.patterns, "patterns")?)
        .map_err(|e| e.to_string())?;
    let profile = Profile::from_json(&read_file(&args.profile, "profile")?)
        .map_err(|e| e.to_string())?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let tree = DirectoryScanner::new()
        .scan(&args.src)
        .map_err(|e| format!("Scan failed: {}", e))?;
    let generator = MappingGenerator::new(&patterns, profile, &args.dst, config)
        .map_err(|e| e.to_string())?;

    let report_progress = |event: &MappingEvent| match event.status {
        MappingStatus::Error => {
            eprintln!("  Error: {}", event.message.as_deref().unwrap_or("unknown"));
        }
        MappingStatus::Running if verbose => {
            eprintln!("  Mapped {}/{}", event.processed, event.total);
        }
        _ => {}
    };
    let sink: &dyn MappingProgress = &report_progress;
    let proposals = generator.generate(&tree, Some(sink));

    let json = serde_json::to_string_pretty(&proposals)
        .map_err(|e| format!("Cannot serialize proposals: {}", e))?;
    match &args.out {
        Some(out) => fs::write(out, json)
            .map_err(|e| format!("Cannot write plan {}: {}", out.display(), e))?,
        None => println!("{}", json),
    }

    print_plan_summary(&proposals);
    Ok(CliOutcome::Success)
}

fn print_plan_summary(proposals: &[Proposal]) {
    let count = |status: ProposalStatus| proposals.iter().filter(|p| p.status == status).count();
    eprintln!(
        "Planned {} proposals: {} auto, {} manual, {} ambiguous, {} error",
        proposals.len(),
        count(ProposalStatus::Auto),
        count(ProposalStatus::Manual),
        count(ProposalStatus::Ambiguous),
        count(ProposalStatus::Error)
    );
    for proposal in proposals {
        match proposal.status {
            ProposalStatus::Ambiguous => {
                let options: Vec<String> = proposal
                    .ambiguous_options
                    .iter()
                    .map(|o| format!("{} -> {}", o.keyword, o.path))
                    .collect();
                eprintln!("  ambiguous: {} [{}]", proposal.name, options.join(", "));
            }
            ProposalStatus::Error => eprintln!(
                "  error: {}: {}",
                proposal.name,
                proposal.error_message.as_deref().unwrap_or("unknown")
            ),
            _ => {}
        }
        for warning in &proposal.warnings {
            eprintln!("  warning: {}: {}", proposal.name, warning);
        }
    }
}

fn run_batch(args: &RunArgs, mut config: EngineConfig, verbose: bool) -> Result<CliOutcome, String> {
    let operation = parse_mode(&args.mode)?;
    if let Some(policy) = &args.overwrite {
        config.overwrite = parse_policy(policy)?;
    }
    if let Some(workers) = args.workers {
        config.file_workers = workers;
    }

    let proposals: Vec<Proposal> = serde_json::from_str(&read_file(&args.plan, "plan")?)
        .map_err(|e| format!("Invalid plan {}: {}", args.plan.display(), e))?;
    let planned = proposals.len();
    let accepted: Vec<Proposal> = proposals
        .into_iter()
        .filter(|p| match p.status {
            ProposalStatus::Auto => true,
            ProposalStatus::Manual => args.include_manual,
            _ => false,
        })
        .collect();
    if accepted.len() < planned {
        eprintln!(
            "Leaving {} of {} proposals for review",
            planned - accepted.len(),
            planned
        );
    }
    if accepted.is_empty() {
        eprintln!("Nothing to transfer");
        return Ok(CliOutcome::Success);
    }

    let mut engine = TransferEngine::new(config)
        .map_err(|e| e.to_string())?
        .with_callback(Arc::new(CliProgress::new(verbose)));
    if let Some(dir) = &args.state_dir {
        let store = ProgressStore::open(dir).map_err(|e| e.to_string())?;
        engine = engine.with_store(store);
    }

    let batch = Batch::new(accepted, operation);
    info!(batch = %batch.id, operation = %operation, "submitting batch");
    let batch_id = engine.submit(batch).map_err(|e| e.to_string())?;
    let report = engine.wait(batch_id).map_err(|e| e.to_string())?;
    print_failures(&report);

    if report.status == BatchStatus::Completed {
        Ok(CliOutcome::Success)
    } else {
        Ok(CliOutcome::Incomplete)
    }
}

fn print_failures(report: &BatchReport) {
    let failed: Vec<_> = report.items.iter().filter(|i| i.files_failed > 0).collect();
    if failed.is_empty() {
        return;
    }
    eprintln!();
    eprintln!("Failed items:");
    for item in failed {
        for error in &item.errors {
            eprintln!("  {}: {}: {}", item.name, error.source.display(), error.message);
        }
    }
}

fn run_status(args: &StatusArgs) -> Result<CliOutcome, String> {
    if !args.state_dir.is_dir() {
        return Err(format!("No state directory at {}", args.state_dir.display()));
    }
    let store = ProgressStore::open(&args.state_dir).map_err(|e| e.to_string())?;

    if let Some(batch) = &args.batch {
        let batch_id = Uuid::parse_str(batch).map_err(|e| format!("Invalid batch id '{}': {}", batch, e))?;
        let state = store
            .load(batch_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Unknown batch: {}", batch_id))?;
        print_state(&state);
        for error in &state.errors {
            println!("  {}: {}", error.source.display(), error.message);
        }
        return Ok(CliOutcome::Success);
    }

    let states = store.list().map_err(|e| e.to_string())?;
    if states.is_empty() {
        println!("No batches recorded");
    }
    for state in &states {
        print_state(state);
    }
    Ok(CliOutcome::Success)
}

fn print_state(state: &ProgressState) {
    println!(
        "{}  {:<22} {} {}/{} files ({} failed)  updated {}",
        state.batch_id,
        state.status.to_string(),
        progress_bar(state.percent()),
        state.files_processed,
        state.total_files,
        state.failed,
        state
            .updated_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
    );
}
