//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use system_load_generator::core::config::Config;
use system_load_generator::core::errors::SlgError;
use system_load_generator::core::units::{ByteUnit, format_bytes};
use system_load_generator::engine::aggregate::LoadAggregator;
use system_load_generator::engine::executor::{ExecutionOutcome, Executor};
use system_load_generator::engine::signals::SignalHandler;
use system_load_generator::load::description;
use system_load_generator::load::sequencer::{Segment, segment_count, sequence_with_limits};
use system_load_generator::load::spec::LoadSpec;
use system_load_generator::logger::activity::{ActivityLoggerHandle, spawn_logger};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// System load generator: produce controlled CPU, memory and disk load.
#[derive(Debug, Parser)]
#[command(
    name = "slg",
    author,
    version,
    about = "System load generator - reproducible CPU, memory and disk pressure",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Do not write the activity log.
    #[arg(long, global = true)]
    no_log: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Generate load from a description file or inline flags.
    Run(RunArgs),
    /// Validate a description file and show its schedule.
    Check(CheckArgs),
    /// Print the effective configuration.
    Config,
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct RunArgs {
    /// TOML or JSON load description.
    #[arg(value_name = "FILE", conflicts_with_all = ["cpu", "memory", "disk_input", "disk_output"])]
    file: Option<PathBuf>,
    /// CPU percentage of the whole machine (0-100).
    #[arg(long)]
    cpu: Option<u32>,
    /// Memory to hold, e.g. `512MiB`.
    #[arg(long, value_name = "SIZE")]
    memory: Option<String>,
    /// Disk read rate, e.g. `20MB/s`.
    #[arg(long, value_name = "RATE")]
    disk_input: Option<String>,
    /// Disk write rate, e.g. `20MB/s`.
    #[arg(long, value_name = "RATE")]
    disk_output: Option<String>,
    /// How long the inline load lasts, e.g. `30s`.
    #[arg(long, value_name = "DURATION", default_value = "10s")]
    duration: String,
    /// How many times to run the inline load.
    #[arg(long, default_value_t = 1)]
    repeat: u32,
    /// Walk the schedule against an empty ledger without producing load.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Args)]
struct CheckArgs {
    /// TOML or JSON load description.
    #[arg(value_name = "FILE")]
    file: PathBuf,
    /// Number of leading segments to list.
    #[arg(long, default_value_t = 10)]
    show: usize,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// The load could not be admitted.
    #[error("{0}")]
    Rejected(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Rejected(_) => 4,
        }
    }
}

impl From<SlgError> for CliError {
    fn from(err: SlgError) -> Self {
        match err {
            SlgError::Validation { .. }
            | SlgError::CyclicComposition { .. }
            | SlgError::DepthExceeded { .. }
            | SlgError::TooManySegments { .. }
            | SlgError::DescriptionParse { .. }
            | SlgError::InvalidConfig { .. }
            | SlgError::MissingConfig { .. }
            | SlgError::ConfigParse { .. } => Self::User(err.to_string()),
            SlgError::Admission { .. } => Self::Rejected(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_load(cli, args),
        Command::Check(args) => run_check(cli, args),
        Command::Config => run_config(cli),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── run ────────────────────

fn inline_spec(args: &RunArgs) -> Result<LoadSpec, CliError> {
    let (amount, unit) = description::parse_duration(&args.duration)?;
    let mut spec = LoadSpec::new().lasting(amount, unit)?.repeat(args.repeat);
    if let Some(cpu) = args.cpu {
        spec = spec.with_cpu(cpu)?;
    }
    if let Some(raw) = &args.memory {
        spec = spec.with_memory(description::parse_bytes("memory", raw)?, ByteUnit::Bytes)?;
    }
    if let Some(raw) = &args.disk_input {
        spec = spec.with_disk_input(description::parse_bytes("disk_input", raw)?, ByteUnit::Bytes)?;
    }
    if let Some(raw) = &args.disk_output {
        spec =
            spec.with_disk_output(description::parse_bytes("disk_output", raw)?, ByteUnit::Bytes)?;
    }
    Ok(spec)
}

fn load_spec(config: &Config, args: &RunArgs) -> Result<LoadSpec, CliError> {
    match &args.file {
        Some(path) => Ok(description::from_path(path, config.executor.max_depth)?),
        None => {
            if args.cpu.is_none()
                && args.memory.is_none()
                && args.disk_input.is_none()
                && args.disk_output.is_none()
            {
                return Err(CliError::User(
                    "give a description FILE or at least one of --cpu, --memory, --disk-input, --disk-output"
                        .to_string(),
                ));
            }
            inline_spec(args)
        }
    }
}

fn run_load(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let spec = load_spec(&config, args)?;
    if args.dry_run {
        return run_dry(cli, &config, &spec);
    }

    let (logger, logger_join) = if cli.no_log {
        (ActivityLoggerHandle::disabled(), None)
    } else {
        spawn_logger(&config.logging)?
    };
    let result = run_live(cli, &config, &spec, logger.clone());
    logger.shutdown();
    if let Some(join) = logger_join {
        let _ = join.join();
    }
    result
}

fn run_live(
    cli: &Cli,
    config: &Config,
    spec: &LoadSpec,
    logger: ActivityLoggerHandle,
) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let signals = SignalHandler::new();
    let executor = Executor::start(config, logger)?;
    let handle = executor.execute_async(spec)?;
    let started = Instant::now();
    let mut last_status = Instant::now();
    let mut cancelled = false;

    while !handle.is_finished() {
        thread::sleep(POLL_INTERVAL);
        if signals.should_stop() && !cancelled {
            cancelled = true;
            if mode == OutputMode::Human {
                eprintln!("slg: stopping, releasing load...");
            }
            handle.cancel();
        }
        if mode == OutputMode::Human && last_status.elapsed() >= Duration::from_secs(1) {
            last_status = Instant::now();
            print_status_line(&executor, handle.state(), started.elapsed());
        }
    }
    let outcome = handle.wait();
    let snapshot = executor.controller_snapshot();
    executor.shutdown();
    if mode == OutputMode::Human {
        println!();
    }
    let outcome = outcome?;

    match mode {
        OutputMode::Human => {
            let elapsed = started.elapsed().as_secs_f64();
            match outcome {
                ExecutionOutcome::Completed { segments } => println!(
                    "{} {segments} segments in {elapsed:.1}s",
                    "completed".green().bold()
                ),
                ExecutionOutcome::Cancelled { segments_completed } => println!(
                    "{} after {segments_completed} segments ({elapsed:.1}s)",
                    "cancelled".yellow().bold()
                ),
            }
            if let Some(snapshot) = snapshot
                && snapshot.restarts > 0
            {
                println!("  simulator restarts: {}", snapshot.restarts);
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "run",
                "result": outcome,
                "elapsed_ms": u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "controller": snapshot,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_status_line(
    executor: &Executor,
    state: system_load_generator::engine::executor::ExecutionState,
    elapsed: Duration,
) {
    let target = executor.aggregate();
    let mut line = format!(
        "\r[{:>6.1}s] cpu {:>3}%  mem {:>10}  read {:>10}/s  write {:>10}/s",
        elapsed.as_secs_f64(),
        target.cpu,
        format_bytes(target.memory_bytes),
        format_bytes(target.disk_input_bps),
        format_bytes(target.disk_output_bps),
    );
    if let Some(snapshot) = executor.controller_snapshot() {
        let busy: u32 = snapshot.setpoints.iter().sum();
        let workers = u32::try_from(snapshot.setpoints.len().max(1)).unwrap_or(u32::MAX);
        line.push_str(&format!(
            "  workers avg {:>3}%  {:?}",
            busy / workers,
            snapshot.convergence
        ));
        if let Some(rss) = snapshot.process_rss_bytes {
            line.push_str(&format!("  rss {:>10}", format_bytes(rss)));
        }
    }
    line.push_str(&format!("  {state:?}"));
    print!("{line}");
    let _ = io::stdout().flush();
}

/// Walk the schedule against a detached ledger, without holding or loading.
fn run_dry(cli: &Cli, config: &Config, spec: &LoadSpec) -> Result<(), CliError> {
    let segments = sequence_with_limits(spec, config.executor.max_segments, config.executor.max_depth)?;
    let ledger = LoadAggregator::detached();
    let mut count = 0u64;
    let mut total = Duration::ZERO;
    for segment in segments {
        let load = segment.load();
        ledger.increase_by(&load)?;
        ledger.decrease_by(&load)?;
        total = total.saturating_add(segment.hold_duration());
        count += 1;
    }
    match output_mode(cli) {
        OutputMode::Human => println!(
            "{} {count} segments, {:.1}s total, admission ok",
            "dry run:".cyan().bold(),
            total.as_secs_f64()
        ),
        OutputMode::Json => write_json_line(&json!({
            "command": "run",
            "dry_run": true,
            "segments": count,
            "total_ms": u64::try_from(total.as_millis()).unwrap_or(u64::MAX),
        }))?,
    }
    Ok(())
}

// ──────────────────── check ────────────────────

fn run_check(cli: &Cli, args: &CheckArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let spec = description::from_path(&args.file, config.executor.max_depth)?;
    let segments = sequence_with_limits(&spec, config.executor.max_segments, config.executor.max_depth)?;
    let count = segment_count(&spec).unwrap_or(u64::MAX);
    let mut preview: Vec<Segment> = Vec::new();
    let mut total = Duration::ZERO;
    for segment in segments {
        total = total.saturating_add(segment.hold_duration());
        if preview.len() < args.show {
            preview.push(segment);
        }
    }

    match output_mode(cli) {
        OutputMode::Human => {
            println!("{} {}", "valid".green().bold(), args.file.display());
            println!("  nodes:    {}", spec.node_count());
            println!("  depth:    {}", spec.depth());
            println!("  segments: {count}");
            println!("  duration: {:.1}s", total.as_secs_f64());
            for (index, segment) in preview.iter().enumerate() {
                println!(
                    "  #{index:<4} {:>8}{:<2} cpu {:>3}%  mem {:>10}  read {:>10}/s  write {:>10}/s",
                    segment.duration,
                    segment.time_unit.suffix(),
                    segment.cpu,
                    format_bytes(segment.memory_bytes),
                    format_bytes(segment.disk_input_bps),
                    format_bytes(segment.disk_output_bps),
                );
            }
            if count > preview.len() as u64 {
                println!("  ... {} more", count - preview.len() as u64);
            }
        }
        OutputMode::Json => {
            let listed: Vec<Value> = preview
                .iter()
                .map(|segment| {
                    json!({
                        "duration_ms": u64::try_from(segment.hold_duration().as_millis()).unwrap_or(u64::MAX),
                        "load": segment.load(),
                    })
                })
                .collect();
            write_json_line(&json!({
                "command": "check",
                "path": args.file.to_string_lossy(),
                "valid": true,
                "nodes": spec.node_count(),
                "depth": spec.depth(),
                "segments": count,
                "total_ms": u64::try_from(total.as_millis()).unwrap_or(u64::MAX),
                "preview": listed,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    match output_mode(cli) {
        OutputMode::Human => print!("{}", config.to_toml()?),
        OutputMode::Json => write_json_line(&json!({
            "command": "config",
            "config_hash": config.stable_hash()?,
            "config": config,
        }))?,
    }
    Ok(())
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("SLG_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
