//! VRE-RUNNER — launcher for the VRE risk engine
//!
//! Entry point. Loads `.env` and configuration, initialises structured
//! logging, and dispatches to one of the subcommands. The process exit
//! code mirrors the engine's on a failed run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

use vre_runner::config::{AppConfig, EnvSnapshot};
use vre_runner::engine::RunOrchestrator;
use vre_runner::types::{
    ComputeDevice, EngineCommand, ExecutableLocation, RunOutcome, RunRequest, RunnerError,
};

#[derive(Parser)]
#[command(
    name = "vre-runner",
    version,
    about = "Locate, configure and launch the VRE risk engine"
)]
struct Cli {
    /// Runner configuration file
    #[arg(long, global = true, default_value = "vre-runner.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine on a configuration file
    Run {
        /// Primary engine configuration (e.g. Input/ore.xml)
        #[arg(value_name = "CONFIG")]
        input: PathBuf,
        /// Additional configuration files to patch alongside the primary
        #[arg(long = "aux", value_name = "FILE")]
        auxiliary: Vec<PathBuf>,
        /// Detect a compute device and patch it into the configuration
        #[arg(long)]
        accelerator: bool,
        /// Locate, detect, patch and restore without starting the engine
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the resolved executable and how it was found
    Locate,
    /// Print the detected compute device tag
    Detect,
    /// Summarise executable, library path and device detection
    Check {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    init_logging();

    let cfg = AppConfig::load_or_default(&cli.config)?;
    let env = EnvSnapshot::capture();
    let working_dir = std::env::current_dir().context("Failed to read working directory")?;
    let mut orchestrator = RunOrchestrator::new(cfg, env, working_dir);

    match cli.command {
        Command::Run {
            input,
            auxiliary,
            accelerator,
            dry_run,
        } => {
            let mut request = RunRequest::new(input)
                .with_accelerator(accelerator)
                .with_dry_run(dry_run);
            for path in auxiliary {
                request = request.with_auxiliary(path);
            }
            run(&mut orchestrator, &request).await
        }
        Command::Locate => {
            let location = orchestrator.locate()?;
            println!("{}\t{}", location.path().display(), location.source());
            Ok(ExitCode::SUCCESS)
        }
        Command::Detect => {
            let device = orchestrator.detect().await?;
            println!("{device}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { json } => check(&mut orchestrator, json).await,
    }
}

async fn run(orchestrator: &mut RunOrchestrator, request: &RunRequest) -> Result<ExitCode> {
    match orchestrator.run(request).await {
        Ok(RunOutcome::Completed(result)) => {
            info!(
                elapsed_ms = result.elapsed_ms,
                invoked = result.invoked,
                started_at = %result.started_at,
                "Done"
            );
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::Skipped { reason }) => {
            warn!(reason = %reason, "Run skipped");
            Ok(ExitCode::SUCCESS)
        }
        Err(RunnerError::RunFailure { code }) => Ok(ExitCode::from(exit_status_byte(code))),
        Err(e) => Err(e.into()),
    }
}

/// Engine exit codes outside 1..=255 (including -1 for signals) are
/// clamped so a failed run never exits 0.
fn exit_status_byte(code: i32) -> u8 {
    u8::try_from(code.clamp(1, 255)).unwrap_or(1)
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
struct CheckReport {
    program: Option<PathBuf>,
    executable: Option<ExecutableLocation>,
    library_var: Option<String>,
    library_paths: Vec<PathBuf>,
    device: Option<ComputeDevice>,
    problems: Vec<String>,
}

async fn check(orchestrator: &mut RunOrchestrator, json: bool) -> Result<ExitCode> {
    let mut report = CheckReport::default();

    match orchestrator.resolve_command() {
        Ok((command, environment)) => {
            report.program = Some(command.program().to_path_buf());
            if let EngineCommand::Native(location) = command {
                report.executable = Some(location);
            }
            if let Some(environment) = environment {
                report.library_var = Some(environment.var);
                report.library_paths = environment.search_paths;
            }
        }
        Err(e) => report.problems.push(e.to_string()),
    }

    match orchestrator.detect().await {
        Ok(device) => report.device = Some(device),
        Err(e) => report.problems.push(e.to_string()),
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.program.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &CheckReport) {
    match (&report.program, &report.executable) {
        (Some(_), Some(location)) => println!(
            "executable:   {} ({})",
            location.path().display(),
            location.source()
        ),
        (Some(program), None) => println!("executable:   {} (python wrapper)", program.display()),
        _ => println!("executable:   not found"),
    }
    if let Some(var) = &report.library_var {
        println!("{var}:");
        for path in &report.library_paths {
            println!("  {}", path.display());
        }
    }
    match &report.device {
        Some(device) => println!("device:       {device}"),
        None => println!("device:       none"),
    }
    for problem in &report.problems {
        println!("problem:      {problem}");
    }
}

/// Initialise the tracing subscriber with env-filter support.
///
/// Set `RUST_LOG=vre_runner=debug` for verbose output, or
/// `VRE_RUNNER_LOG_JSON=1` for JSON-formatted logs.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vre_runner=info"));

    let json_logging = std::env::var("VRE_RUNNER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
