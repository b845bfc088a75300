//! stackvault - Main entry point
//!
//! Backup and restore for compose-managed container fleets.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stackvault::{
    config::Config,
    daemon::interrupt::InterruptHandler,
    executor::Executor,
    runtime::{DockerCompose, DockerRuntime},
    transfer::progress::format_bytes,
    utils::{self, timestamp::BackupTimestamp},
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stop, archive and restart every service directory
    Backup,

    /// Restore projects to a point in time
    Restore {
        /// Target timestamp (YYYYMMDD_HHMMSS, UTC); latest when omitted
        #[arg(long)]
        at: Option<BackupTimestamp>,

        /// Restrict to these projects
        #[arg(long = "project")]
        projects: Vec<String>,
    },

    /// Quiesce one project directory
    Stop { directory: PathBuf },

    /// List backup sets
    List {
        #[arg(long = "project")]
        projects: Vec<String>,
    },

    /// Resolve and verify chains without restoring
    Verify {
        #[arg(long)]
        at: Option<BackupTimestamp>,

        #[arg(long = "project")]
        projects: Vec<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Command::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let log_file = utils::logger::init(log_level, config.log.dir.as_deref())?;

    tracing::info!("Starting stackvault v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &log_file {
        tracing::info!("Run log: {}", path.display());
    }

    let interrupt = InterruptHandler::new();
    let _signals = interrupt.spawn();

    let runtime = Arc::new(DockerRuntime::connect()?);
    let executor = Executor::new(config, runtime, Arc::new(DockerCompose::new()), interrupt.token());

    match args.command {
        Command::Backup => {
            executor.check_tools().await?;
            let summary = executor.backup_run().await?;
            println!("Backup: {}", summary);
            Ok(ExitCode::SUCCESS)
        }
        Command::Restore { at, projects } => {
            executor.check_tools().await?;
            let summary = executor.restore_run(at, &projects).await?;
            println!("Restore: {}", summary);
            for (name, reason) in &summary.failures {
                println!("  {}: {}", name, reason);
            }
            Ok(if summary.failed > 0 || summary.interrupted {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Stop { directory } => {
            executor.check_tools().await?;
            let report = executor.stop_run(&directory).await?;
            for (name, step) in &report.stopped {
                println!("  stopped {} ({:?})", name, step);
            }
            for (name, reason) in &report.failed {
                println!("  failed  {}: {}", name, reason);
            }
            if report.is_quiesced() {
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Project not quiesced; still running: {:?}", report.still_running);
                Ok(ExitCode::FAILURE)
            }
        }
        Command::List { projects } => {
            for listing in executor.list(&projects)? {
                println!("{}", listing.project);
                for (set, size) in &listing.sets {
                    println!("  {:<12} {}  {:>12}", set.kind.to_string(), set.timestamp, format_bytes(*size));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify { at, projects } => {
            for (project, chain) in executor.verify_run(at, &projects).await? {
                println!(
                    "{}: {} member(s), {} .. {}",
                    project,
                    chain.len(),
                    chain.root().timestamp,
                    chain.tip().timestamp
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => Ok(ExitCode::SUCCESS),
    }
}
