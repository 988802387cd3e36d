//! # vmharness-cli
//!
//! Binary entry point for the vmharness orchestrator.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Configuration loading and tracing initialization
//! - A headless run mode driving one task end to end
//! - `prepare` and `snapshots` maintenance subcommands

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use vmharness_adapters::VmrunClient;
use vmharness_core::{
    HarnessConfig, Orchestrator, RetryPolicy, RunHandle, SnapshotStateMachine,
};
use vmharness_proto::{ControlPlane, RunPhase, StatusPublisher, Task};

/// vmharness - VM lifecycle and task execution orchestrator
#[derive(Parser, Debug)]
#[command(name = "vmharness", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "vmharness.yml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one task end to end: prepare, execute actions, evaluate
    Run(RunArgs),

    /// Revert the VM to a snapshot and power it on
    Prepare(PrepareArgs),

    /// List the VM's snapshots
    Snapshots,

    /// List task descriptors in the configured tasks directory
    Tasks,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the task descriptor JSON file
    task: PathBuf,

    /// Evaluate immediately after setup instead of waiting for the operator
    #[arg(long)]
    no_wait: bool,
}

#[derive(Parser, Debug)]
struct PrepareArgs {
    /// Snapshot to revert to (defaults to the configured snapshot)
    #[arg(long)]
    snapshot: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = HarnessConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load config from {:?}", cli.config))?;

    match cli.command {
        Commands::Run(args) => run_command(config, args).await,
        Commands::Prepare(args) => prepare_command(config, args).await,
        Commands::Snapshots => snapshots_command(config).await,
        Commands::Tasks => tasks_command(&config),
    }
}

async fn run_command(config: HarnessConfig, args: RunArgs) -> Result<()> {
    let task = Task::from_file(&args.task)
        .with_context(|| format!("failed to load task from {:?}", args.task))?;
    println!("Task {}: {}", task.id, task.instruction);

    let output_dir = config.output_dir.clone();
    let control: Arc<dyn ControlPlane> = Arc::new(VmrunClient::from_config(&config));
    let orchestrator = Orchestrator::new(control, config);
    orchestrator.add_observer(|event| {
        println!("  {}", event.detail);
    });

    let handle = orchestrator
        .start_task(task)
        .context("failed to start task run")?;

    drive_run(&handle, args.no_wait).await?;

    let snapshot = handle.wait().await;
    match snapshot.phase {
        RunPhase::Completed => {
            match &snapshot.verdict {
                Some(verdict) if verdict.passed => println!("Verdict: PASSED"),
                Some(verdict) => {
                    println!("Verdict: FAILED");
                    println!("Details: {}", verdict.details);
                }
                None => println!("Completed without a verdict (task has no evaluator)"),
            }
            println!(
                "Artifacts: {}",
                output_dir.join(snapshot.id.as_str()).display()
            );
            Ok(())
        }
        RunPhase::Cancelled => bail!("run was cancelled"),
        _ => bail!(
            "run failed: {}",
            snapshot.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Feeds operator decisions into the run from the terminal.
async fn drive_run(handle: &RunHandle, no_wait: bool) -> Result<()> {
    loop {
        let phase = handle.session().phase;
        match phase {
            RunPhase::AwaitingDecision => {
                match prompt("Action failed - [r]etry, [s]kip, or [a]bort? ").await? {
                    Some(ref answer) if answer.eq_ignore_ascii_case("r") => {
                        handle.request_retry().await.ok();
                    }
                    Some(ref answer) if answer.eq_ignore_ascii_case("s") => {
                        handle.request_skip().await.ok();
                    }
                    _ => {
                        handle.cancel();
                        return Ok(());
                    }
                }
                wait_while(handle, RunPhase::AwaitingDecision).await;
            }
            RunPhase::WaitingForOperator => {
                if !no_wait {
                    prompt("Perform the task in the VM, then press Enter to evaluate... ")
                        .await?;
                }
                handle.request_evaluate().await.ok();
                return Ok(());
            }
            phase if phase.is_terminal() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}

/// Prints `message` and reads one trimmed line from stdin.
/// `None` means stdin was closed.
async fn prompt(message: &str) -> Result<Option<String>> {
    print!("{message}");
    std::io::stdout().flush().ok();
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(line.trim().to_string())),
            Err(err) => Err(err.into()),
        }
    })
    .await
    .context("stdin reader task failed")?
}

async fn wait_while(handle: &RunHandle, phase: RunPhase) {
    while handle.session().phase == phase && !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn prepare_command(config: HarnessConfig, args: PrepareArgs) -> Result<()> {
    let snapshot = args
        .snapshot
        .unwrap_or_else(|| config.snapshot_name.clone());
    let control: Arc<dyn ControlPlane> = Arc::new(VmrunClient::from_config(&config));

    let machine = SnapshotStateMachine::new(
        control,
        RetryPolicy::from_config(&config.retry),
        config.timeouts.clone(),
        StatusPublisher::detached(),
    );
    machine
        .prepare(&snapshot, config.start_fullscreen)
        .await
        .context("VM preparation failed")?;

    println!("VM is ready on snapshot '{snapshot}'");
    Ok(())
}

async fn snapshots_command(config: HarnessConfig) -> Result<()> {
    let control = VmrunClient::from_config(&config);
    let snapshots = control
        .list_snapshots()
        .await
        .context("failed to list snapshots")?;

    if snapshots.is_empty() {
        println!("No snapshots found for {}", config.vmx_path);
    } else {
        for name in snapshots {
            println!("{name}");
        }
    }
    Ok(())
}

fn tasks_command(config: &HarnessConfig) -> Result<()> {
    let entries = std::fs::read_dir(&config.tasks_dir)
        .with_context(|| format!("cannot read tasks directory {:?}", config.tasks_dir))?;

    let mut count = 0;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        match Task::from_file(&path) {
            Ok(task) => {
                println!("{}\t{}", task.id, task.instruction);
                count += 1;
            }
            Err(err) => warn!(path = %path.display(), %err, "skipping unparseable task file"),
        }
    }
    println!("{count} task(s)");
    Ok(())
}
