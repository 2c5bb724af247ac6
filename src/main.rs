use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use drover::alert;
use drover::config;
use drover::lock;
use drover::log::parse_log_level;
use drover::preflight;
use drover::runner::{
    install_signal_handlers, is_shutdown_requested, kill_all_children, CliWorkflowRunner,
};
use drover::scheduler;
use drover::tracker::GhTicketClient;
use drover::{log_error, log_info};

#[derive(Parser)]
#[command(name = "drover", about = "Unattended workflow daemon for issue-tracker boards")]
struct Cli {
    /// Daemon root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/drover.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a starter config and state directory
    Init,
    /// Run preflight checks and exit
    Check,
    /// Run the polling daemon
    Run {
        /// Run a single tick, wait out dispatched workflows, then exit
        #[arg(long)]
        once: bool,
        /// Stop after N ticks
        #[arg(long, conflicts_with = "once")]
        max_ticks: Option<u64>,
    },
    /// Report daemon lock state and config summary
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => drover::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = &cli.root;

    let result = match cli.command {
        Commands::Init => handle_init(root),
        Commands::Check => handle_check(root, cli.config.as_deref()),
        Commands::Run { once, max_ticks } => {
            handle_run(root, cli.config.as_deref(), once, max_ticks).await
        }
        Commands::Status => handle_status(root, cli.config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_init(root: &Path) -> Result<(), String> {
    let dirs = [".drover", "workspaces"];
    for dir in &dirs {
        let dir_path = root.join(dir);
        fs::create_dir_all(&dir_path)
            .map_err(|e| format!("Failed to create {}: {}", dir_path.display(), e))?;
    }

    let config_path = root.join("drover.toml");
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        fs::write(&config_path, config::starter_config_toml())
            .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;
        println!("Created {}", config_path.display());
    }

    println!("Initialized drover in {}", root.display());
    println!("  Created: .drover/, workspaces/");
    println!("Edit drover.toml to add your boards, then run `drover check`.");

    Ok(())
}

fn handle_check(root: &Path, config_path: Option<&Path>) -> Result<(), String> {
    let config = config::load_config(root, config_path)?;

    log_info!("Running preflight checks...");
    if let Err(errors) = preflight::run_preflight(&config, root) {
        log_error!("Preflight FAILED:");
        for error in &errors {
            log_error!("  {}", error);
        }
        return Err(format!(
            "{} preflight error(s) — fix all issues before running",
            errors.len()
        ));
    }
    log_info!("Preflight passed.");

    Ok(())
}

async fn handle_run(
    root: &Path,
    config_path: Option<&Path>,
    once: bool,
    max_ticks: Option<u64>,
) -> Result<(), String> {
    // Install signal handlers for graceful shutdown
    install_signal_handlers()?;

    log_info!("--- Drover ---");
    log_info!("");

    let config = config::load_config(root, config_path)?;

    log_info!("[pre] Acquiring lock...");
    let state_dir = config.state_dir(root);
    let _lock = lock::try_acquire(&state_dir)?;

    // Construct runner from config and verify the agent CLI
    let runner = CliWorkflowRunner::new(&config.runner, state_dir.clone());
    log_info!("[pre] Verifying agent CLI...");
    runner.verify_cli_available()?;

    log_info!("[pre] Running preflight checks...");
    if let Err(errors) = preflight::run_preflight(&config, root) {
        log_error!("[pre] Preflight FAILED:");
        for error in &errors {
            log_error!("  {}", error);
        }
        return Err(format!(
            "{} preflight error(s) — fix all issues before running",
            errors.len()
        ));
    }
    log_info!("[pre] Preflight passed.");

    // Config summary
    log_info!("");
    log_info!("[config] Boards: {}", config.daemon.boards.join(", "));
    log_info!(
        "[config] Poll: every {}s, max {} concurrent workflow(s), timeout {}min",
        config.daemon.poll_interval_secs,
        config.daemon.max_concurrent_workflows,
        config.runner.workflow_timeout_minutes,
    );
    log_info!(
        "[config] Stages: {} → {} → {} → {} (baseline '{}', done '{}')",
        config.statuses.research,
        config.statuses.plan,
        config.statuses.implement,
        config.statuses.validate,
        config.statuses.baseline,
        config.statuses.done,
    );
    match config.daemon.self_identity {
        Some(ref identity) => log_info!("[config] Identity: {}", identity),
        None => log_info!("[config] Identity: none (external tickets allowed)"),
    }

    let client = GhTicketClient::from_version(&config.tracker.api_version)?;
    let alerter = alert::build_alerter(&config.alerting);
    let runner = Arc::new(runner);

    // Set up cancellation for graceful shutdown
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Spawn shutdown monitor that watches for signal and cancels
    tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                cancel_clone.cancel();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });

    let params = scheduler::RunParams {
        workspace_root: config.workspace_root(root),
        state_dir,
        max_ticks: if once { Some(1) } else { max_ticks },
    };

    log_info!("");
    let summary = scheduler::run_scheduler(&client, runner, &alerter, config, params, cancel).await?;

    // Kill any remaining child processes
    kill_all_children();

    // Print summary
    log_info!("\n--- Run Summary ---");
    log_info!("Ticks: {}", summary.ticks);
    log_info!("Workflows dispatched: {}", summary.workflows_dispatched);
    if !summary.workflows_completed.is_empty() {
        log_info!(
            "Workflows completed: {}",
            summary.workflows_completed.join(", ")
        );
    }
    if !summary.workflows_failed.is_empty() {
        log_info!("Workflows failed: {}", summary.workflows_failed.join(", "));
    }
    log_info!("Halt reason: {:?}", summary.halt_reason);

    Ok(())
}

fn handle_status(root: &Path, config_path: Option<&Path>) -> Result<(), String> {
    let config = config::load_config(root, config_path)?;
    let state_dir = config.state_dir(root);

    match lock::holder_pid(&state_dir) {
        Some(pid) => println!("Daemon running (pid {})", pid),
        None => println!("Daemon not running"),
    }

    println!();
    println!("Boards:");
    for board in &config.daemon.boards {
        println!("  {}", board);
    }
    println!(
        "Poll interval: {}s; max concurrent workflows: {}",
        config.daemon.poll_interval_secs, config.daemon.max_concurrent_workflows
    );
    println!(
        "Stages: {} → {} → {} → {}",
        config.statuses.research,
        config.statuses.plan,
        config.statuses.implement,
        config.statuses.validate
    );
    println!("Workspace root: {}", config.workspace_root(root).display());
    println!(
        "Identity: {}",
        config.daemon.self_identity.as_deref().unwrap_or("(none)")
    );

    Ok(())
}
