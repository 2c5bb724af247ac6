use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;

use crate::config::{parse_board_url, DroverConfig};

/// A single preflight validation error with actionable context.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightError {
    /// What condition failed.
    pub condition: String,
    /// Where in the config the error originates.
    pub config_location: String,
    /// How to fix it.
    pub suggested_fix: String,
}

impl std::fmt::Display for PreflightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Preflight error: {}\n  Config: {}\n  Fix: {}",
            self.condition, self.config_location, self.suggested_fix
        )
    }
}

/// Run all preflight checks before the scheduler starts.
///
/// Phases:
/// 1. Structural validation — config correctness (fast, no I/O)
/// 2. Tool probes — git, the agent CLI, and an authenticated `gh` (skipped
///    when Phase 1 finds structural errors, since the probes read config values)
/// 3. Workspace root probe — the workspace root must be creatable and writable
///
/// Returns `Ok(())` if all checks pass, or `Err(Vec<PreflightError>)` with all errors.
pub fn run_preflight(config: &DroverConfig, root: &Path) -> Result<(), Vec<PreflightError>> {
    let mut errors = Vec::new();

    // Phase 1: Structural validation (reuses config::validate's rules but with richer errors)
    errors.extend(validate_structure(config));

    // Phase 2: Tool probes
    if errors.is_empty() {
        errors.extend(probe_tools(config));
    }

    // Phase 3: Workspace root probe
    errors.extend(probe_workspace_root(&config.workspace_root(root)));

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// --- Phase 1: Structural validation ---

/// Validate config structure with actionable error messages.
///
/// This is richer than `config::validate()` — each error includes the config
/// location and a suggested fix.
fn validate_structure(config: &DroverConfig) -> Vec<PreflightError> {
    let mut errors = Vec::new();

    if config.daemon.poll_interval_secs < 1 {
        errors.push(PreflightError {
            condition: "poll_interval_secs must be >= 1".to_string(),
            config_location: "drover.toml → daemon.poll_interval_secs".to_string(),
            suggested_fix: "Set poll_interval_secs to at least 1".to_string(),
        });
    }

    if config.daemon.max_concurrent_workflows < 1 {
        errors.push(PreflightError {
            condition: "max_concurrent_workflows must be >= 1".to_string(),
            config_location: "drover.toml → daemon.max_concurrent_workflows".to_string(),
            suggested_fix: "Set max_concurrent_workflows to at least 1".to_string(),
        });
    }

    if config.daemon.boards.is_empty() {
        errors.push(PreflightError {
            condition: "No project boards configured".to_string(),
            config_location: "drover.toml → daemon.boards".to_string(),
            suggested_fix:
                "Add at least one board URL, e.g. \"https://github.com/orgs/acme/projects/4\""
                    .to_string(),
        });
    }

    for board in &config.daemon.boards {
        if let Err(e) = parse_board_url(board) {
            errors.push(PreflightError {
                condition: e,
                config_location: "drover.toml → daemon.boards".to_string(),
                suggested_fix: "Use the form https://host/orgs/OWNER/projects/N".to_string(),
            });
        }
    }

    if config.daemon.self_identity.is_none() && !config.daemon.allow_external_tickets {
        errors.push(PreflightError {
            condition: "self_identity is not set and external tickets are not allowed"
                .to_string(),
            config_location: "drover.toml → daemon.self_identity".to_string(),
            suggested_fix:
                "Set self_identity to the account the daemon acts as, or set allow_external_tickets = true"
                    .to_string(),
        });
    }

    if config.runner.workflow_timeout_minutes < 1 {
        errors.push(PreflightError {
            condition: "workflow_timeout_minutes must be >= 1".to_string(),
            config_location: "drover.toml → runner.workflow_timeout_minutes".to_string(),
            suggested_fix: "Set workflow_timeout_minutes to at least 1".to_string(),
        });
    }

    if config.runner.cli_path.trim().is_empty() {
        errors.push(PreflightError {
            condition: "cli_path is empty".to_string(),
            config_location: "drover.toml → runner.cli_path".to_string(),
            suggested_fix: "Point cli_path at the agent CLI binary (default \"claude\")"
                .to_string(),
        });
    }

    let statuses = &config.statuses;
    let columns = [
        ("statuses.research", &statuses.research),
        ("statuses.plan", &statuses.plan),
        ("statuses.implement", &statuses.implement),
        ("statuses.validate", &statuses.validate),
        ("statuses.baseline", &statuses.baseline),
        ("statuses.done", &statuses.done),
    ];
    for (i, (location, name)) in columns.iter().enumerate() {
        if name.trim().is_empty() {
            errors.push(PreflightError {
                condition: "Status column name is empty".to_string(),
                config_location: format!("drover.toml → {}", location),
                suggested_fix: "Give every workflow column a non-empty name".to_string(),
            });
            continue;
        }
        for (other_location, other) in columns.iter().skip(i + 1) {
            if name == other {
                errors.push(PreflightError {
                    condition: format!("Status column name \"{}\" is used twice", name),
                    config_location: format!("drover.toml → {} + {}", location, other_location),
                    suggested_fix: "Give every workflow column a distinct name".to_string(),
                });
            }
        }
    }

    if config.alerting.routing_key.is_some() {
        if let Some(endpoint) = &config.alerting.endpoint {
            if !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
                errors.push(PreflightError {
                    condition: format!("Alert endpoint '{}' is not an http(s) URL", endpoint),
                    config_location: "drover.toml → alerting.endpoint".to_string(),
                    suggested_fix:
                        "Use an http(s) URL, or remove endpoint to use the default events API"
                            .to_string(),
                });
            }
        }
    }

    errors
}

// --- Phase 2: Tool probes ---

/// Verify the external tools the daemon drives are present and usable.
///
/// Checks `git --version`, `{cli_path} --version`, `gh --version`, and
/// `gh auth status` for each distinct board hostname.
fn probe_tools(config: &DroverConfig) -> Vec<PreflightError> {
    let mut errors = Vec::new();

    if !command_succeeds("git", &["--version"]) {
        errors.push(PreflightError {
            condition: "git is not available".to_string(),
            config_location: "environment → PATH".to_string(),
            suggested_fix: "Install git and ensure it is on PATH".to_string(),
        });
    }

    let cli = config.runner.cli_path.trim();
    if !command_succeeds(cli, &["--version"]) {
        errors.push(PreflightError {
            condition: format!("Agent CLI '{}' is not runnable", cli),
            config_location: "drover.toml → runner.cli_path".to_string(),
            suggested_fix: format!(
                "Install the agent CLI, or point cli_path at the binary (`{} --version` must succeed)",
                cli
            ),
        });
    }

    if !command_succeeds("gh", &["--version"]) {
        errors.push(PreflightError {
            condition: "gh is not available".to_string(),
            config_location: "environment → PATH".to_string(),
            suggested_fix: "Install the GitHub CLI (https://cli.github.com)".to_string(),
        });
        return errors;
    }

    for host in board_hostnames(config) {
        if !command_succeeds("gh", &["auth", "status", "--hostname", &host]) {
            errors.push(PreflightError {
                condition: format!("gh is not authenticated for {}", host),
                config_location: "drover.toml → daemon.boards".to_string(),
                suggested_fix: format!("Run `gh auth login --hostname {}`", host),
            });
        }
    }

    errors
}

/// Distinct hostnames across configured boards, sorted for stable output.
fn board_hostnames(config: &DroverConfig) -> Vec<String> {
    let mut hosts = BTreeSet::new();
    for board in &config.daemon.boards {
        if let Ok(board_ref) = parse_board_url(board) {
            hosts.insert(board_ref.hostname);
        }
    }
    hosts.into_iter().collect()
}

fn command_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

// --- Phase 3: Workspace root probe ---

/// The workspace root must exist (or be creatable) and accept writes, since
/// every dispatched workflow checks out a worktree under it.
fn probe_workspace_root(workspace_root: &Path) -> Vec<PreflightError> {
    if let Err(e) = std::fs::create_dir_all(workspace_root) {
        return vec![PreflightError {
            condition: format!(
                "Workspace root {} cannot be created: {}",
                workspace_root.display(),
                e
            ),
            config_location: "drover.toml → daemon.workspace_root".to_string(),
            suggested_fix: "Point workspace_root at a writable directory".to_string(),
        }];
    }

    let probe = workspace_root.join(".drover-write-probe");
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Vec::new()
        }
        Err(e) => vec![PreflightError {
            condition: format!(
                "Workspace root {} is not writable: {}",
                workspace_root.display(),
                e
            ),
            config_location: "drover.toml → daemon.workspace_root".to_string(),
            suggested_fix: "Fix permissions on workspace_root or choose another directory"
                .to_string(),
        }],
    }
}
