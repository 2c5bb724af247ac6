mod common;

use std::fs;

use tempfile::TempDir;

use common::test_config;
use drover::config::DroverConfig;
use drover::preflight::{run_preflight, PreflightError};

// --- Test helpers ---

fn conditions(errors: &[PreflightError]) -> Vec<String> {
    errors.iter().map(|e| e.condition.clone()).collect()
}

/// Preflight config whose tool probes cannot fail: the agent CLI probe runs
/// `true --version`, which always succeeds.
fn probe_safe_config() -> DroverConfig {
    let mut config = test_config();
    config.runner.cli_path = "true".to_string();
    config
}

// --- Phase 1: structure ---

#[test]
fn structural_errors_name_location_and_fix() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config();
    config.daemon.poll_interval_secs = 0;

    let errors = run_preflight(&config, dir.path()).expect_err("Expected preflight to fail");

    let poll = errors
        .iter()
        .find(|e| e.condition == "poll_interval_secs must be >= 1")
        .unwrap_or_else(|| panic!("Expected the interval error, got: {:?}", errors));
    assert_eq!(poll.config_location, "drover.toml → daemon.poll_interval_secs");
    assert!(!poll.suggested_fix.is_empty());

    let display = poll.to_string();
    assert!(display.contains("Preflight error:"), "got: {}", display);
    assert!(display.contains("Config:"), "got: {}", display);
    assert!(display.contains("Fix:"), "got: {}", display);
}

#[test]
fn default_config_flags_boards_and_identity() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = DroverConfig::default();

    let errors = run_preflight(&config, dir.path()).expect_err("Expected preflight to fail");
    let conditions = conditions(&errors);

    assert!(
        conditions.contains(&"No project boards configured".to_string()),
        "got: {:?}",
        conditions
    );
    assert!(
        conditions
            .contains(&"self_identity is not set and external tickets are not allowed".to_string()),
        "got: {:?}",
        conditions
    );
}

#[test]
fn bad_board_url_points_at_boards_entry() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config();
    // A repository URL, not a project board URL.
    config.daemon.boards = vec!["https://github.com/acme/widgets".to_string()];

    let errors = run_preflight(&config, dir.path()).expect_err("Expected preflight to fail");

    let board = errors
        .iter()
        .find(|e| e.config_location == "drover.toml → daemon.boards")
        .unwrap_or_else(|| panic!("Expected a boards error, got: {:?}", errors));
    assert_eq!(
        board.suggested_fix,
        "Use the form https://host/orgs/OWNER/projects/N"
    );
}

#[test]
fn duplicate_column_names_flagged() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config();
    config.statuses.plan = "Research".to_string();

    let errors = run_preflight(&config, dir.path()).expect_err("Expected preflight to fail");

    assert!(
        conditions(&errors).contains(&"Status column name \"Research\" is used twice".to_string()),
        "got: {:?}",
        errors
    );
}

// --- Phase 2: tool probes ---

#[test]
fn structural_errors_suppress_tool_probes() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config();
    config.daemon.poll_interval_secs = 0;
    config.runner.cli_path = "drover-test-no-such-binary".to_string();

    let errors = run_preflight(&config, dir.path()).expect_err("Expected preflight to fail");
    let conditions = conditions(&errors);

    assert!(conditions.contains(&"poll_interval_secs must be >= 1".to_string()));
    // The CLI probe must not run while the config itself is broken.
    assert!(
        !conditions.iter().any(|c| c.contains("Agent CLI")),
        "Expected tool probes skipped, got: {:?}",
        conditions
    );
}

#[test]
fn missing_agent_cli_probed_when_structure_clean() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config();
    config.runner.cli_path = "drover-test-no-such-binary".to_string();

    let errors = run_preflight(&config, dir.path()).expect_err("Expected preflight to fail");

    assert!(
        conditions(&errors)
            .contains(&"Agent CLI 'drover-test-no-such-binary' is not runnable".to_string()),
        "got: {:?}",
        errors
    );
}

#[test]
fn runnable_agent_cli_passes_probe() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = probe_safe_config();

    // `gh` may legitimately be absent here, so only the CLI probe outcome
    // is asserted.
    if let Err(errors) = run_preflight(&config, dir.path()) {
        assert!(
            !conditions(&errors).iter().any(|c| c.contains("Agent CLI")),
            "Expected the CLI probe to pass, got: {:?}",
            errors
        );
    }
}

// --- Phase 3: workspace root ---

#[test]
fn workspace_probe_runs_despite_structural_errors() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "a file, not a directory").expect("Failed to write blocker");

    let mut config = test_config();
    config.daemon.poll_interval_secs = 0;
    config.daemon.workspace_root = blocker
        .join("workspaces")
        .to_str()
        .expect("Path should be UTF-8")
        .to_string();

    let errors = run_preflight(&config, dir.path()).expect_err("Expected preflight to fail");
    let conditions = conditions(&errors);

    assert!(conditions.contains(&"poll_interval_secs must be >= 1".to_string()));
    assert!(
        conditions.iter().any(|c| c.contains("cannot be created")),
        "Expected the workspace probe to run anyway, got: {:?}",
        conditions
    );
}

#[test]
fn write_probe_leaves_no_residue() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = probe_safe_config();

    // Outcome depends on the environment's gh; the probe file must be gone
    // either way.
    let _ = run_preflight(&config, dir.path());

    let workspace_root = dir.path().join("workspaces");
    assert!(
        workspace_root.is_dir(),
        "Expected the workspace root created by the probe"
    );
    assert!(
        !workspace_root.join(".drover-write-probe").exists(),
        "Expected the write probe cleaned up"
    );
}
