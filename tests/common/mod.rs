#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use tempfile::TempDir;

use drover::alert::Alerter;
use drover::config::DroverConfig;
use drover::types::{parse_repo_ref, BoardMetadata, ItemState, RepoRef, StatusOption, TicketItem};

/// Repository every test item lives in unless a test overrides it.
pub const TEST_REPO: &str = "github.com/acme/api";

/// Board URL used by the default test config.
pub const TEST_BOARD: &str = "https://github.com/orgs/acme/projects/7";

/// Creates a `TicketItem` with minimal defaults.
///
/// The item is open, on `TEST_BOARD`, in `TEST_REPO`, with no labels. The
/// item id is auto-generated as `"PVTI_{ticket_id}"` and the title as
/// `"Test issue {ticket_id}"`.
///
/// # Parameters
/// - `ticket_id`: The tracker-local issue number
/// - `status`: The board column name (e.g. `"Research"`)
pub fn make_item(ticket_id: u64, status: &str) -> TicketItem {
    TicketItem {
        item_id: format!("PVTI_{}", ticket_id),
        board_url: TEST_BOARD.to_string(),
        ticket_id,
        repo: TEST_REPO.to_string(),
        status: status.to_string(),
        title: format!("Test issue {}", ticket_id),
        state: ItemState::Open,
        ..Default::default()
    }
}

/// Creates a `TicketItem` carrying the given labels.
pub fn make_labeled_item(ticket_id: u64, status: &str, labels: &[&str]) -> TicketItem {
    let mut item = make_item(ticket_id, status);
    item.labels = labels.iter().map(|l| l.to_string()).collect();
    item
}

/// Board metadata with the six default columns, each with a synthetic
/// option id.
pub fn make_board_metadata() -> BoardMetadata {
    let columns = ["Todo", "Research", "Plan", "Implement", "Validate", "Done"];
    BoardMetadata {
        project_id: "PVT_project1".to_string(),
        status_field_id: "PVTSSF_status".to_string(),
        status_options: columns
            .iter()
            .enumerate()
            .map(|(i, name)| StatusOption {
                name: name.to_string(),
                id: format!("opt{}", i),
            })
            .collect(),
    }
}

/// Creates a `DroverConfig` suitable for scheduler tests.
///
/// Watches `TEST_BOARD`, allows external tickets (so no actor lookups run),
/// permits four concurrent workflows, and polls every second. Multi-tick
/// tests run under tokio's paused clock, so the interval elapses instantly.
pub fn test_config() -> DroverConfig {
    let mut config = DroverConfig::default();
    config.daemon.boards = vec![TEST_BOARD.to_string()];
    config.daemon.self_identity = Some("drover-bot".to_string());
    config.daemon.allow_external_tickets = true;
    config.daemon.max_concurrent_workflows = 4;
    config.daemon.poll_interval_secs = 1;
    config
}

/// The `RepoRef` form of `TEST_REPO`.
pub fn test_repo_ref() -> RepoRef {
    parse_repo_ref(TEST_REPO).expect("TEST_REPO should parse")
}

// --- Git fixtures ---

/// Run a git command in `dir`, panicking with context if it cannot start.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run git {:?}: {}", args, e));
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Initialize a git repository with user config and one commit at `dir`.
pub fn init_repo_with_commit(dir: &Path) {
    fs::create_dir_all(dir).expect("Failed to create repo dir");
    git(dir, &["init"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);
    fs::write(dir.join("README.md"), "# Test\n").expect("Failed to write README");
    git(dir, &["add", "README.md"]);
    git(dir, &["commit", "-m", "Initial commit"]);
}

/// Commit a file with the given content on the repo's current branch.
pub fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
    fs::write(dir.join(name), content).expect("Failed to write file");
    git(dir, &["add", name]);
    git(dir, &["commit", "-m", message]);
}

/// A workspace root with a shared checkout cloned from a local origin, so
/// fetch and worktree operations run without network access.
pub struct WorkspaceFixture {
    /// Owns the whole tree; dropped last.
    pub dir: TempDir,
    pub origin: PathBuf,
    pub workspace_root: PathBuf,
}

/// Build the on-disk layout `ensure_workspace` expects for `repo`:
/// an origin repository with one commit, and a shared checkout at
/// `{workspace_root}/{identifier}` cloned from it.
pub fn setup_workspace_env(repo: &RepoRef) -> WorkspaceFixture {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let origin = dir.path().join("origin");
    let workspace_root = dir.path().join("workspaces");

    init_repo_with_commit(&origin);
    fs::create_dir_all(&workspace_root).expect("Failed to create workspace root");

    let shared = workspace_root.join(repo.identifier());
    let output = Command::new("git")
        .args(["clone", origin.to_str().unwrap(), shared.to_str().unwrap()])
        .output()
        .expect("Failed to run git clone");
    assert!(
        output.status.success(),
        "git clone failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    WorkspaceFixture {
        dir,
        origin,
        workspace_root,
    }
}

// --- Recording alerter ---

/// Alerter that records trigger and resolve calls for assertions.
#[derive(Default)]
pub struct RecordingAlerter {
    events: Mutex<Vec<String>>,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Alerter for RecordingAlerter {
    async fn trigger(
        &self,
        _routing_key: &str,
        dedup_key: &str,
        summary: &str,
        _reason: &str,
        _details: &str,
    ) -> Result<(), String> {
        self.events
            .lock()
            .unwrap()
            .push(format!("trigger:{}:{}", dedup_key, summary));
        Ok(())
    }

    async fn resolve(&self, _routing_key: &str, dedup_key: &str) -> Result<(), String> {
        self.events
            .lock()
            .unwrap()
            .push(format!("resolve:{}", dedup_key));
        Ok(())
    }
}
