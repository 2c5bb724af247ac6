mod common;

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

use common::{commit_file, git, init_repo_with_commit};
use drover::git::{
    branch_exists, clone_repo, default_branch, fetch_origin, git_version, is_git_repo,
    remote_branch_exists, worktree_add, worktree_list, worktree_prune, worktree_remove,
};

// --- Test helpers ---

/// Current branch of a repository, so fixtures work under any
/// `init.defaultBranch` setting.
fn current_branch(dir: &Path) -> String {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .output()
        .expect("Failed to run git rev-parse");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// An origin repository and a clone of it, side by side in one temp dir.
fn origin_and_clone(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
    let origin = dir.path().join("origin");
    let clone = dir.path().join("clone");
    init_repo_with_commit(&origin);
    clone_repo(origin.to_str().unwrap(), &clone).expect("Clone should succeed");
    (origin, clone)
}

// --- Basics ---

#[test]
fn version_reports_installed_git() {
    let version = git_version().expect("git should be installed");
    assert!(
        version.contains("git version"),
        "Expected a version string, got: {}",
        version
    );
}

#[test]
fn repo_detection() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let repo = dir.path().join("repo");
    init_repo_with_commit(&repo);
    assert!(is_git_repo(&repo).is_ok());

    let plain = dir.path().join("plain");
    std::fs::create_dir_all(&plain).expect("Failed to create dir");
    let err = is_git_repo(&plain).expect_err("Plain dir should not be a repo");
    assert!(
        err.contains("not a git repository"),
        "Expected a clear message, got: {}",
        err
    );
}

#[test]
fn clone_checks_out_origin_content() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (_origin, clone) = origin_and_clone(&dir);

    assert!(clone.join("README.md").exists());
    assert!(is_git_repo(&clone).is_ok());
}

#[test]
fn default_branch_follows_origin_head() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (origin, clone) = origin_and_clone(&dir);

    let branch = default_branch(&clone).expect("Default branch should resolve");
    assert_eq!(
        branch,
        current_branch(&origin),
        "Expected the clone to report the origin's branch"
    );
}

// --- Branch queries ---

#[test]
fn local_branch_detection() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let repo = dir.path().join("repo");
    init_repo_with_commit(&repo);

    assert!(!branch_exists(&repo, "feature-x").expect("Query should succeed"));
    git(&repo, &["branch", "feature-x"]);
    assert!(branch_exists(&repo, "feature-x").expect("Query should succeed"));
}

#[test]
fn remote_branch_detection_is_live() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (origin, clone) = origin_and_clone(&dir);

    assert!(!remote_branch_exists(&clone, "feature-x").expect("Query should succeed"));

    // ls-remote asks the origin directly; no fetch required.
    git(&origin, &["branch", "feature-x"]);
    assert!(remote_branch_exists(&clone, "feature-x").expect("Query should succeed"));
}

// --- Worktrees ---

#[test]
fn worktree_add_list_remove_cycle() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let repo = dir.path().join("repo");
    init_repo_with_commit(&repo);
    let wt = dir.path().join("wt-issue-1");

    // No start point checks out an existing branch.
    git(&repo, &["branch", "issue-1"]);
    worktree_add(&repo, &wt, "issue-1", None).expect("Worktree add should succeed");
    assert!(wt.join("README.md").exists());

    let listed = worktree_list(&repo).expect("Worktree list should succeed");
    assert!(
        listed.iter().any(|w| w.branch.as_deref() == Some("issue-1")),
        "Expected the worktree listed, got: {:?}",
        listed
    );

    worktree_remove(&repo, &wt).expect("Worktree remove should succeed");
    assert!(!wt.exists(), "Expected the worktree directory gone");
    worktree_prune(&repo).expect("Prune should succeed");

    let listed = worktree_list(&repo).expect("Worktree list should succeed");
    assert!(
        !listed.iter().any(|w| w.branch.as_deref() == Some("issue-1")),
        "Expected the worktree gone from the list, got: {:?}",
        listed
    );
}

#[test]
fn worktree_from_remote_start_point_after_fetch() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (origin, clone) = origin_and_clone(&dir);

    // Branch created in the origin after the clone: only visible in the
    // clone once fetched.
    let base = current_branch(&origin);
    git(&origin, &["checkout", "-b", "feature-x"]);
    commit_file(&origin, "FEATURE.md", "feature\n", "Add feature marker");
    git(&origin, &["checkout", &base]);

    fetch_origin(&clone).expect("Fetch should succeed");

    let wt = dir.path().join("wt-from-feature");
    worktree_add(&clone, &wt, "from-feature", Some("origin/feature-x"))
        .expect("Worktree add should succeed");
    assert!(
        wt.join("FEATURE.md").exists(),
        "Expected content from the start point branch"
    );
}

#[test]
fn worktree_remove_tolerates_missing_path() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let repo = dir.path().join("repo");
    init_repo_with_commit(&repo);

    let never_added = dir.path().join("no-such-worktree");
    worktree_remove(&repo, &never_added).expect("Removing a missing worktree should be a no-op");
}
