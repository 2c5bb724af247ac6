use std::path::{Path, PathBuf};
use std::process::Command;

/// One entry from `git worktree list --porcelain` output.
#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name (`issue-41`), stripped of `refs/heads/`.
    /// `None` for detached or bare entries.
    pub branch: Option<String>,
}

/// Verify git is installed and return its version line.
pub fn git_version() -> Result<String, String> {
    let output = Command::new("git")
        .arg("--version")
        .output()
        .map_err(|e| format!("git is not installed or not on PATH: {}", e))?;
    if !output.status.success() {
        return Err("git --version failed".to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Verify only that a git repository exists in the given directory.
pub fn is_git_repo(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["rev-parse", "--git-dir"], Some(repo_dir))
        .map_err(|_| format!("{} is not a git repository", repo_dir.display()))?;
    Ok(())
}

/// Clone `url` into `dest`. The parent directory must already exist.
pub fn clone_repo(url: &str, dest: &Path) -> Result<(), String> {
    let dest_str = dest
        .to_str()
        .ok_or_else(|| format!("Clone destination contains invalid UTF-8: {:?}", dest))?;
    run_git_command(&["clone", url, dest_str], None)?;
    Ok(())
}

/// Fetch origin with pruning so deleted remote branches disappear locally.
pub fn fetch_origin(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["fetch", "--prune", "origin"], Some(repo_dir))?;
    Ok(())
}

/// Resolve the repository's default branch from `origin/HEAD`.
///
/// Freshly cloned repos have the symref; if it is missing (e.g., the remote
/// head moved), one `remote set-head --auto` round-trip restores it.
pub fn default_branch(repo_dir: &Path) -> Result<String, String> {
    let symref = run_git_command(
        &["symbolic-ref", "--quiet", "refs/remotes/origin/HEAD"],
        Some(repo_dir),
    );

    let raw = match symref {
        Ok(raw) => raw,
        Err(_) => {
            run_git_command(&["remote", "set-head", "origin", "--auto"], Some(repo_dir))?;
            run_git_command(
                &["symbolic-ref", "--quiet", "refs/remotes/origin/HEAD"],
                Some(repo_dir),
            )?
        }
    };

    raw.trim()
        .strip_prefix("refs/remotes/origin/")
        .map(|s| s.to_string())
        .ok_or_else(|| format!("Unexpected origin/HEAD symref: '{}'", raw.trim()))
}

/// Whether a local branch exists.
///
/// Uses `git rev-parse --verify --quiet`:
/// - Exit 0 → true
/// - Exit 1 → false
/// - Anything else → Err
pub fn branch_exists(repo_dir: &Path, branch: &str) -> Result<bool, String> {
    let mut cmd = Command::new("git");
    cmd.args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)]);
    cmd.current_dir(repo_dir);

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git rev-parse: {}", e))?;

    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        code => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "git rev-parse exited with {:?}: {}",
                code,
                stderr.trim()
            ))
        }
    }
}

/// Whether `name` exists as a branch on origin.
pub fn remote_branch_exists(repo_dir: &Path, name: &str) -> Result<bool, String> {
    let refspec = format!("refs/heads/{}", name);
    let output = run_git_command(&["ls-remote", "--heads", "origin", &refspec], Some(repo_dir))?;
    Ok(!output.trim().is_empty())
}

/// Add a worktree at `path` for `branch`.
///
/// When `start_point` is given the branch is created from it; otherwise the
/// existing branch is checked out into the new worktree.
pub fn worktree_add(
    repo_dir: &Path,
    path: &Path,
    branch: &str,
    start_point: Option<&str>,
) -> Result<(), String> {
    let path_str = path
        .to_str()
        .ok_or_else(|| format!("Worktree path contains invalid UTF-8: {:?}", path))?;

    match start_point {
        Some(start) => {
            run_git_command(&["worktree", "add", "-b", branch, path_str, start], Some(repo_dir))?;
        }
        None => {
            run_git_command(&["worktree", "add", path_str, branch], Some(repo_dir))?;
        }
    }
    Ok(())
}

/// List this repository's worktrees as git itself records them.
pub fn worktree_list(repo_dir: &Path) -> Result<Vec<WorktreeInfo>, String> {
    let output = run_git_command(&["worktree", "list", "--porcelain"], Some(repo_dir))?;
    Ok(parse_worktree_list(&output))
}

/// Remove the worktree at `path`. Already-gone worktrees are not an error,
/// so cleanup can be retried safely.
pub fn worktree_remove(repo_dir: &Path, path: &Path) -> Result<(), String> {
    let path_str = path
        .to_str()
        .ok_or_else(|| format!("Worktree path contains invalid UTF-8: {:?}", path))?;

    match run_git_command(&["worktree", "remove", "--force", path_str], Some(repo_dir)) {
        Ok(_) => Ok(()),
        Err(e) if e.contains("is not a working tree") || e.contains("No such file") => Ok(()),
        Err(e) => Err(e),
    }
}

/// Drop registry entries for worktrees whose directories no longer exist.
pub fn worktree_prune(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["worktree", "prune"], Some(repo_dir))?;
    Ok(())
}

/// Parse `git worktree list --porcelain` output.
///
/// Entries are attribute lines (`worktree <path>`, `HEAD <sha>`,
/// `branch <ref>`, `detached`, `bare`) separated by blank lines. The first
/// entry is the main working tree itself.
fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let Some(info) = current.take() {
                entries.push(info);
            }
            continue;
        }

        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                entries.push(info);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: None,
                branch: None,
            });
        } else if let Some(info) = current.as_mut() {
            if let Some(sha) = line.strip_prefix("HEAD ") {
                info.head = Some(sha.to_string());
            } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                info.branch = Some(
                    branch_ref
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch_ref)
                        .to_string(),
                );
            }
            // "detached" and "bare" lines leave branch as None.
        }
    }

    if let Some(info) = current.take() {
        entries.push(info);
    }

    entries
}

/// Run a git command and return its stdout as a string.
fn run_git_command(args: &[&str], repo_dir: Option<&Path>) -> Result<String, String> {
    let mut cmd = Command::new("git");
    cmd.args(args);

    if let Some(dir) = repo_dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        ));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("git output is not valid UTF-8: {}", e))
}
