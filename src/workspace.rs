use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::git;
use crate::types::RepoRef;
use crate::{log_debug, log_warn};

/// Shared checkout directory for a repository: `{root}/{owner}_{name}`.
pub fn shared_checkout_path(workspace_root: &Path, repo: &RepoRef) -> PathBuf {
    workspace_root.join(repo.identifier())
}

/// Per-item worktree directory: `{root}/{owner}_{name}-issue-{ticket_id}`.
/// Deterministic: identical inputs always produce the identical path.
pub fn workspace_path(workspace_root: &Path, repo: &RepoRef, ticket_id: u64) -> PathBuf {
    workspace_root.join(format!("{}-issue-{}", repo.identifier(), ticket_id))
}

/// Branch a workspace's worktree is created on.
pub fn work_branch(ticket_id: u64) -> String {
    format!("issue-{}", ticket_id)
}

/// True only if `workspace` is a proper linked worktree of `shared_checkout`:
/// the path exists, its `.git` marker is a file (a directory means a nested
/// full clone), and the marker's `gitdir:` target resolves into the shared
/// checkout's worktree metadata. Plain directories and corrupted markers are
/// invalid, which keeps pre-worktree layouts and half-initialized directories
/// from being dispatched into.
pub fn is_valid_workspace(workspace: &Path, shared_checkout: &Path) -> bool {
    let marker = workspace.join(".git");
    let Ok(meta) = std::fs::symlink_metadata(&marker) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    let Ok(contents) = std::fs::read_to_string(&marker) else {
        return false;
    };
    let Some(target) = contents
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("gitdir:"))
    else {
        return false;
    };

    let target = target.trim();
    let target_path = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        workspace.join(target)
    };
    if !target_path.exists() {
        return false;
    }

    let worktrees_dir = shared_checkout.join(".git").join("worktrees");
    // Canonicalize both sides so relative segments and symlinks cannot
    // defeat the ancestry check.
    let Ok(canon_target) = target_path.canonicalize() else {
        return false;
    };
    let Ok(canon_worktrees) = worktrees_dir.canonicalize() else {
        return false;
    };
    canon_target.starts_with(&canon_worktrees)
}

/// Ensure the shared checkout for `repo` exists and is fresh.
/// Clones on first use; fetches (with prune) on every call after that.
pub fn ensure_shared_checkout(workspace_root: &Path, repo: &RepoRef) -> Result<PathBuf, String> {
    let shared = shared_checkout_path(workspace_root, repo);

    if shared.exists() {
        git::is_git_repo(&shared)?;
        git::fetch_origin(&shared)?;
        return Ok(shared);
    }

    std::fs::create_dir_all(workspace_root)
        .map_err(|e| format!("Failed to create {}: {}", workspace_root.display(), e))?;
    git::clone_repo(&repo.clone_url(), &shared)?;
    Ok(shared)
}

/// Ensure a valid workspace for `(repo, ticket_id)`, provisioning one if
/// needed. The work branch is reused when it already exists locally or on
/// origin (crash recovery); otherwise it is created from `parent_branch`
/// when given, falling back to the default branch.
pub fn ensure_workspace(
    workspace_root: &Path,
    repo: &RepoRef,
    ticket_id: u64,
    parent_branch: Option<&str>,
) -> Result<PathBuf, String> {
    let shared = ensure_shared_checkout(workspace_root, repo)?;
    let path = workspace_path(workspace_root, repo, ticket_id);

    if is_valid_workspace(&path, &shared) {
        log_debug!("{}#{}: workspace already valid at {}", repo, ticket_id, path.display());
        return Ok(path);
    }

    if path.exists() {
        reclaim_invalid_path(&shared, &path, repo, ticket_id)?;
    }

    let branch = work_branch(ticket_id);
    if git::branch_exists(&shared, &branch)? {
        git::worktree_add(&shared, &path, &branch, None)?;
    } else if git::remote_branch_exists(&shared, &branch)? {
        git::worktree_add(&shared, &path, &branch, Some(&format!("origin/{}", branch)))?;
    } else {
        let start = resolve_start_point(&shared, repo, ticket_id, parent_branch)?;
        git::worktree_add(&shared, &path, &branch, Some(&start))?;
    }

    Ok(path)
}

/// An existing-but-invalid workspace path blocks provisioning. If git still
/// registers it as a worktree, remove it through git; otherwise move the
/// directory aside rather than deleting data we do not own.
fn reclaim_invalid_path(
    shared: &Path,
    path: &Path,
    repo: &RepoRef,
    ticket_id: u64,
) -> Result<(), String> {
    let registered = git::worktree_list(shared)?
        .into_iter()
        .any(|w| w.path == *path);

    if registered {
        log_warn!(
            "{}#{}: workspace at {} is a broken worktree; removing and re-provisioning",
            repo,
            ticket_id,
            path.display()
        );
        git::worktree_remove(shared, path)?;
        git::worktree_prune(shared)?;
        return Ok(());
    }

    let stale = path.with_file_name(format!(
        "{}.stale-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("workspace"),
        chrono::Utc::now().format("%Y%m%d%H%M%S")
    ));
    log_warn!(
        "{}#{}: {} exists but is not a worktree; moving aside to {}",
        repo,
        ticket_id,
        path.display(),
        stale.display()
    );
    std::fs::rename(path, &stale)
        .map_err(|e| format!("Failed to move {} aside: {}", path.display(), e))
}

fn resolve_start_point(
    shared: &Path,
    repo: &RepoRef,
    ticket_id: u64,
    parent_branch: Option<&str>,
) -> Result<String, String> {
    if let Some(parent) = parent_branch {
        if git::remote_branch_exists(shared, parent)? {
            return Ok(format!("origin/{}", parent));
        }
        if git::branch_exists(shared, parent)? {
            return Ok(parent.to_string());
        }
        // Lineage is advisory; a vanished parent branch falls back to the
        // default branch instead of blocking the item.
        log_warn!(
            "{}#{}: parent branch '{}' not found; branching from default",
            repo,
            ticket_id,
            parent
        );
    }

    let default = git::default_branch(shared)?;
    Ok(format!("origin/{}", default))
}

/// Remove the worktree for `(repo, ticket_id)` if one exists.
///
/// The live path comes from git's own worktree registry, matched by work
/// branch and falling back to the computed path, so a manually relocated
/// worktree is still removed correctly. Only this repository's shared
/// checkout is consulted, so another repository's workspace can never be
/// affected even when name segments collide. Returns true if a worktree was
/// removed.
pub fn cleanup_workspace(
    workspace_root: &Path,
    repo: &RepoRef,
    ticket_id: u64,
) -> Result<bool, String> {
    let shared = shared_checkout_path(workspace_root, repo);
    if !shared.exists() {
        return Ok(false);
    }

    let branch = work_branch(ticket_id);
    let computed = workspace_path(workspace_root, repo, ticket_id);

    let target = git::worktree_list(&shared)?
        .into_iter()
        .filter(|w| w.path != shared)
        .find(|w| w.branch.as_deref() == Some(branch.as_str()) || w.path == computed);

    let Some(worktree) = target else {
        return Ok(false);
    };

    git::worktree_remove(&shared, &worktree.path)?;
    git::worktree_prune(&shared)?;
    Ok(true)
}

// --- Lineage ---

/// Explicit parent lineage carried in an issue body's YAML front-matter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Lineage {
    pub parent_branch: Option<String>,
    pub parent_issue: Option<u64>,
}

#[derive(Deserialize)]
struct FrontMatter {
    #[serde(rename = "parent-branch", alias = "parent_branch", default)]
    parent_branch: Option<String>,
    #[serde(rename = "parent-issue", alias = "parent_issue", default)]
    parent_issue: Option<u64>,
}

/// Parse lineage from an issue body's leading YAML front-matter block
/// (`---` delimited). Returns `None` when there is no block, it does not
/// parse, or it carries no lineage keys: lineage is advisory, so malformed
/// front-matter never fails an item.
pub fn parse_front_matter_lineage(body: &str) -> Option<Lineage> {
    let mut lines = body.lines();
    if lines.next()?.trim_end() != "---" {
        return None;
    }

    let mut yaml_lines = Vec::new();
    let mut terminated = false;
    for line in lines {
        if line.trim_end() == "---" {
            terminated = true;
            break;
        }
        yaml_lines.push(line);
    }
    if !terminated {
        return None;
    }

    let parsed: FrontMatter = serde_yaml_ng::from_str(&yaml_lines.join("\n")).ok()?;
    if parsed.parent_branch.is_none() && parsed.parent_issue.is_none() {
        return None;
    }
    Some(Lineage {
        parent_branch: parsed.parent_branch,
        parent_issue: parsed.parent_issue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_repo_ref;

    fn repo(s: &str) -> RepoRef {
        parse_repo_ref(s).unwrap()
    }

    #[test]
    fn test_workspace_path_is_deterministic() {
        let root = Path::new("/srv/work");
        let r = repo("github.com/acme/widgets");
        let first = workspace_path(root, &r, 41);
        let second = workspace_path(root, &r, 41);
        let third = workspace_path(root, &r, 41);
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(first, PathBuf::from("/srv/work/acme_widgets-issue-41"));
    }

    #[test]
    fn test_same_name_different_owner_never_collides() {
        let root = Path::new("/srv/work");
        let a = repo("github.com/acme/widgets");
        let b = repo("github.com/globex/widgets");
        assert_ne!(workspace_path(root, &a, 7), workspace_path(root, &b, 7));
        assert_ne!(shared_checkout_path(root, &a), shared_checkout_path(root, &b));
        assert_ne!(a.identifier(), b.identifier());
    }

    #[test]
    fn test_workspace_path_distinct_per_ticket() {
        let root = Path::new("/srv/work");
        let r = repo("github.com/acme/widgets");
        assert_ne!(workspace_path(root, &r, 1), workspace_path(root, &r, 2));
    }

    #[test]
    fn test_front_matter_lineage_parsed() {
        let body = "---\nparent-branch: issue-12\nparent-issue: 12\n---\n\nDo the thing.";
        let lineage = parse_front_matter_lineage(body).unwrap();
        assert_eq!(lineage.parent_branch.as_deref(), Some("issue-12"));
        assert_eq!(lineage.parent_issue, Some(12));
    }

    #[test]
    fn test_front_matter_underscore_alias() {
        let body = "---\nparent_branch: feature/base\n---\nbody";
        let lineage = parse_front_matter_lineage(body).unwrap();
        assert_eq!(lineage.parent_branch.as_deref(), Some("feature/base"));
    }

    #[test]
    fn test_front_matter_absent_or_irrelevant() {
        assert_eq!(parse_front_matter_lineage("Just a body."), None);
        assert_eq!(parse_front_matter_lineage("---\ntitle: x\n---\nbody"), None);
        // Unterminated block
        assert_eq!(parse_front_matter_lineage("---\nparent-branch: x\n"), None);
    }

    #[test]
    fn test_front_matter_malformed_yaml_is_ignored() {
        let body = "---\nparent-branch: [unclosed\n---\nbody";
        assert_eq!(parse_front_matter_lineage(body), None);
    }

    #[test]
    fn test_invalid_workspace_when_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let shared = dir.path().join("acme_widgets");
        let ws = dir.path().join("acme_widgets-issue-1");
        assert!(!is_valid_workspace(&ws, &shared));
    }

    #[test]
    fn test_invalid_workspace_plain_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let shared = dir.path().join("acme_widgets");
        let ws = dir.path().join("acme_widgets-issue-1");
        std::fs::create_dir_all(&ws).unwrap();
        assert!(!is_valid_workspace(&ws, &shared));
    }

    #[test]
    fn test_invalid_workspace_git_dir_means_nested_clone() {
        let dir = tempfile::TempDir::new().unwrap();
        let shared = dir.path().join("acme_widgets");
        let ws = dir.path().join("acme_widgets-issue-1");
        std::fs::create_dir_all(ws.join(".git")).unwrap();
        assert!(!is_valid_workspace(&ws, &shared));
    }

    #[test]
    fn test_invalid_workspace_corrupted_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let shared = dir.path().join("acme_widgets");
        let ws = dir.path().join("acme_widgets-issue-1");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join(".git"), "not a gitdir pointer").unwrap();
        assert!(!is_valid_workspace(&ws, &shared));
    }

    #[test]
    fn test_valid_workspace_marker_into_shared_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let shared = dir.path().join("acme_widgets");
        let meta = shared.join(".git/worktrees/acme_widgets-issue-1");
        std::fs::create_dir_all(&meta).unwrap();

        let ws = dir.path().join("acme_widgets-issue-1");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join(".git"), format!("gitdir: {}\n", meta.display())).unwrap();

        assert!(is_valid_workspace(&ws, &shared));
    }

    #[test]
    fn test_marker_into_other_repo_metadata_is_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let shared = dir.path().join("acme_widgets");
        std::fs::create_dir_all(shared.join(".git/worktrees")).unwrap();

        let other_meta = dir.path().join("globex_widgets/.git/worktrees/globex_widgets-issue-1");
        std::fs::create_dir_all(&other_meta).unwrap();

        let ws = dir.path().join("acme_widgets-issue-1");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join(".git"), format!("gitdir: {}\n", other_meta.display())).unwrap();

        assert!(!is_valid_workspace(&ws, &shared));
    }
}
