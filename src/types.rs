use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    #[default]
    Open,
    Closed,
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemState::Open => write!(f, "OPEN"),
            ItemState::Closed => write!(f, "CLOSED"),
        }
    }
}

pub fn parse_item_state(s: &str) -> Result<ItemState, String> {
    match s.to_uppercase().as_str() {
        "OPEN" => Ok(ItemState::Open),
        "CLOSED" => Ok(ItemState::Closed),
        _ => Err(format!("Invalid item state '{}': expected OPEN or CLOSED", s)),
    }
}

/// Outcome codes an agent writes into its result file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Completed,
    Failed,
}

// --- Structs ---

/// Status the tracker reports when an item has no status field value.
pub const UNKNOWN_STATUS: &str = "Unknown";

/// One board entry, snapshotted per poll. Never mutated in place; the next
/// tick re-fetches.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TicketItem {
    /// Opaque board-side identifier for the item (not the issue number).
    pub item_id: String,
    pub board_url: String,
    /// Tracker-local issue number.
    pub ticket_id: u64,
    /// Always `hostname/owner/name`; the hostname segment keeps items from
    /// differently-hosted trackers from colliding.
    pub repo: String,
    /// Current board column name; `UNKNOWN_STATUS` when the field is unset.
    pub status: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    pub state: ItemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<String>,
    #[serde(default)]
    pub has_merged_changes: bool,
    #[serde(default)]
    pub comment_count: u32,
}

impl TicketItem {
    /// Registry key for this item: `{repo}#{ticket_id}`.
    pub fn registry_key(&self) -> String {
        registry_key(&self.repo, self.ticket_id)
    }
}

/// Key under which the concurrency registry tracks an item.
pub fn registry_key(repo: &str, ticket_id: u64) -> String {
    format!("{}#{}", repo, ticket_id)
}

/// Per-board cache of tracker-internal identifiers. Fetched once per board
/// at startup and kept for the daemon lifetime.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct BoardMetadata {
    pub project_id: String,
    pub status_field_id: String,
    /// Ordered as the board orders its columns.
    #[serde(default)]
    pub status_options: Vec<StatusOption>,
}

impl BoardMetadata {
    pub fn option_id(&self, status_name: &str) -> Option<&str> {
        self.status_options
            .iter()
            .find(|o| o.name == status_name)
            .map(|o| o.id.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusOption {
    pub name: String,
    pub id: String,
}

/// Everything a dispatched workflow needs. Built fresh per dispatch, never
/// persisted.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct WorkflowContext {
    pub repo: String,
    pub issue_number: u64,
    pub issue_title: String,
    pub issue_body: Option<String>,
    pub workspace_path: std::path::PathBuf,
    pub allowed_username: Option<String>,
    pub project_url: Option<String>,
    /// Lineage for stacked work: set when the item branches off another
    /// item's branch instead of the default branch.
    pub parent_issue_number: Option<u64>,
    pub parent_branch: Option<String>,
    /// Set only for comment-edit workflows.
    pub comment_body: Option<String>,
    pub target_type: Option<String>,
}

/// Structured result an agent writes when a stage finishes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StageResult {
    pub stage: String,
    pub result: ResultCode,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// What the runner hands back to the scheduler on success.
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerOutcome {
    pub response: StageResult,
    pub metrics: RunnerMetrics,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct RunnerMetrics {
    pub duration_secs: u64,
    pub exit_code: Option<i32>,
}

// --- Repository references ---

/// Parsed form of the `hostname/owner/name` repo string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub hostname: String,
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Filesystem-safe identifier: `{owner}_{name}`. Owner is included so
    /// two owners' repos with the same final segment never share a path.
    pub fn identifier(&self) -> String {
        format!("{}_{}", self.owner, self.name)
    }

    /// `owner/name`, as tracker CLIs expect for their `--repo` flags.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn clone_url(&self) -> String {
        format!("https://{}/{}/{}.git", self.hostname, self.owner, self.name)
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.hostname, self.owner, self.name)
    }
}

/// Parse a `hostname/owner/name` string. All three segments are required;
/// a two-segment `owner/name` form is rejected so hostnames are never
/// silently assumed.
pub fn parse_repo_ref(s: &str) -> Result<RepoRef, String> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(format!(
            "Invalid repo '{}': expected hostname/owner/name",
            s
        ));
    }
    Ok(RepoRef {
        hostname: parts[0].to_string(),
        owner: parts[1].to_string(),
        name: parts[2].to_string(),
    })
}
