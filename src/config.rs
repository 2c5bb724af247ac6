use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Retry interval while hibernating on a network outage, and the cap on
/// exponential backoff for non-network failures. Both fixed at five minutes.
pub const HIBERNATION_INTERVAL_SECS: u64 = 300;
pub const BACKOFF_CAP_SECS: u64 = 300;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DroverConfig {
    pub daemon: DaemonConfig,
    pub statuses: StatusesConfig,
    pub tracker: TrackerConfig,
    pub runner: RunnerConfig,
    pub alerting: AlertingConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub poll_interval_secs: u64,
    pub max_concurrent_workflows: u32,
    /// Directory holding shared checkouts and per-item worktrees. Relative
    /// paths resolve against the daemon root.
    pub workspace_root: String,
    /// Board project URLs to poll.
    pub boards: Vec<String>,
    /// Username whose board moves authorize dispatch.
    pub self_identity: Option<String>,
    /// When true, rule-of-thumb authorization is skipped and anyone's board
    /// moves dispatch workflows.
    pub allow_external_tickets: bool,
    /// Audit-only: actors listed here are named as teammates in refusal
    /// warnings but are still refused.
    pub team_members: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StatusesConfig {
    pub research: String,
    pub plan: String,
    pub implement: String,
    pub validate: String,
    /// Column items are corrected to when the tracker reports no status.
    pub baseline: String,
    /// Column a successful validate workflow promotes items to.
    pub done: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// "cloud" or "enterprise-{major}.{minor}"; selects capability flags.
    pub api_version: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub cli_path: String,
    pub workflow_timeout_minutes: u64,
    pub mcp_config: Option<PathBuf>,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AlertingConfig {
    /// Alerting is disabled when unset.
    pub routing_key: Option<String>,
    pub endpoint: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            max_concurrent_workflows: 1,
            workspace_root: "workspaces".to_string(),
            boards: vec![],
            self_identity: None,
            allow_external_tickets: false,
            team_members: vec![],
        }
    }
}

impl Default for StatusesConfig {
    fn default() -> Self {
        Self {
            research: "Research".to_string(),
            plan: "Plan".to_string(),
            implement: "Implement".to_string(),
            validate: "Validate".to_string(),
            baseline: "Todo".to_string(),
            done: "Done".to_string(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_version: "cloud".to_string(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
            workflow_timeout_minutes: 60,
            mcp_config: None,
        }
    }
}

impl DroverConfig {
    /// Workspace root resolved against the daemon root.
    pub fn workspace_root(&self, root: &Path) -> PathBuf {
        let configured = Path::new(&self.daemon.workspace_root);
        if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            root.join(configured)
        }
    }

    /// Directory for daemon state: lock, pid, result files, worklog.
    pub fn state_dir(&self, root: &Path) -> PathBuf {
        root.join(".drover")
    }
}

pub fn validate(config: &DroverConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.daemon.poll_interval_secs < 1 {
        errors.push("daemon.poll_interval_secs must be >= 1".to_string());
    }

    if config.daemon.max_concurrent_workflows < 1 {
        errors.push("daemon.max_concurrent_workflows must be >= 1".to_string());
    }

    if config.daemon.boards.is_empty() {
        errors.push("daemon.boards must list at least one board URL".to_string());
    }

    for board in &config.daemon.boards {
        if parse_board_url(board).is_err() {
            errors.push(format!(
                "daemon.boards: '{}' is not a recognized project URL",
                board
            ));
        }
    }

    if config.daemon.self_identity.is_none() && !config.daemon.allow_external_tickets {
        errors.push(
            "daemon.self_identity is required unless daemon.allow_external_tickets is true"
                .to_string(),
        );
    }

    if config.runner.workflow_timeout_minutes < 1 {
        errors.push("runner.workflow_timeout_minutes must be >= 1".to_string());
    }

    if config.runner.cli_path.trim().is_empty() {
        errors.push("runner.cli_path must not be empty".to_string());
    }

    // Column names must be distinct or stage resolution is ambiguous.
    let statuses = &config.statuses;
    let columns = [
        &statuses.research,
        &statuses.plan,
        &statuses.implement,
        &statuses.validate,
        &statuses.baseline,
        &statuses.done,
    ];
    for (i, a) in columns.iter().enumerate() {
        if a.trim().is_empty() {
            errors.push("statuses: column names must not be empty".to_string());
            break;
        }
        for b in columns.iter().skip(i + 1) {
            if a == b {
                errors.push(format!("statuses: duplicate column name '{}'", a));
            }
        }
    }

    if config.alerting.routing_key.is_some() {
        if let Some(endpoint) = &config.alerting.endpoint {
            if !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
                errors.push(format!(
                    "alerting.endpoint '{}' must be an http(s) URL",
                    endpoint
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn load_config(root: &Path, config_path: Option<&Path>) -> Result<DroverConfig, String> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => root.join("drover.toml"),
    };

    if !path.exists() {
        return Err(format!(
            "Config not found at {}. Run `drover init` to create one.",
            path.display()
        ));
    }

    let contents = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let config: DroverConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

// --- Board URLs ---

/// Owner kind for a project URL: organization or user project.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoardOwner {
    Org,
    User,
}

/// Parsed `https://{host}/orgs/{owner}/projects/{n}` or
/// `https://{host}/users/{owner}/projects/{n}` board URL.
#[derive(Clone, Debug, PartialEq)]
pub struct BoardRef {
    pub hostname: String,
    pub owner: String,
    pub owner_kind: BoardOwner,
    pub number: u32,
}

pub fn parse_board_url(url: &str) -> Result<BoardRef, String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| format!("Board URL '{}' must start with http(s)://", url))?;

    let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    // {host}/orgs/{owner}/projects/{n} or {host}/users/{owner}/projects/{n}
    if parts.len() != 5 || parts[3] != "projects" {
        return Err(format!(
            "Board URL '{}' must look like https://host/orgs/OWNER/projects/N",
            url
        ));
    }

    let owner_kind = match parts[1] {
        "orgs" => BoardOwner::Org,
        "users" => BoardOwner::User,
        other => {
            return Err(format!(
                "Board URL '{}': expected 'orgs' or 'users', got '{}'",
                url, other
            ));
        }
    };

    let number: u32 = parts[4]
        .parse()
        .map_err(|_| format!("Board URL '{}': project number '{}' is not a number", url, parts[4]))?;

    if parts[0].is_empty() || parts[2].is_empty() {
        return Err(format!("Board URL '{}' has an empty hostname or owner", url));
    }

    Ok(BoardRef {
        hostname: parts[0].to_string(),
        owner: parts[2].to_string(),
        owner_kind,
        number,
    })
}

/// Starter config written by `drover init`.
pub fn starter_config_toml() -> String {
    let mut out = String::new();
    out.push_str("[daemon]\n");
    out.push_str("poll_interval_secs = 60\n");
    out.push_str("max_concurrent_workflows = 1\n");
    out.push_str("workspace_root = \"workspaces\"\n");
    out.push_str("boards = []  # e.g. \"https://github.com/orgs/acme/projects/4\"\n");
    out.push_str("# self_identity = \"your-username\"\n");
    out.push_str("allow_external_tickets = false\n");
    out.push_str("\n[statuses]\n");
    out.push_str("research = \"Research\"\n");
    out.push_str("plan = \"Plan\"\n");
    out.push_str("implement = \"Implement\"\n");
    out.push_str("validate = \"Validate\"\n");
    out.push_str("baseline = \"Todo\"\n");
    out.push_str("done = \"Done\"\n");
    out.push_str("\n[tracker]\n");
    out.push_str("api_version = \"cloud\"\n");
    out.push_str("\n[runner]\n");
    out.push_str("cli_path = \"claude\"\n");
    out.push_str("workflow_timeout_minutes = 60\n");
    out.push_str("\n[alerting]\n");
    out.push_str("# routing_key = \"...\"\n");
    out
}
