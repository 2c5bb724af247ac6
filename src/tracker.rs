use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use serde_json::Value;

use crate::config::{parse_board_url, BoardOwner};
use crate::log_debug;
use crate::stage::LabelSpec;
use crate::types::{
    registry_key, BoardMetadata, ItemState, StatusOption, TicketItem, UNKNOWN_STATUS,
};

/// Hard page limit for board item pagination. A well-formed board fits in
/// far fewer pages; hitting this means the cursor is cycling.
const MAX_ITEM_PAGES: u32 = 200;

// --- Capabilities ---

/// What a tracker variant can do. The engine never branches on the version
/// string itself, only on these flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerCapabilities {
    pub supports_linked_prs: bool,
    pub supports_sub_issues: bool,
    pub supports_status_actor_check: bool,
}

impl TrackerCapabilities {
    pub fn full() -> Self {
        Self {
            supports_linked_prs: true,
            supports_sub_issues: true,
            supports_status_actor_check: true,
        }
    }
}

/// Resolve capabilities from a configured version string: `cloud` has
/// everything; `enterprise-{major}.{minor}` gains features by release
/// (linked PRs in 3.10, status actors in 3.12, sub-issues in 3.16).
pub fn capabilities_for_version(version: &str) -> Result<TrackerCapabilities, String> {
    if version == "cloud" {
        return Ok(TrackerCapabilities::full());
    }

    let Some(release) = version.strip_prefix("enterprise-") else {
        return Err(format!(
            "Unknown tracker.api_version '{}': expected 'cloud' or 'enterprise-MAJOR.MINOR'",
            version
        ));
    };

    let (major, minor) = release
        .split_once('.')
        .and_then(|(maj, min)| Some((maj.parse::<u32>().ok()?, min.parse::<u32>().ok()?)))
        .ok_or_else(|| {
            format!(
                "Unknown tracker.api_version '{}': expected 'cloud' or 'enterprise-MAJOR.MINOR'",
                version
            )
        })?;

    let at_least = |maj: u32, min: u32| major > maj || (major == maj && minor >= min);

    Ok(TrackerCapabilities {
        supports_linked_prs: at_least(3, 10),
        supports_sub_issues: at_least(3, 16),
        supports_status_actor_check: at_least(3, 12),
    })
}

// --- Client trait ---

/// Board and label operations the engine consumes. Enables mocking in
/// scheduler and state machine tests.
pub trait TicketClient: Send + Sync {
    fn capabilities(&self) -> TrackerCapabilities;

    /// All items on a board. Paginated internally; a cursor that stops
    /// advancing aborts with an error rather than looping forever.
    fn get_board_items(
        &self,
        board_url: &str,
    ) -> impl std::future::Future<Output = Result<Vec<TicketItem>, String>> + Send;

    fn get_board_metadata(
        &self,
        board_url: &str,
    ) -> impl std::future::Future<Output = Result<BoardMetadata, String>> + Send;

    fn update_item_status(
        &self,
        item_id: &str,
        status_name: &str,
        hostname: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Idempotent. A missing label definition is created on demand, then
    /// the add is retried.
    fn add_label(
        &self,
        repo: &str,
        ticket_id: u64,
        label: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Idempotent; removing an absent label is not an error.
    fn remove_label(
        &self,
        repo: &str,
        ticket_id: u64,
        label: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Create the label definition on the repository if absent.
    fn ensure_label_defined(
        &self,
        repo: &str,
        label: &LabelSpec,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Who most recently set the item's current status. `None` when the
    /// tracker cannot say.
    fn get_last_status_actor(
        &self,
        item_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, String>> + Send;

    /// Who most recently applied any of `label_names` to the ticket.
    fn get_label_actor(
        &self,
        repo: &str,
        ticket_id: u64,
        label_names: &[String],
    ) -> impl std::future::Future<Output = Result<Option<String>, String>> + Send;

    fn get_ticket_labels(
        &self,
        repo: &str,
        ticket_id: u64,
    ) -> impl std::future::Future<Output = Result<Vec<String>, String>> + Send;

    fn get_ticket_body(
        &self,
        repo: &str,
        ticket_id: u64,
    ) -> impl std::future::Future<Output = Result<Option<String>, String>> + Send;

    /// Head branch of the PR linked to this ticket, if any. Callers gate on
    /// `supports_linked_prs`.
    fn get_linked_pr_branch(
        &self,
        repo: &str,
        ticket_id: u64,
    ) -> impl std::future::Future<Output = Result<Option<String>, String>> + Send;

    /// Parent issue number when this ticket is a sub-issue. Callers gate on
    /// `supports_sub_issues`.
    fn get_parent_issue(
        &self,
        repo: &str,
        ticket_id: u64,
    ) -> impl std::future::Future<Output = Result<Option<u64>, String>> + Send;
}

// --- Pagination ---

/// One page of a cursor-paginated listing.
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Walk a cursor-paginated endpoint to exhaustion.
///
/// Aborts with an error if the endpoint hands back the same cursor twice in
/// a row, or exceeds `MAX_ITEM_PAGES`; both indicate a server-side paging
/// bug that would otherwise spin this loop forever.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, String>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<Page<T>, String>>,
{
    let mut all = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_ITEM_PAGES {
        let page = fetch(cursor.clone()).await?;
        all.extend(page.items);

        match page.next_cursor {
            None => return Ok(all),
            Some(next) => {
                if cursor.as_deref() == Some(next.as_str()) {
                    return Err(format!(
                        "Pagination cursor did not advance (stuck at '{}')",
                        next
                    ));
                }
                cursor = Some(next);
            }
        }
    }

    Err(format!(
        "Pagination exceeded {} pages without terminating",
        MAX_ITEM_PAGES
    ))
}

// --- gh-backed implementation ---

/// Production client shelling out to the `gh` CLI. Authentication and
/// enterprise hosts are gh's problem: `GH_HOST` selects the host, `gh auth`
/// supplies credentials.
///
/// Board metadata and the item→board mapping are cached internally so
/// item-keyed operations need only the identifiers the engine holds.
pub struct GhTicketClient {
    capabilities: TrackerCapabilities,
    metadata_cache: Mutex<HashMap<String, BoardMetadata>>,
    item_boards: Mutex<HashMap<String, String>>,
}

impl GhTicketClient {
    pub fn from_version(version: &str) -> Result<Self, String> {
        Ok(Self {
            capabilities: capabilities_for_version(version)?,
            metadata_cache: Mutex::new(HashMap::new()),
            item_boards: Mutex::new(HashMap::new()),
        })
    }

    /// Verify the gh CLI is installed and authenticated.
    pub fn verify_cli_available() -> Result<(), String> {
        let version = std::process::Command::new("gh")
            .arg("--version")
            .output()
            .map_err(|e| format!("gh not found on PATH. Install the GitHub CLI. ({})", e))?;
        if !version.status.success() {
            return Err("gh found but `gh --version` failed".to_string());
        }

        let auth = std::process::Command::new("gh")
            .args(["auth", "status"])
            .output()
            .map_err(|e| format!("Failed to run gh auth status: {}", e))?;
        if !auth.status.success() {
            return Err(
                "gh is not authenticated. Run `gh auth login` for each tracker host.".to_string(),
            );
        }
        Ok(())
    }

    async fn run_gh(&self, hostname: &str, args: &[&str]) -> Result<String, String> {
        let mut cmd = tokio::process::Command::new("gh");
        cmd.args(args);
        cmd.stdin(std::process::Stdio::null());
        if hostname != "github.com" {
            cmd.env("GH_HOST", hostname);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("Failed to run gh {}: {}", args.first().unwrap_or(&""), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "gh {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            ));
        }

        String::from_utf8(output.stdout).map_err(|e| format!("gh output is not valid UTF-8: {}", e))
    }

    async fn graphql(
        &self,
        hostname: &str,
        query: &str,
        fields: &[(&str, String)],
    ) -> Result<Value, String> {
        let mut args: Vec<String> = vec!["api".into(), "graphql".into()];
        args.push("-f".into());
        args.push(format!("query={}", query));
        for (key, value) in fields {
            args.push("-F".into());
            args.push(format!("{}={}", key, value));
        }

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let raw = self.run_gh(hostname, &arg_refs).await?;
        serde_json::from_str(&raw).map_err(|e| format!("Failed to parse gh response: {}", e))
    }

    fn board_for_item(&self, item_id: &str) -> Result<String, String> {
        self.item_boards
            .lock()
            .map_err(|_| "item-board cache lock poisoned".to_string())?
            .get(item_id)
            .cloned()
            .ok_or_else(|| format!("Item '{}' was not seen on any polled board", item_id))
    }

    async fn metadata_for_board(&self, board_url: &str) -> Result<BoardMetadata, String> {
        if let Ok(cache) = self.metadata_cache.lock() {
            if let Some(meta) = cache.get(board_url) {
                return Ok(meta.clone());
            }
        }
        self.get_board_metadata(board_url).await
    }

    /// GraphQL root selector for the board owner.
    fn board_root(owner_kind: BoardOwner) -> &'static str {
        match owner_kind {
            BoardOwner::Org => "organization",
            BoardOwner::User => "user",
        }
    }

    fn items_query(&self, root: &str) -> String {
        // closedByPullRequestsReferences only exists on newer API versions;
        // older trackers get the query without it and has_merged_changes
        // stays false.
        let merged_fragment = if self.capabilities.supports_linked_prs {
            "closedByPullRequestsReferences(first: 10, includeClosedPrs: true) { nodes { merged } }"
        } else {
            ""
        };

        format!(
            "query($owner: String!, $number: Int!, $cursor: String) {{\n\
               {root}(login: $owner) {{ projectV2(number: $number) {{\n\
                 items(first: 50, after: $cursor) {{\n\
                   pageInfo {{ hasNextPage endCursor }}\n\
                   nodes {{\n\
                     id\n\
                     fieldValueByName(name: \"Status\") {{\n\
                       ... on ProjectV2ItemFieldSingleSelectValue {{ name }}\n\
                     }}\n\
                     content {{ ... on Issue {{\n\
                       number title body state stateReason\n\
                       repository {{ nameWithOwner }}\n\
                       labels(first: 100) {{ nodes {{ name }} }}\n\
                       comments {{ totalCount }}\n\
                       {merged_fragment}\n\
                     }} }}\n\
                   }}\n\
                 }}\n\
               }} }}\n\
             }}",
            root = root,
            merged_fragment = merged_fragment,
        )
    }

    fn parse_item_node(node: &Value, board_url: &str, hostname: &str) -> Option<TicketItem> {
        let item_id = node.pointer("/id")?.as_str()?.to_string();
        let content = node.pointer("/content")?;

        // Draft issues and PRs have no issue number; the engine only
        // schedules issues.
        let ticket_id = content.pointer("/number")?.as_u64()?;
        let name_with_owner = content.pointer("/repository/nameWithOwner")?.as_str()?;

        let status = node
            .pointer("/fieldValueByName/name")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_STATUS)
            .to_string();

        let labels: BTreeSet<String> = content
            .pointer("/labels/nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.pointer("/name").and_then(Value::as_str))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();

        let state = match content.pointer("/state").and_then(Value::as_str) {
            Some("CLOSED") => ItemState::Closed,
            _ => ItemState::Open,
        };

        let has_merged_changes = content
            .pointer("/closedByPullRequestsReferences/nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .any(|n| n.pointer("/merged").and_then(Value::as_bool) == Some(true))
            })
            .unwrap_or(false);

        Some(TicketItem {
            item_id,
            board_url: board_url.to_string(),
            ticket_id,
            repo: format!("{}/{}", hostname, name_with_owner),
            status,
            title: content
                .pointer("/title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            labels,
            state,
            state_reason: content
                .pointer("/stateReason")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            has_merged_changes,
            comment_count: content
                .pointer("/comments/totalCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
        })
    }
}

impl TicketClient for GhTicketClient {
    fn capabilities(&self) -> TrackerCapabilities {
        self.capabilities
    }

    async fn get_board_items(&self, board_url: &str) -> Result<Vec<TicketItem>, String> {
        let board = parse_board_url(board_url)?;
        let root = Self::board_root(board.owner_kind);
        let query = self.items_query(root);
        let pointer_prefix = format!("/data/{}/projectV2/items", root);

        let items = collect_pages(|cursor| {
            let query = query.clone();
            let pointer_prefix = pointer_prefix.clone();
            let board = board.clone();
            async move {
                let mut fields = vec![
                    ("owner", board.owner.clone()),
                    ("number", board.number.to_string()),
                ];
                if let Some(cursor) = &cursor {
                    fields.push(("cursor", cursor.clone()));
                }

                let response = self.graphql(&board.hostname, &query, &fields).await?;

                let nodes = response
                    .pointer(&format!("{}/nodes", pointer_prefix))
                    .and_then(Value::as_array)
                    .ok_or_else(|| format!("Board '{}' returned no item nodes", board_url))?;

                let mut page_items = Vec::new();
                for node in nodes {
                    match Self::parse_item_node(node, board_url, &board.hostname) {
                        Some(item) => page_items.push(item),
                        None => log_debug!("[tracker] skipping non-issue board entry"),
                    }
                }

                let has_next = response
                    .pointer(&format!("{}/pageInfo/hasNextPage", pointer_prefix))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let next_cursor = if has_next {
                    response
                        .pointer(&format!("{}/pageInfo/endCursor", pointer_prefix))
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                } else {
                    None
                };

                Ok(Page {
                    items: page_items,
                    next_cursor,
                })
            }
        })
        .await?;

        if let Ok(mut map) = self.item_boards.lock() {
            for item in &items {
                map.insert(item.item_id.clone(), board_url.to_string());
            }
        }

        Ok(items)
    }

    async fn get_board_metadata(&self, board_url: &str) -> Result<BoardMetadata, String> {
        let board = parse_board_url(board_url)?;
        let root = Self::board_root(board.owner_kind);

        let query = format!(
            "query($owner: String!, $number: Int!) {{\n\
               {root}(login: $owner) {{ projectV2(number: $number) {{\n\
                 id\n\
                 field(name: \"Status\") {{\n\
                   ... on ProjectV2SingleSelectField {{ id options {{ id name }} }}\n\
                 }}\n\
               }} }}\n\
             }}",
            root = root,
        );

        let fields = vec![
            ("owner", board.owner.clone()),
            ("number", board.number.to_string()),
        ];
        let response = self.graphql(&board.hostname, &query, &fields).await?;

        let prefix = format!("/data/{}/projectV2", root);
        let project_id = response
            .pointer(&format!("{}/id", prefix))
            .and_then(Value::as_str)
            .ok_or_else(|| format!("Board '{}' not found or not accessible", board_url))?
            .to_string();
        let status_field_id = response
            .pointer(&format!("{}/field/id", prefix))
            .and_then(Value::as_str)
            .ok_or_else(|| format!("Board '{}' has no 'Status' field", board_url))?
            .to_string();

        let status_options = response
            .pointer(&format!("{}/field/options", prefix))
            .and_then(Value::as_array)
            .map(|options| {
                options
                    .iter()
                    .filter_map(|o| {
                        Some(StatusOption {
                            name: o.pointer("/name")?.as_str()?.to_string(),
                            id: o.pointer("/id")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let metadata = BoardMetadata {
            project_id,
            status_field_id,
            status_options,
        };

        if let Ok(mut cache) = self.metadata_cache.lock() {
            cache.insert(board_url.to_string(), metadata.clone());
        }

        Ok(metadata)
    }

    async fn update_item_status(
        &self,
        item_id: &str,
        status_name: &str,
        hostname: &str,
    ) -> Result<(), String> {
        let board_url = self.board_for_item(item_id)?;
        let metadata = self.metadata_for_board(&board_url).await?;
        let option_id = metadata.option_id(status_name).ok_or_else(|| {
            format!(
                "Status '{}' does not exist on board '{}'",
                status_name, board_url
            )
        })?;

        let query = "mutation($project: ID!, $item: ID!, $field: ID!, $option: String!) {\n\
                       updateProjectV2ItemFieldValue(input: {\n\
                         projectId: $project, itemId: $item, fieldId: $field,\n\
                         value: { singleSelectOptionId: $option }\n\
                       }) { projectV2Item { id } }\n\
                     }";

        let fields = vec![
            ("project", metadata.project_id.clone()),
            ("item", item_id.to_string()),
            ("field", metadata.status_field_id.clone()),
            ("option", option_id.to_string()),
        ];
        self.graphql(hostname, query, &fields).await?;
        Ok(())
    }

    async fn add_label(&self, repo: &str, ticket_id: u64, label: &str) -> Result<(), String> {
        let repo_ref = crate::types::parse_repo_ref(repo)?;
        let path = format!("repos/{}/issues/{}/labels", repo_ref.slug(), ticket_id);
        let label_field = format!("labels[]={}", label);
        let args = ["api", "--method", "POST", path.as_str(), "-f", label_field.as_str()];

        match self.run_gh(&repo_ref.hostname, &args).await {
            Ok(_) => Ok(()),
            // 422 means the label has no definition on this repo yet;
            // create it and retry once.
            Err(e) if e.contains("422") || e.contains("Validation Failed") => {
                let create_path = format!("repos/{}/labels", repo_ref.slug());
                let name_field = format!("name={}", label);
                let create_args = [
                    "api",
                    "--method",
                    "POST",
                    create_path.as_str(),
                    "-f",
                    name_field.as_str(),
                    "-f",
                    "color=ededed",
                ];
                match self.run_gh(&repo_ref.hostname, &create_args).await {
                    Ok(_) => {}
                    Err(e) if e.contains("already_exists") => {}
                    Err(e) => return Err(e),
                }
                self.run_gh(&repo_ref.hostname, &args).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_label(&self, repo: &str, ticket_id: u64, label: &str) -> Result<(), String> {
        let repo_ref = crate::types::parse_repo_ref(repo)?;
        let path = format!(
            "repos/{}/issues/{}/labels/{}",
            repo_ref.slug(),
            ticket_id,
            label
        );
        let args = ["api", "--method", "DELETE", path.as_str()];

        match self.run_gh(&repo_ref.hostname, &args).await {
            Ok(_) => Ok(()),
            // Removing a label that is not on the ticket is a no-op.
            Err(e) if e.contains("404") || e.contains("Not Found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_label_defined(&self, repo: &str, label: &LabelSpec) -> Result<(), String> {
        let repo_ref = crate::types::parse_repo_ref(repo)?;
        let path = format!("repos/{}/labels", repo_ref.slug());
        let name_field = format!("name={}", label.name);
        let color_field = format!("color={}", label.color);
        let description_field = format!("description={}", label.description);
        let args = [
            "api",
            "--method",
            "POST",
            path.as_str(),
            "-f",
            name_field.as_str(),
            "-f",
            color_field.as_str(),
            "-f",
            description_field.as_str(),
        ];

        match self.run_gh(&repo_ref.hostname, &args).await {
            Ok(_) => Ok(()),
            Err(e) if e.contains("already_exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_last_status_actor(&self, item_id: &str) -> Result<Option<String>, String> {
        let board_url = self.board_for_item(item_id)?;
        let board = parse_board_url(&board_url)?;

        let query = "query($item: ID!) {\n\
                       node(id: $item) { ... on ProjectV2Item {\n\
                         fieldValueByName(name: \"Status\") {\n\
                           ... on ProjectV2ItemFieldSingleSelectValue { creator { login } }\n\
                         }\n\
                       } }\n\
                     }";

        let fields = vec![("item", item_id.to_string())];
        let response = self.graphql(&board.hostname, query, &fields).await?;

        Ok(response
            .pointer("/data/node/fieldValueByName/creator/login")
            .and_then(Value::as_str)
            .map(|s| s.to_string()))
    }

    async fn get_label_actor(
        &self,
        repo: &str,
        ticket_id: u64,
        label_names: &[String],
    ) -> Result<Option<String>, String> {
        let repo_ref = crate::types::parse_repo_ref(repo)?;

        let query = "query($owner: String!, $name: String!, $number: Int!) {\n\
                       repository(owner: $owner, name: $name) { issue(number: $number) {\n\
                         timelineItems(itemTypes: [LABELED_EVENT], last: 50) {\n\
                           nodes { ... on LabeledEvent {\n\
                             createdAt label { name } actor { login }\n\
                           } }\n\
                         }\n\
                       } }\n\
                     }";

        let fields = vec![
            ("owner", repo_ref.owner.clone()),
            ("name", repo_ref.name.clone()),
            ("number", ticket_id.to_string()),
        ];
        let response = self.graphql(&repo_ref.hostname, query, &fields).await?;

        let nodes = response
            .pointer("/data/repository/issue/timelineItems/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Nodes arrive oldest-first; the most recent matching event wins.
        let actor = nodes
            .iter()
            .rev()
            .filter(|n| {
                n.pointer("/label/name")
                    .and_then(Value::as_str)
                    .map(|name| label_names.iter().any(|l| l == name))
                    .unwrap_or(false)
            })
            .find_map(|n| n.pointer("/actor/login").and_then(Value::as_str))
            .map(|s| s.to_string());

        Ok(actor)
    }

    async fn get_ticket_labels(&self, repo: &str, ticket_id: u64) -> Result<Vec<String>, String> {
        let repo_ref = crate::types::parse_repo_ref(repo)?;
        let path = format!("repos/{}/issues/{}/labels", repo_ref.slug(), ticket_id);
        let raw = self.run_gh(&repo_ref.hostname, &["api", path.as_str()]).await?;

        let value: Value =
            serde_json::from_str(&raw).map_err(|e| format!("Failed to parse labels: {}", e))?;
        Ok(value
            .as_array()
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|l| l.pointer("/name").and_then(Value::as_str))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_ticket_body(&self, repo: &str, ticket_id: u64) -> Result<Option<String>, String> {
        let repo_ref = crate::types::parse_repo_ref(repo)?;
        let path = format!("repos/{}/issues/{}", repo_ref.slug(), ticket_id);
        let raw = self.run_gh(&repo_ref.hostname, &["api", path.as_str()]).await?;

        let value: Value =
            serde_json::from_str(&raw).map_err(|e| format!("Failed to parse issue: {}", e))?;
        Ok(value
            .pointer("/body")
            .and_then(Value::as_str)
            .filter(|b| !b.is_empty())
            .map(|s| s.to_string()))
    }

    async fn get_linked_pr_branch(
        &self,
        repo: &str,
        ticket_id: u64,
    ) -> Result<Option<String>, String> {
        let repo_ref = crate::types::parse_repo_ref(repo)?;

        let query = "query($owner: String!, $name: String!, $number: Int!) {\n\
                       repository(owner: $owner, name: $name) { issue(number: $number) {\n\
                         closedByPullRequestsReferences(first: 5, includeClosedPrs: true) {\n\
                           nodes { headRefName merged closed }\n\
                         }\n\
                       } }\n\
                     }";

        let fields = vec![
            ("owner", repo_ref.owner.clone()),
            ("name", repo_ref.name.clone()),
            ("number", ticket_id.to_string()),
        ];
        let response = self.graphql(&repo_ref.hostname, query, &fields).await?;

        let nodes = response
            .pointer("/data/repository/issue/closedByPullRequestsReferences/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Prefer a still-open PR's branch; otherwise take the newest.
        let open_branch = nodes
            .iter()
            .filter(|n| n.pointer("/closed").and_then(Value::as_bool) == Some(false))
            .find_map(|n| n.pointer("/headRefName").and_then(Value::as_str));
        let any_branch = nodes
            .iter()
            .rev()
            .find_map(|n| n.pointer("/headRefName").and_then(Value::as_str));

        Ok(open_branch.or(any_branch).map(|s| s.to_string()))
    }

    async fn get_parent_issue(&self, repo: &str, ticket_id: u64) -> Result<Option<u64>, String> {
        let repo_ref = crate::types::parse_repo_ref(repo)?;

        let query = "query($owner: String!, $name: String!, $number: Int!) {\n\
                       repository(owner: $owner, name: $name) { issue(number: $number) {\n\
                         parent { number }\n\
                       } }\n\
                     }";

        let fields = vec![
            ("owner", repo_ref.owner.clone()),
            ("name", repo_ref.name.clone()),
            ("number", ticket_id.to_string()),
        ];
        let response = self.graphql(&repo_ref.hostname, query, &fields).await?;

        Ok(response
            .pointer("/data/repository/issue/parent/number")
            .and_then(Value::as_u64))
    }
}

// --- Mock ---

/// Scripted client for scheduler and state machine tests.
///
/// Responses are configured up front; every mutating call is recorded as a
/// `verb:detail` string so tests can assert on exactly what the engine did.
#[derive(Default)]
pub struct MockTicketClient {
    pub capabilities: TrackerCapabilities,
    items: Mutex<HashMap<String, Vec<TicketItem>>>,
    metadata: Mutex<HashMap<String, BoardMetadata>>,
    bodies: Mutex<HashMap<String, String>>,
    status_actors: Mutex<HashMap<String, String>>,
    label_actors: Mutex<HashMap<String, String>>,
    linked_pr_branches: Mutex<HashMap<String, String>>,
    parent_issues: Mutex<HashMap<String, u64>>,
    fetch_errors: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl Default for TrackerCapabilities {
    fn default() -> Self {
        Self::full()
    }
}

impl MockTicketClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: TrackerCapabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    pub fn set_items(&self, board_url: &str, items: Vec<TicketItem>) {
        self.items
            .lock()
            .unwrap()
            .insert(board_url.to_string(), items);
    }

    pub fn set_metadata(&self, board_url: &str, metadata: BoardMetadata) {
        self.metadata
            .lock()
            .unwrap()
            .insert(board_url.to_string(), metadata);
    }

    pub fn set_body(&self, repo: &str, ticket_id: u64, body: &str) {
        self.bodies
            .lock()
            .unwrap()
            .insert(registry_key(repo, ticket_id), body.to_string());
    }

    pub fn set_status_actor(&self, item_id: &str, login: &str) {
        self.status_actors
            .lock()
            .unwrap()
            .insert(item_id.to_string(), login.to_string());
    }

    pub fn set_label_actor(&self, repo: &str, ticket_id: u64, login: &str) {
        self.label_actors
            .lock()
            .unwrap()
            .insert(registry_key(repo, ticket_id), login.to_string());
    }

    pub fn set_linked_pr_branch(&self, repo: &str, ticket_id: u64, branch: &str) {
        self.linked_pr_branches
            .lock()
            .unwrap()
            .insert(registry_key(repo, ticket_id), branch.to_string());
    }

    pub fn set_parent_issue(&self, repo: &str, ticket_id: u64, parent: u64) {
        self.parent_issues
            .lock()
            .unwrap()
            .insert(registry_key(repo, ticket_id), parent);
    }

    /// Queue an error for the next `get_board_items` call. Errors are
    /// consumed in order; once drained, calls succeed again.
    pub fn push_fetch_error(&self, message: &str) {
        self.fetch_errors.lock().unwrap().push(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl TicketClient for MockTicketClient {
    fn capabilities(&self) -> TrackerCapabilities {
        self.capabilities
    }

    async fn get_board_items(&self, board_url: &str) -> Result<Vec<TicketItem>, String> {
        self.record(format!("get_board_items:{}", board_url));
        {
            let mut errors = self.fetch_errors.lock().unwrap();
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(board_url)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_board_metadata(&self, board_url: &str) -> Result<BoardMetadata, String> {
        self.record(format!("get_board_metadata:{}", board_url));
        Ok(self
            .metadata
            .lock()
            .unwrap()
            .get(board_url)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_item_status(
        &self,
        item_id: &str,
        status_name: &str,
        _hostname: &str,
    ) -> Result<(), String> {
        self.record(format!("update_status:{}:{}", item_id, status_name));
        Ok(())
    }

    async fn add_label(&self, repo: &str, ticket_id: u64, label: &str) -> Result<(), String> {
        self.record(format!("add_label:{}:{}", registry_key(repo, ticket_id), label));
        Ok(())
    }

    async fn remove_label(&self, repo: &str, ticket_id: u64, label: &str) -> Result<(), String> {
        self.record(format!(
            "remove_label:{}:{}",
            registry_key(repo, ticket_id),
            label
        ));
        Ok(())
    }

    async fn ensure_label_defined(&self, repo: &str, label: &LabelSpec) -> Result<(), String> {
        self.record(format!("ensure_label:{}:{}", repo, label.name));
        Ok(())
    }

    async fn get_last_status_actor(&self, item_id: &str) -> Result<Option<String>, String> {
        self.record(format!("get_status_actor:{}", item_id));
        Ok(self.status_actors.lock().unwrap().get(item_id).cloned())
    }

    async fn get_label_actor(
        &self,
        repo: &str,
        ticket_id: u64,
        _label_names: &[String],
    ) -> Result<Option<String>, String> {
        self.record(format!("get_label_actor:{}", registry_key(repo, ticket_id)));
        Ok(self
            .label_actors
            .lock()
            .unwrap()
            .get(&registry_key(repo, ticket_id))
            .cloned())
    }

    async fn get_ticket_labels(&self, repo: &str, ticket_id: u64) -> Result<Vec<String>, String> {
        self.record(format!("get_ticket_labels:{}", registry_key(repo, ticket_id)));
        Ok(vec![])
    }

    async fn get_ticket_body(&self, repo: &str, ticket_id: u64) -> Result<Option<String>, String> {
        self.record(format!("get_ticket_body:{}", registry_key(repo, ticket_id)));
        Ok(self
            .bodies
            .lock()
            .unwrap()
            .get(&registry_key(repo, ticket_id))
            .cloned())
    }

    async fn get_linked_pr_branch(
        &self,
        repo: &str,
        ticket_id: u64,
    ) -> Result<Option<String>, String> {
        self.record(format!("get_linked_pr:{}", registry_key(repo, ticket_id)));
        Ok(self
            .linked_pr_branches
            .lock()
            .unwrap()
            .get(&registry_key(repo, ticket_id))
            .cloned())
    }

    async fn get_parent_issue(&self, repo: &str, ticket_id: u64) -> Result<Option<u64>, String> {
        self.record(format!("get_parent_issue:{}", registry_key(repo, ticket_id)));
        Ok(self
            .parent_issues
            .lock()
            .unwrap()
            .get(&registry_key(repo, ticket_id))
            .copied())
    }
}
