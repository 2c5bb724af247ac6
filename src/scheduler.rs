//! Poll/dispatch loop.
//!
//! Each tick reconciles finished workflow tasks, fetches every configured
//! board, screens items through the state machine, and dispatches eligible
//! work up to the concurrency ceiling. Tick failures are classified by the
//! hibernation controller and never escape the loop.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::alert::Alerter;
use crate::config::{DroverConfig, StatusesConfig};
use crate::error::DroverError;
use crate::hibernation::HibernationController;
use crate::registry::{RunningEntry, RunningRegistry};
use crate::runner::WorkflowRunner;
use crate::stage::{required_labels, Stage, FAILED_LABEL};
use crate::state_machine;
use crate::tracker::TicketClient;
use crate::types::{
    parse_repo_ref, ItemState, ResultCode, RunnerOutcome, StageResult, TicketItem, WorkflowContext,
};
use crate::worklog;
use crate::workspace::{self, Lineage};
use crate::{log_debug, log_info, log_warn};

/// Dedup key for the hibernation alert. One daemon, one outage, one page.
const HIBERNATION_DEDUP_KEY: &str = "drover-hibernation";

// --- Public types ---

/// Result of a scheduler run, returned to the caller for summary display.
#[derive(Debug)]
pub struct RunSummary {
    pub ticks: u64,
    pub workflows_dispatched: u32,
    pub workflows_completed: Vec<String>,
    pub workflows_failed: Vec<String>,
    pub halt_reason: HaltReason,
}

#[derive(Debug, PartialEq)]
pub enum HaltReason {
    ShutdownRequested,
    TickLimitReached,
}

/// Parameters for running the scheduler.
pub struct RunParams {
    /// Directory holding shared checkouts and per-item worktrees.
    pub workspace_root: PathBuf,
    /// Daemon state directory (result files, worklog).
    pub state_dir: PathBuf,
    /// Stop after this many ticks; `None` polls until shutdown.
    pub max_ticks: Option<u64>,
}

// --- Task payload ---

/// Carried back from a spawned workflow task for reconciliation.
struct CompletedWorkflow {
    key: String,
    repo: String,
    ticket_id: u64,
    item_id: String,
    title: String,
    stage: Stage,
    outcome: Result<RunnerOutcome, DroverError>,
}

// --- Per-run label tracking ---

/// Repositories whose required label set has been ensured this run.
///
/// Label definitions are repo-level and stable, so one successful pass per
/// repository per run is enough. A failed pass leaves the repo unmarked and
/// the next tick retries.
#[derive(Default)]
struct RepoLabelSet {
    ensured: HashSet<String>,
}

impl RepoLabelSet {
    fn needs_ensure(&self, repo: &str) -> bool {
        !self.ensured.contains(repo)
    }

    fn mark(&mut self, repo: &str) {
        self.ensured.insert(repo.to_string());
    }
}

// --- Main scheduling loop ---

/// Run the poll/dispatch loop until shutdown or the tick limit.
///
/// Workflows run as tasks in a `JoinSet`. The scheduler reconciles finished
/// tasks at the start of every tick and drains the set on every exit path,
/// so no path abandons a running subprocess.
pub async fn run_scheduler(
    client: &impl TicketClient,
    runner: Arc<impl WorkflowRunner + 'static>,
    alerter: &impl Alerter,
    config: DroverConfig,
    params: RunParams,
    cancel: CancellationToken,
) -> Result<RunSummary, String> {
    let registry = RunningRegistry::new();
    let mut join_set: JoinSet<CompletedWorkflow> = JoinSet::new();
    let mut hibernation = HibernationController::new();
    let mut label_set = RepoLabelSet::default();
    // Session IDs from completed stages, resumed by the next stage of the
    // same item so the agent keeps its context.
    let mut sessions: HashMap<String, String> = HashMap::new();
    let mut state = SchedulerState::default();
    let worklog_dir = params.state_dir.join("worklog");
    let routing_key = config.alerting.routing_key.clone().unwrap_or_default();

    log_info!(
        "Scheduler started ({} board(s), poll every {}s, max {} concurrent).",
        config.daemon.boards.len(),
        config.daemon.poll_interval_secs,
        config.daemon.max_concurrent_workflows
    );

    // Prime board metadata. Failures are not fatal here; the first tick
    // classifies a dead tracker properly.
    for board_url in &config.daemon.boards {
        match client.get_board_metadata(board_url).await {
            Ok(meta) => log_info!(
                "[{}] board ready ({} status columns)",
                board_url,
                meta.status_options.len()
            ),
            Err(e) => log_warn!("[{}] board metadata unavailable at startup: {}", board_url, e),
        }
    }

    loop {
        if cancel.is_cancelled() {
            drain_join_set(
                &mut join_set,
                &registry,
                client,
                &config.statuses,
                &worklog_dir,
                &mut sessions,
                &mut state,
            )
            .await;
            return Ok(build_summary(state, HaltReason::ShutdownRequested));
        }

        // Reconcile workflows that finished since the last tick.
        while let Some(result) = join_set.try_join_next() {
            match result {
                Ok(done) => {
                    reconcile_completion(
                        done,
                        &registry,
                        client,
                        &config.statuses,
                        &worklog_dir,
                        &mut sessions,
                        &mut state,
                    )
                    .await;
                }
                Err(e) => log_debug!("Workflow task join error: {}", e),
            }
        }

        let tick_result = run_tick(
            client,
            &runner,
            &config,
            &params,
            &registry,
            &mut label_set,
            &sessions,
            &mut join_set,
            &mut state,
        )
        .await;
        state.ticks_completed += 1;

        let interval = match tick_result {
            Ok(()) => {
                if let Some(outage) = hibernation.record_success() {
                    log_info!(
                        "Tracker reachable again; hibernation lasted {} minute(s).",
                        outage.num_minutes()
                    );
                    if let Err(e) = alerter.resolve(&routing_key, HIBERNATION_DEDUP_KEY).await {
                        log_warn!("Failed to resolve hibernation alert: {}", e);
                    }
                }
                Duration::from_secs(config.daemon.poll_interval_secs)
            }
            Err(e) => {
                let plan = hibernation.record_failure(&e);
                log_warn!(
                    "Tick failed ({} failure): {}. Retrying in {}s.",
                    plan.class,
                    e,
                    plan.interval.as_secs()
                );
                if plan.entered_hibernation {
                    if let Err(alert_err) = alerter
                        .trigger(
                            &routing_key,
                            HIBERNATION_DEDUP_KEY,
                            "drover: tracker unreachable, daemon hibernating",
                            &e,
                            &format!("Retrying every {}s", plan.interval.as_secs()),
                        )
                        .await
                    {
                        log_warn!("Failed to send hibernation alert: {}", alert_err);
                    }
                }
                plan.interval
            }
        };

        if let Some(max) = params.max_ticks {
            if state.ticks_completed >= max {
                log_info!("Tick limit ({}) reached.", max);
                drain_join_set(
                    &mut join_set,
                    &registry,
                    client,
                    &config.statuses,
                    &worklog_dir,
                    &mut sessions,
                    &mut state,
                )
                .await;
                return Ok(build_summary(state, HaltReason::TickLimitReached));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                log_info!("Shutdown requested.");
                drain_join_set(
                    &mut join_set,
                    &registry,
                    client,
                    &config.statuses,
                    &worklog_dir,
                    &mut sessions,
                    &mut state,
                )
                .await;
                return Ok(build_summary(state, HaltReason::ShutdownRequested));
            }
        }
    }
}

// --- Tick ---

/// One full poll: fetch every board, process every item.
///
/// Per-item failures are logged and skipped. Only a board fetch failure
/// fails the tick, since that is what signals an unreachable tracker.
#[allow(clippy::too_many_arguments)]
async fn run_tick(
    client: &impl TicketClient,
    runner: &Arc<impl WorkflowRunner + 'static>,
    config: &DroverConfig,
    params: &RunParams,
    registry: &RunningRegistry,
    label_set: &mut RepoLabelSet,
    sessions: &HashMap<String, String>,
    join_set: &mut JoinSet<CompletedWorkflow>,
    state: &mut SchedulerState,
) -> Result<(), String> {
    for board_url in &config.daemon.boards {
        let items = client.get_board_items(board_url).await?;
        log_debug!("[{}] {} item(s)", board_url, items.len());
        for item in &items {
            process_item(
                item, client, runner, config, params, registry, label_set, sessions, join_set,
                state,
            )
            .await;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_item(
    item: &TicketItem,
    client: &impl TicketClient,
    runner: &Arc<impl WorkflowRunner + 'static>,
    config: &DroverConfig,
    params: &RunParams,
    registry: &RunningRegistry,
    label_set: &mut RepoLabelSet,
    sessions: &HashMap<String, String>,
    join_set: &mut JoinSet<CompletedWorkflow>,
    state: &mut SchedulerState,
) {
    let key = item.registry_key();

    ensure_repo_labels(item, client, label_set).await;

    if item.state == ItemState::Closed {
        reclaim_closed_workspace(item, &key, registry, params);
        return;
    }

    if state_machine::needs_baseline_correction(item) {
        correct_to_baseline(item, &key, client, &config.statuses).await;
        return;
    }

    if !registry.has_capacity(config.daemon.max_concurrent_workflows) {
        log_debug!("{}: at concurrency ceiling; deferring", key);
        return;
    }

    let Some(stage) =
        state_machine::evaluate_item(item, registry, &config.daemon, &config.statuses, client)
            .await
    else {
        return;
    };

    if let Err(e) = dispatch_item(
        item, stage, client, runner, config, params, registry, sessions, join_set, state,
    )
    .await
    {
        log_warn!("{}: dispatch failed: {}", key, e);
    }
}

/// Ensure the fixed label contract exists on the item's repository, once per
/// repository per run.
async fn ensure_repo_labels(
    item: &TicketItem,
    client: &impl TicketClient,
    label_set: &mut RepoLabelSet,
) {
    if !label_set.needs_ensure(&item.repo) {
        return;
    }
    let mut all_ok = true;
    for spec in required_labels() {
        if let Err(e) = client.ensure_label_defined(&item.repo, &spec).await {
            log_warn!("{}: failed to ensure label '{}': {}", item.repo, spec.name, e);
            all_ok = false;
        }
    }
    if all_ok {
        label_set.mark(&item.repo);
        log_debug!("{}: required labels ensured", item.repo);
    }
}

/// A closed item with no live workflow releases its worktree.
fn reclaim_closed_workspace(
    item: &TicketItem,
    key: &str,
    registry: &RunningRegistry,
    params: &RunParams,
) {
    if registry.is_running(key) {
        return;
    }
    let repo_ref = match parse_repo_ref(&item.repo) {
        Ok(r) => r,
        Err(e) => {
            log_warn!("{}: {}", key, e);
            return;
        }
    };
    match workspace::cleanup_workspace(&params.workspace_root, &repo_ref, item.ticket_id) {
        Ok(true) => log_info!("{}: closed; workspace reclaimed", key),
        Ok(false) => {}
        Err(e) => log_warn!("{}: workspace cleanup failed: {}", key, e),
    }
}

/// An open item with no status gets moved to the baseline column so it
/// becomes visible to the stage mapping.
async fn correct_to_baseline(
    item: &TicketItem,
    key: &str,
    client: &impl TicketClient,
    statuses: &StatusesConfig,
) {
    let hostname = match parse_repo_ref(&item.repo) {
        Ok(r) => r.hostname,
        Err(e) => {
            log_warn!("{}: {}", key, e);
            return;
        }
    };
    match client
        .update_item_status(&item.item_id, &statuses.baseline, &hostname)
        .await
    {
        Ok(()) => log_info!("{}: no status set; corrected to '{}'", key, statuses.baseline),
        Err(e) => log_warn!("{}: baseline correction failed: {}", key, e),
    }
}

// --- Dispatch ---

/// Prepare an eligible item and spawn its workflow task.
///
/// Order matters: the registry entry is taken before the running label goes
/// up, and the label goes up before the subprocess starts, so a crash at any
/// point leaves either nothing or a stale label the next tick reclaims.
#[allow(clippy::too_many_arguments)]
async fn dispatch_item(
    item: &TicketItem,
    stage: Stage,
    client: &impl TicketClient,
    runner: &Arc<impl WorkflowRunner + 'static>,
    config: &DroverConfig,
    params: &RunParams,
    registry: &RunningRegistry,
    sessions: &HashMap<String, String>,
    join_set: &mut JoinSet<CompletedWorkflow>,
    state: &mut SchedulerState,
) -> Result<(), String> {
    let repo_ref = parse_repo_ref(&item.repo)?;
    let key = item.registry_key();

    let body = client.get_ticket_body(&item.repo, item.ticket_id).await?;
    let lineage = resolve_lineage(item, body.as_deref(), client).await;

    let workspace_path = workspace::ensure_workspace(
        &params.workspace_root,
        &repo_ref,
        item.ticket_id,
        lineage.parent_branch.as_deref(),
    )?;

    registry.register(
        &key,
        RunningEntry {
            stage,
            started_at: Utc::now(),
        },
        stage.running_label(),
    )?;

    if let Err(e) = client
        .add_label(&item.repo, item.ticket_id, stage.running_label())
        .await
    {
        registry.unregister(&key);
        return Err(format!("Failed to assert running label: {}", e));
    }

    let context = WorkflowContext {
        repo: item.repo.clone(),
        issue_number: item.ticket_id,
        issue_title: item.title.clone(),
        issue_body: body,
        workspace_path,
        allowed_username: config.daemon.self_identity.clone(),
        project_url: Some(item.board_url.clone()),
        parent_issue_number: lineage.parent_issue,
        parent_branch: lineage.parent_branch,
        comment_body: None,
        target_type: None,
    };

    log_info!("{}: dispatching {} workflow ('{}')", key, stage, item.title);
    if let Err(e) = worklog::write_entry(
        &params.state_dir.join("worklog"),
        &key,
        &item.title,
        &stage.to_string(),
        "Dispatched",
        "Workflow subprocess started",
    ) {
        log_warn!("{}: worklog write failed: {}", key, e);
    }

    state.workflows_dispatched += 1;

    let runner = Arc::clone(runner);
    let resume = sessions.get(&key).cloned();
    let mcp_config = config.runner.mcp_config.clone();
    let task_key = key;
    let repo = item.repo.clone();
    let ticket_id = item.ticket_id;
    let item_id = item.item_id.clone();
    let title = item.title.clone();

    join_set.spawn(async move {
        let outcome = runner
            .run(&context, stage, resume.as_deref(), mcp_config.as_deref())
            .await;
        CompletedWorkflow {
            key: task_key,
            repo,
            ticket_id,
            item_id,
            title,
            stage,
            outcome,
        }
    });

    Ok(())
}

/// Parent lineage for stacked work: explicit front matter first, then
/// tracker-detected ancestry where the tracker supports it. Lineage is
/// advisory; a failed lookup resolves to no lineage rather than blocking
/// dispatch.
async fn resolve_lineage(
    item: &TicketItem,
    body: Option<&str>,
    client: &impl TicketClient,
) -> Lineage {
    let mut lineage = body
        .and_then(workspace::parse_front_matter_lineage)
        .unwrap_or_default();

    if lineage.parent_issue.is_none() && client.capabilities().supports_sub_issues {
        match client.get_parent_issue(&item.repo, item.ticket_id).await {
            Ok(parent) => lineage.parent_issue = parent,
            Err(e) => log_debug!(
                "{}#{}: parent issue lookup failed: {}",
                item.repo,
                item.ticket_id,
                e
            ),
        }
    }

    if lineage.parent_branch.is_none() {
        if let Some(parent) = lineage.parent_issue {
            // The branch the parent's work landed on: its linked PR head if
            // the tracker can say, else the parent's own work branch.
            let pr_branch = if client.capabilities().supports_linked_prs {
                client
                    .get_linked_pr_branch(&item.repo, parent)
                    .await
                    .ok()
                    .flatten()
            } else {
                None
            };
            lineage.parent_branch =
                Some(pr_branch.unwrap_or_else(|| workspace::work_branch(parent)));
        }
    }

    lineage
}

// --- Completion handling ---

/// Write a finished workflow back to the tracker.
///
/// The registry entry is released first so the slot frees even if the
/// tracker is down; label and status writes are best-effort and the stale
/// label rule covers anything left behind.
async fn reconcile_completion(
    done: CompletedWorkflow,
    registry: &RunningRegistry,
    client: &impl TicketClient,
    statuses: &StatusesConfig,
    worklog_dir: &Path,
    sessions: &mut HashMap<String, String>,
    state: &mut SchedulerState,
) {
    let CompletedWorkflow {
        key,
        repo,
        ticket_id,
        item_id,
        title,
        stage,
        outcome,
    } = done;

    let running_label = match registry.unregister(&key) {
        Some((_, label)) => label,
        None => stage.running_label().to_string(),
    };

    if let Err(e) = client.remove_label(&repo, ticket_id, &running_label).await {
        log_warn!(
            "{}: failed to remove running label '{}': {}",
            key,
            running_label,
            e
        );
    }

    let (outcome_name, detail) = match outcome {
        Ok(run) => {
            let StageResult {
                result,
                summary,
                session_id,
                ..
            } = run.response;
            match result {
                ResultCode::Completed => {
                    log_info!(
                        "{}: {} workflow completed in {}s: {}",
                        key,
                        stage,
                        run.metrics.duration_secs,
                        summary
                    );
                    if let Some(session) = session_id {
                        sessions.insert(key.clone(), session);
                    }
                    match stage.complete_label() {
                        Some(label) => {
                            if let Err(e) = client.add_label(&repo, ticket_id, label).await {
                                log_warn!("{}: failed to add '{}': {}", key, label, e);
                            }
                        }
                        None => {
                            // Validate has no completion label; success moves
                            // the item to the done column.
                            let hostname = parse_repo_ref(&repo)
                                .map(|r| r.hostname)
                                .unwrap_or_default();
                            match client
                                .update_item_status(&item_id, &statuses.done, &hostname)
                                .await
                            {
                                Ok(()) => {
                                    log_info!("{}: validated; promoted to '{}'", key, statuses.done)
                                }
                                Err(e) => log_warn!(
                                    "{}: failed to promote to '{}': {}",
                                    key,
                                    statuses.done,
                                    e
                                ),
                            }
                            sessions.remove(&key);
                        }
                    }
                    state.workflows_completed.push(format!("{} ({})", key, stage));
                    ("Complete".to_string(), summary)
                }
                ResultCode::Failed => {
                    log_warn!("{}: {} workflow reported failure: {}", key, stage, summary);
                    mark_failed(&key, &repo, ticket_id, client).await;
                    sessions.remove(&key);
                    state.workflows_failed.push(format!("{} ({})", key, stage));
                    ("Failed".to_string(), summary)
                }
            }
        }
        Err(DroverError::WorkflowInterrupted { .. }) => {
            // Shutdown cut this run short; the item keeps its state and is
            // re-evaluated on the next run.
            log_info!("{}: {} workflow interrupted by shutdown", key, stage);
            sessions.remove(&key);
            ("Interrupted".to_string(), "Shutdown requested".to_string())
        }
        Err(e) => {
            if e.is_timeout() {
                log_warn!("{}: {} workflow timed out: {}", key, stage, e);
            } else {
                log_warn!("{}: {} workflow failed: {}", key, stage, e);
            }
            mark_failed(&key, &repo, ticket_id, client).await;
            sessions.remove(&key);
            state.workflows_failed.push(format!("{} ({})", key, stage));
            let name = if e.is_timeout() { "Timed out" } else { "Failed" };
            (name.to_string(), e.to_string())
        }
    };

    if let Err(e) = worklog::write_entry(
        worklog_dir,
        &key,
        &title,
        &stage.to_string(),
        &outcome_name,
        &detail,
    ) {
        log_warn!("{}: worklog write failed: {}", key, e);
    }
}

async fn mark_failed(key: &str, repo: &str, ticket_id: u64, client: &impl TicketClient) {
    if let Err(e) = client.add_label(repo, ticket_id, FAILED_LABEL).await {
        log_warn!("{}: failed to add '{}': {}", key, FAILED_LABEL, e);
    }
}

// --- Drain helper ---

/// Await every in-flight workflow and reconcile it. Used on the exit paths;
/// each workflow's own timeout bounds the wait.
async fn drain_join_set(
    join_set: &mut JoinSet<CompletedWorkflow>,
    registry: &RunningRegistry,
    client: &impl TicketClient,
    statuses: &StatusesConfig,
    worklog_dir: &Path,
    sessions: &mut HashMap<String, String>,
    state: &mut SchedulerState,
) {
    let active = registry.active_keys();
    if !active.is_empty() {
        log_info!("Waiting for in-flight workflow(s): {}", active.join(", "));
    }
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(done) => {
                reconcile_completion(done, registry, client, statuses, worklog_dir, sessions, state)
                    .await;
            }
            Err(e) => {
                log_debug!("Workflow task join error during drain: {}", e);
            }
        }
    }
}

// --- Internal state ---

#[derive(Default)]
struct SchedulerState {
    ticks_completed: u64,
    workflows_dispatched: u32,
    workflows_completed: Vec<String>,
    workflows_failed: Vec<String>,
}

fn build_summary(mut state: SchedulerState, halt_reason: HaltReason) -> RunSummary {
    state.workflows_failed.sort();
    state.workflows_failed.dedup();
    RunSummary {
        ticks: state.ticks_completed,
        workflows_dispatched: state.workflows_dispatched,
        workflows_completed: state.workflows_completed,
        workflows_failed: state.workflows_failed,
        halt_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_summary_deduplicates_failures() {
        let state = SchedulerState {
            ticks_completed: 3,
            workflows_dispatched: 4,
            workflows_completed: vec!["github.com/acme/api#2 (research)".to_string()],
            workflows_failed: vec![
                "github.com/acme/api#9 (plan)".to_string(),
                "github.com/acme/api#1 (research)".to_string(),
                "github.com/acme/api#9 (plan)".to_string(),
            ],
        };

        let summary = build_summary(state, HaltReason::TickLimitReached);

        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.workflows_dispatched, 4);
        assert_eq!(
            summary.workflows_failed,
            vec![
                "github.com/acme/api#1 (research)".to_string(),
                "github.com/acme/api#9 (plan)".to_string(),
            ]
        );
        assert_eq!(summary.halt_reason, HaltReason::TickLimitReached);
    }

    #[test]
    fn test_repo_label_set_marks_once() {
        let mut set = RepoLabelSet::default();
        assert!(set.needs_ensure("github.com/acme/api"));

        set.mark("github.com/acme/api");
        assert!(!set.needs_ensure("github.com/acme/api"));
        assert!(set.needs_ensure("github.com/acme/web"));
    }
}
