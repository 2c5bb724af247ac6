//! Workflow subprocess management.
//!
//! Owns the shutdown flag and signal handlers, the process-group registry
//! used for straggler cleanup, and the `WorkflowRunner` seam the scheduler
//! dispatches through. Agent subprocesses run in their own process groups so
//! a timeout or final cleanup can kill the whole tree, not just the leader.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;

use crate::config::RunnerConfig;
use crate::error::DroverError;
use crate::prompt::{self, PromptParams};
use crate::stage::Stage;
use crate::types::{parse_repo_ref, RepoRef, RunnerMetrics, RunnerOutcome, StageResult, WorkflowContext};
use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at daemon startup. Subsequent calls are safe (re-registers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Process group registry ---

/// Global registry of active child process group IDs.
///
/// Uses `std::sync::Mutex` (not tokio's) because operations are fast
/// (insert/remove/iterate) with no I/O under the lock.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Kill all registered child process groups.
///
/// Sends SIGTERM to every registered PGID, waits out the grace period, then
/// SIGKILLs survivors. Called once at the end of `run`, after the scheduler
/// has already waited for in-flight workflows; anything still alive here is
/// a straggler.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

// --- Runner seam ---

/// Trait for running stage workflows. Enables mocking in scheduler tests.
pub trait WorkflowRunner: Send + Sync {
    fn run(
        &self,
        context: &WorkflowContext,
        stage: Stage,
        resume_session: Option<&str>,
        mcp_config: Option<&Path>,
    ) -> impl std::future::Future<Output = Result<RunnerOutcome, DroverError>> + Send;
}

/// Where the agent writes its structured result for one (item, stage) run.
pub fn result_file_path(state_dir: &Path, repo: &RepoRef, ticket_id: u64, stage: Stage) -> PathBuf {
    state_dir
        .join("results")
        .join(format!("{}-issue-{}-{}.json", repo.identifier(), ticket_id, stage))
}

/// Real implementation that spawns the agent CLI as a subprocess.
pub struct CliWorkflowRunner {
    cli_path: String,
    timeout: Duration,
    state_dir: PathBuf,
}

impl CliWorkflowRunner {
    pub fn new(config: &RunnerConfig, state_dir: PathBuf) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            timeout: Duration::from_secs(config.workflow_timeout_minutes * 60),
            state_dir,
        }
    }

    /// Verify that the configured agent CLI is available on PATH.
    pub fn verify_cli_available(&self) -> Result<(), String> {
        let output = std::process::Command::new(&self.cli_path)
            .arg("--version")
            .output()
            .map_err(|e| format!("Agent CLI '{}' not found on PATH ({})", self.cli_path, e))?;

        if !output.status.success() {
            return Err(format!(
                "Agent CLI found but `{} --version` failed",
                self.cli_path
            ));
        }

        Ok(())
    }
}

/// Invocation arguments for the agent CLI. The prompt goes last as the `-p`
/// payload; session resume and MCP wiring are optional flags before it.
fn build_cli_args(
    prompt: &str,
    resume_session: Option<&str>,
    mcp_config: Option<&Path>,
) -> Vec<String> {
    let mut args = vec!["--dangerously-skip-permissions".to_string()];
    if let Some(mcp) = mcp_config {
        args.push("--mcp-config".to_string());
        args.push(mcp.display().to_string());
    }
    if let Some(session) = resume_session {
        args.push("--resume".to_string());
        args.push(session.to_string());
    }
    args.push("-p".to_string());
    args.push(prompt.to_string());
    args
}

impl WorkflowRunner for CliWorkflowRunner {
    async fn run(
        &self,
        context: &WorkflowContext,
        stage: Stage,
        resume_session: Option<&str>,
        mcp_config: Option<&Path>,
    ) -> Result<RunnerOutcome, DroverError> {
        let repo = parse_repo_ref(&context.repo).map_err(|e| DroverError::WorkflowFailed {
            stage: stage.to_string(),
            detail: e,
        })?;
        let result_path = result_file_path(&self.state_dir, &repo, context.issue_number, stage);
        if let Some(parent) = result_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DroverError::WorkflowFailed {
                    stage: stage.to_string(),
                    detail: format!("Failed to create {}: {}", parent.display(), e),
                })?;
        }

        let prompt = prompt::build_prompt(&PromptParams {
            stage,
            context,
            result_path: &result_path,
        });

        let mut cmd = tokio::process::Command::new(&self.cli_path);
        cmd.args(build_cli_args(&prompt, resume_session, mcp_config));
        cmd.current_dir(&context.workspace_path);

        run_subprocess_workflow(cmd, &result_path, self.timeout, stage).await
    }
}

/// Spawn a workflow subprocess, enforce the timeout, read the result file.
///
/// The caller configures the `Command` (program, args, cwd); this function
/// handles process group isolation, timeout, shutdown checking, and result
/// parsing. Shared by `CliWorkflowRunner` and subprocess tests.
pub async fn run_subprocess_workflow(
    mut cmd: tokio::process::Command,
    result_path: &Path,
    timeout: Duration,
    stage: Stage,
) -> Result<RunnerOutcome, DroverError> {
    let fail = |detail: String| DroverError::WorkflowFailed {
        stage: stage.to_string(),
        detail,
    };

    // Delete stale result file if it exists (unconditional to avoid TOCTOU)
    match tokio::fs::remove_file(result_path).await {
        Ok(()) => log_warn!(
            "Stale result file found at {}, deleted",
            result_path.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(fail(format!(
                "Failed to remove stale result file {}: {}",
                result_path.display(),
                e
            )))
        }
    }

    // stdin MUST be null — with setpgid the child is in a background process
    // group, and any attempt to read from the terminal would cause SIGTTIN
    // (silent stop).
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::inherit());
    cmd.stderr(std::process::Stdio::inherit());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only
    // async-signal-safe functions are permitted. setpgid is async-signal-safe
    // per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[{}] Spawning workflow subprocess...", stage);
    let started = std::time::Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| fail(format!("Failed to spawn workflow subprocess: {}", e)))?;

    let child_pid = child
        .id()
        .ok_or_else(|| fail("Failed to get child PID".to_string()))? as i32;
    let pgid = Pid::from_raw(child_pid);
    log_debug!("[{}] Subprocess spawned (pid={})", stage, child_pid);

    register_child(pgid);

    log_debug!("[{}] Waiting (timeout={}s)...", stage, timeout.as_secs());
    match tokio::time::timeout(timeout, child.wait()).await {
        Err(_) => {
            // Timeout — kill the whole process group
            log_debug!(
                "[{}] TIMEOUT after {}s — killing process group",
                stage,
                timeout.as_secs()
            );
            kill_process_group(child_pid).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            Err(DroverError::WorkflowTimeout {
                stage: stage.to_string(),
                minutes: timeout.as_secs() / 60,
            })
        }
        Ok(Err(e)) => {
            unregister_child(pgid);
            Err(fail(format!("Error waiting for workflow subprocess: {}", e)))
        }
        Ok(Ok(exit_status)) => {
            log_debug!("[{}] Subprocess exited (status={:?})", stage, exit_status.code());
            unregister_child(pgid);

            if is_shutdown_requested() {
                kill_process_group(child_pid).await;
                let _ = child.wait().await;
                return Err(DroverError::WorkflowInterrupted {
                    stage: stage.to_string(),
                });
            }

            let metrics = RunnerMetrics {
                duration_secs: started.elapsed().as_secs(),
                exit_code: exit_status.code(),
            };

            let stage_result = read_result_file(result_path).await;
            match (exit_status.success(), stage_result) {
                (true, Ok(result)) => {
                    validate_result_stage(&result, stage).map_err(&fail)?;
                    cleanup_result_file(result_path).await;
                    Ok(RunnerOutcome {
                        response: result,
                        metrics,
                    })
                }
                (false, Ok(result)) => {
                    log_warn!("Workflow exited with non-zero status but produced a valid result");
                    validate_result_stage(&result, stage).map_err(&fail)?;
                    cleanup_result_file(result_path).await;
                    Ok(RunnerOutcome {
                        response: result,
                        metrics,
                    })
                }
                (_, Err(e)) => {
                    let exit_info = if exit_status.success() {
                        "zero exit".to_string()
                    } else {
                        format!("exit code {:?}", exit_status.code())
                    };
                    Err(fail(format!("Workflow failed ({}): {}", exit_info, e)))
                }
            }
        }
    }
}

/// A result file claiming a different stage belongs to some other run; using
/// it would promote the wrong stage.
fn validate_result_stage(result: &StageResult, stage: Stage) -> Result<(), String> {
    let expected = stage.to_string();
    if result.stage != expected {
        return Err(format!(
            "Result file stage mismatch: expected '{}', got '{}'",
            expected, result.stage
        ));
    }
    Ok(())
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL.
///
/// The blocking poll-and-sleep loop runs on the tokio blocking thread pool
/// via `spawn_blocking` to avoid stalling async worker threads.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return; // already gone
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            // Signal 0 checks existence without delivering anything
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

/// Read and parse a stage result JSON file.
pub async fn read_result_file(path: &Path) -> Result<StageResult, String> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            format!("Result file not found: {}", path.display())
        } else {
            format!("Failed to read result file {}: {}", path.display(), e)
        }
    })?;

    let result: StageResult = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse result JSON from {}: {}", path.display(), e))?;

    Ok(result)
}

/// Delete a result file after a successful read.
async fn cleanup_result_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        log_warn!(
            "Failed to clean up result file {}: {}",
            path.display(),
            e
        );
    }
}

// --- Mock runner ---

/// Mock workflow runner for scheduler tests.
///
/// Returns predefined outcomes from a configurable sequence and records
/// every invocation as `"{repo}#{ticket}:{stage}"`, with ` resume={id}`
/// appended when a session is resumed.
pub struct MockWorkflowRunner {
    results: tokio::sync::Mutex<Vec<Result<RunnerOutcome, DroverError>>>,
    calls: std::sync::Mutex<Vec<String>>,
}

impl MockWorkflowRunner {
    /// Create a mock with a sequence of results to return, first call first.
    pub fn new(results: Vec<Result<RunnerOutcome, DroverError>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: tokio::sync::Mutex::new(reversed),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A completed outcome for `stage` with the given summary.
    pub fn completed(stage: Stage, summary: &str) -> RunnerOutcome {
        RunnerOutcome {
            response: StageResult {
                stage: stage.to_string(),
                result: crate::types::ResultCode::Completed,
                summary: summary.to_string(),
                session_id: None,
            },
            metrics: RunnerMetrics::default(),
        }
    }

    /// A completed outcome whose result code reports failure.
    pub fn reported_failure(stage: Stage, summary: &str) -> RunnerOutcome {
        RunnerOutcome {
            response: StageResult {
                stage: stage.to_string(),
                result: crate::types::ResultCode::Failed,
                summary: summary.to_string(),
                session_id: None,
            },
            metrics: RunnerMetrics::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl WorkflowRunner for MockWorkflowRunner {
    async fn run(
        &self,
        context: &WorkflowContext,
        stage: Stage,
        resume_session: Option<&str>,
        _mcp_config: Option<&Path>,
    ) -> Result<RunnerOutcome, DroverError> {
        let mut call = format!("{}#{}:{}", context.repo, context.issue_number, stage);
        if let Some(session) = resume_session {
            call.push_str(&format!(" resume={}", session));
        }
        self.calls.lock().unwrap().push(call);
        let mut results = self.results.lock().await;
        results.pop().unwrap_or_else(|| {
            Err(DroverError::WorkflowFailed {
                stage: stage.to_string(),
                detail: "MockWorkflowRunner: no more results in sequence".to_string(),
            })
        })
    }
}

/// Set the shutdown flag for testing. Only available in test builds.
// Relaxed is safe: .await on subprocess wait() ensures visibility before flag check
#[cfg(test)]
pub(crate) fn set_shutdown_flag_for_testing(value: bool) {
    shutdown_flag().store(value, Ordering::Relaxed);
}
