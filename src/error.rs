/// Error enum for the seams where callers need to branch on error kind.
///
/// Categories:
/// - Workflow: agent subprocess outcomes; timeout is distinguished so the
///   scheduler can label and log it differently from a plain failure
/// - Tracker: board/label/status API failure
/// - Workspace: worktree allocation or validation failure
/// - Config: invalid or unloadable configuration
///
/// Most of the crate uses `Result<T, String>`; this enum covers the runner
/// boundary and converts into `String` at the seam.
#[derive(Debug, thiserror::Error)]
pub enum DroverError {
    // Workflow -- subprocess outcomes
    #[error("Workflow timed out after {minutes} minutes in stage {stage}")]
    WorkflowTimeout { stage: String, minutes: u64 },

    #[error("Workflow failed in stage {stage}: {detail}")]
    WorkflowFailed { stage: String, detail: String },

    #[error("Workflow interrupted by shutdown in stage {stage}")]
    WorkflowInterrupted { stage: String },

    // Tracker
    #[error("Tracker error: {0}")]
    Tracker(String),

    // Workspace
    #[error("Workspace error: {0}")]
    Workspace(String),

    // Config
    #[error("Config error: {0}")]
    Config(String),
}

impl DroverError {
    /// Returns true if the error is a workflow timeout, which the scheduler
    /// reports distinctly from other workflow failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DroverError::WorkflowTimeout { .. })
    }

    /// Returns true for workflow-level errors (timeout, failure, interrupt),
    /// which are reported per item and must never halt the poll loop.
    pub fn is_workflow(&self) -> bool {
        matches!(
            self,
            DroverError::WorkflowTimeout { .. }
                | DroverError::WorkflowFailed { .. }
                | DroverError::WorkflowInterrupted { .. }
        )
    }
}

/// Bridge: allows `?` to convert `DroverError` to `String` in code that
/// uses `Result<T, String>` (scheduler, workspace, main).
impl From<DroverError> for String {
    fn from(err: DroverError) -> String {
        err.to_string()
    }
}
