//! Per-stage prompt construction.
//!
//! Kept separate from dispatch decisions: the state machine picks the stage,
//! this module renders the agent's instructions for it.

use std::path::Path;

use crate::stage::Stage;
use crate::types::WorkflowContext;

/// Parameters for building a stage workflow prompt.
pub struct PromptParams<'a> {
    pub stage: Stage,
    pub context: &'a WorkflowContext,
    /// Where the agent must write its structured result.
    pub result_path: &'a Path,
}

/// Build a full prompt for one stage of the issue workflow.
///
/// Structure: [Autonomous Preamble] + [Stage Instructions] + [Structured
/// Output Suffix]. The preamble carries the issue and workspace context; the
/// suffix instructs the agent to write a JSON result file the runner parses.
pub fn build_prompt(params: &PromptParams) -> String {
    [
        build_preamble(params.context),
        build_stage_instructions(params.stage, params.context),
        build_output_suffix(params.stage, params.result_path),
    ]
    .join("\n\n")
}

fn stage_title(stage: Stage) -> &'static str {
    match stage {
        Stage::Research => "Research",
        Stage::Plan => "Plan",
        Stage::Implement => "Implement",
        Stage::Validate => "Validate",
    }
}

/// Build the preamble: autonomous framing, issue identity, workspace, and
/// any optional context (body, lineage, triggering comment).
fn build_preamble(context: &WorkflowContext) -> String {
    let mut preamble = format!(
        "# Autonomous Workflow Agent\n\n\
        You are running autonomously as one stage of an issue workflow.\n\
        No human is available for questions — use your judgment, and record any\n\
        assumptions you make in the artifacts you produce.\n\n\
        ## Issue\n\n\
        - **Repository:** {repo}\n\
        - **Issue:** #{number}\n\
        - **Title:** {title}",
        repo = context.repo,
        number = context.issue_number,
        title = context.issue_title,
    );

    if let Some(ref url) = context.project_url {
        preamble.push_str(&format!("\n- **Project board:** {}", url));
    }

    if let Some(parent) = context.parent_issue_number {
        preamble.push_str(&format!("\n- **Parent issue:** #{}", parent));
    }
    if let Some(ref branch) = context.parent_branch {
        preamble.push_str(&format!("\n- **Parent branch:** `{}`", branch));
    }

    preamble.push_str(&format!(
        "\n\n## Workspace\n\n\
        Your working directory is `{path}`, a dedicated git worktree on branch\n\
        `issue-{number}`. Make all file changes there and commit them on that branch.\n\
        Do not switch branches or touch other worktrees.",
        path = context.workspace_path.display(),
        number = context.issue_number,
    ));

    if let Some(ref body) = context.issue_body {
        if !body.trim().is_empty() {
            preamble.push_str(&format!("\n\n## Issue Body\n\n{}", body.trim()));
        }
    }

    if let Some(ref comment) = context.comment_body {
        let target = context.target_type.as_deref().unwrap_or("comment");
        preamble.push_str(&format!(
            "\n\n## Triggering {target}\n\n\
            This run was requested by the following {target}:\n\n{comment}",
            target = target,
            comment = comment,
        ));
    }

    preamble
}

fn build_stage_instructions(stage: Stage, context: &WorkflowContext) -> String {
    let n = context.issue_number;
    match stage {
        Stage::Research => format!(
            "## Task: Research\n\n\
            Investigate the issue before any code is written:\n\n\
            1. **Understand the request** — read the issue title and body closely and\n\
               restate the problem in your own words.\n\
            2. **Explore the codebase** in the workspace: find the components involved,\n\
               existing patterns for similar changes, and the tests covering the area.\n\
            3. **Identify constraints and risks** — interfaces that must not break,\n\
               behavior that must be preserved, open questions you had to resolve\n\
               yourself.\n\
            4. **Write your findings** to `docs/issues/issue-{n}-research.md` in the\n\
               workspace and commit the file on the work branch.\n\n\
            Do not modify any production code during this stage.",
            n = n,
        ),
        Stage::Plan => format!(
            "## Task: Plan\n\n\
            Turn the research into a concrete implementation plan:\n\n\
            1. **Read the research document** at `docs/issues/issue-{n}-research.md`\n\
               (if it exists) and the issue itself.\n\
            2. **Design the change** — which files change, what new code is added,\n\
               how the pieces fit the codebase's existing structure.\n\
            3. **Plan the verification** — which tests to add or extend, and how to\n\
               demonstrate the change works.\n\
            4. **Write the plan** to `docs/issues/issue-{n}-plan.md` as an ordered\n\
               list of steps, and commit the file on the work branch.\n\n\
            Do not modify any production code during this stage.",
            n = n,
        ),
        Stage::Implement => format!(
            "## Task: Implement\n\n\
            Carry out the planned change:\n\n\
            1. **Read the plan** at `docs/issues/issue-{n}-plan.md` (if it exists)\n\
               and follow it step by step, adjusting where reality disagrees with it.\n\
            2. **Make the code changes** in the workspace, keeping commits small and\n\
               each commit message descriptive.\n\
            3. **Add or extend tests** covering the new behavior, per the plan.\n\
            4. **Run the project's build and test commands** and fix what breaks\n\
               before finishing.\n\n\
            Leave the work branch in a state where all commits are made and the\n\
            tree is clean.",
            n = n,
        ),
        Stage::Validate => format!(
            "## Task: Validate\n\n\
            Verify the implementation on branch `issue-{n}`:\n\n\
            1. **Review the diff** against the default branch and check it matches\n\
               the plan at `docs/issues/issue-{n}-plan.md` (if it exists) and the\n\
               issue's intent.\n\
            2. **Run the full build and test suite** and confirm everything passes.\n\
            3. **Probe the edges** — exercise boundary conditions the tests might\n\
               miss, and add tests for any gap you find.\n\
            4. **Fix small problems directly**; report anything larger as a failed\n\
               result with a clear summary.\n\n\
            A completed validation means the branch is ready for human review.",
            n = n,
        ),
    }
}

/// Build the structured output suffix instructing the agent to write a JSON
/// result file.
fn build_output_suffix(stage: Stage, result_path: &Path) -> String {
    format!(
        "## Structured Output\n\n\
        When you are finished, write a JSON result file to:\n\n\
        ```\n{result_path}\n```\n\n\
        The file must contain valid JSON matching this schema:\n\n\
        ```json\n\
        {{\n\
        \x20 \"stage\": \"{stage}\",\n\
        \x20 \"result\": \"completed | failed\",\n\
        \x20 \"summary\": \"Brief description of what was accomplished\",\n\
        \x20 \"session_id\": \"Your session identifier, if one is available (optional)\"\n\
        }}\n\
        ```\n\n\
        **Result codes:**\n\
        - `completed` — The {title} stage finished; `summary` says what was produced.\n\
        - `failed` — The stage could not be completed. Explain why in `summary`.\n\n\
        **Important:**\n\
        - Set `stage` to exactly `\"{stage}\"`.\n\
        - The JSON must be valid — do not include comments or trailing commas.",
        result_path = result_path.display(),
        stage = stage,
        title = stage_title(stage),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn context() -> WorkflowContext {
        WorkflowContext {
            repo: "github.com/acme/widgets".to_string(),
            issue_number: 42,
            issue_title: "Add widget cache".to_string(),
            issue_body: Some("Widgets are recomputed on every request.".to_string()),
            workspace_path: PathBuf::from("/work/acme_widgets-issue-42"),
            allowed_username: Some("drover-bot".to_string()),
            project_url: Some("https://github.com/orgs/acme/projects/7".to_string()),
            parent_issue_number: None,
            parent_branch: None,
            comment_body: None,
            target_type: None,
        }
    }

    #[test]
    fn prompt_has_preamble_task_and_output_sections() {
        let ctx = context();
        let prompt = build_prompt(&PromptParams {
            stage: Stage::Research,
            context: &ctx,
            result_path: Path::new("/state/results/r.json"),
        });

        assert!(prompt.starts_with("# Autonomous Workflow Agent"));
        assert!(prompt.contains("## Task: Research"));
        assert!(prompt.contains("## Structured Output"));
        assert!(prompt.contains("/state/results/r.json"));
        assert!(prompt.contains("\"stage\": \"research\""));
    }

    #[test]
    fn preamble_carries_issue_and_workspace_context() {
        let ctx = context();
        let prompt = build_prompt(&PromptParams {
            stage: Stage::Plan,
            context: &ctx,
            result_path: Path::new("/tmp/r.json"),
        });

        assert!(prompt.contains("- **Repository:** github.com/acme/widgets"));
        assert!(prompt.contains("- **Issue:** #42"));
        assert!(prompt.contains("- **Title:** Add widget cache"));
        assert!(prompt.contains("`/work/acme_widgets-issue-42`"));
        assert!(prompt.contains("`issue-42`"));
        assert!(prompt.contains("Widgets are recomputed on every request."));
    }

    #[test]
    fn lineage_rendered_when_present() {
        let mut ctx = context();
        ctx.parent_issue_number = Some(7);
        ctx.parent_branch = Some("issue-7".to_string());
        let prompt = build_prompt(&PromptParams {
            stage: Stage::Implement,
            context: &ctx,
            result_path: Path::new("/tmp/r.json"),
        });

        assert!(prompt.contains("- **Parent issue:** #7"));
        assert!(prompt.contains("- **Parent branch:** `issue-7`"));
    }

    #[test]
    fn lineage_omitted_when_absent() {
        let ctx = context();
        let prompt = build_prompt(&PromptParams {
            stage: Stage::Implement,
            context: &ctx,
            result_path: Path::new("/tmp/r.json"),
        });

        assert!(!prompt.contains("Parent issue"));
        assert!(!prompt.contains("Parent branch"));
    }

    #[test]
    fn comment_section_rendered_when_present() {
        let mut ctx = context();
        ctx.comment_body = Some("Please also handle the empty-cache case.".to_string());
        ctx.target_type = Some("review comment".to_string());
        let prompt = build_prompt(&PromptParams {
            stage: Stage::Implement,
            context: &ctx,
            result_path: Path::new("/tmp/r.json"),
        });

        assert!(prompt.contains("## Triggering review comment"));
        assert!(prompt.contains("Please also handle the empty-cache case."));
    }

    #[test]
    fn validate_prompt_references_work_branch() {
        let ctx = context();
        let prompt = build_prompt(&PromptParams {
            stage: Stage::Validate,
            context: &ctx,
            result_path: Path::new("/tmp/r.json"),
        });

        assert!(prompt.contains("## Task: Validate"));
        assert!(prompt.contains("branch `issue-42`"));
        assert!(prompt.contains("\"stage\": \"validate\""));
    }

    #[test]
    fn stage_documents_chain_across_prompts() {
        let ctx = context();
        let prompt_for = |stage| {
            build_prompt(&PromptParams {
                stage,
                context: &ctx,
                result_path: Path::new("/tmp/r.json"),
            })
        };

        // Research writes the document plan reads; plan writes the document
        // implement and validate read.
        assert!(prompt_for(Stage::Research).contains("`docs/issues/issue-42-research.md`"));
        let plan = prompt_for(Stage::Plan);
        assert!(plan.contains("`docs/issues/issue-42-research.md`"));
        assert!(plan.contains("`docs/issues/issue-42-plan.md`"));
        assert!(prompt_for(Stage::Implement).contains("`docs/issues/issue-42-plan.md`"));
        assert!(prompt_for(Stage::Validate).contains("`docs/issues/issue-42-plan.md`"));
    }

    #[test]
    fn analysis_stages_forbid_code_changes() {
        let ctx = context();
        let prompt_for = |stage| {
            build_prompt(&PromptParams {
                stage,
                context: &ctx,
                result_path: Path::new("/tmp/r.json"),
            })
        };

        let prohibition = "Do not modify any production code";
        assert!(prompt_for(Stage::Research).contains(prohibition));
        assert!(prompt_for(Stage::Plan).contains(prohibition));
        assert!(!prompt_for(Stage::Implement).contains(prohibition));
        assert!(!prompt_for(Stage::Validate).contains(prohibition));
    }

    #[test]
    fn blank_issue_body_omitted() {
        let mut ctx = context();
        ctx.issue_body = Some("   \n  ".to_string());
        let prompt = build_prompt(&PromptParams {
            stage: Stage::Research,
            context: &ctx,
            result_path: Path::new("/tmp/r.json"),
        });

        assert!(!prompt.contains("## Issue Body"));
    }

    #[test]
    fn board_url_omitted_when_unset() {
        let mut ctx = context();
        ctx.project_url = None;
        let prompt = build_prompt(&PromptParams {
            stage: Stage::Research,
            context: &ctx,
            result_path: Path::new("/tmp/r.json"),
        });

        assert!(!prompt.contains("Project board"));
    }
}
