use serde::{Deserialize, Serialize};

use crate::config::StatusesConfig;

/// Label applied to an item whose most recent workflow ended in failure or
/// timeout. Shared across stages; removed manually by an operator.
pub const FAILED_LABEL: &str = "workflow-failed";

/// One step of the development workflow, bound to a watched board column.
///
/// The running/complete label names are a fixed contract: boards may rename
/// their columns (configured in `[statuses]`), but label semantics survive
/// renames because labels live on the issue, not the board.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Research,
    Plan,
    Implement,
    Validate,
}

impl Stage {
    pub fn all() -> [Stage; 4] {
        [Stage::Research, Stage::Plan, Stage::Implement, Stage::Validate]
    }

    /// Label asserted while this stage's workflow subprocess is alive.
    pub fn running_label(&self) -> &'static str {
        match self {
            Stage::Research => "researching",
            Stage::Plan => "planning",
            Stage::Implement => "implementing",
            Stage::Validate => "validating",
        }
    }

    /// Label marking this stage finished, awaiting manual promotion to the
    /// next column. Validate has none: its success promotes the item to the
    /// done column directly.
    pub fn complete_label(&self) -> Option<&'static str> {
        match self {
            Stage::Research => Some("research-complete"),
            Stage::Plan => Some("plan-complete"),
            Stage::Implement => Some("implement-complete"),
            Stage::Validate => None,
        }
    }

    /// Board column name for this stage under the given configuration.
    pub fn status_name<'a>(&self, statuses: &'a StatusesConfig) -> &'a str {
        match self {
            Stage::Research => &statuses.research,
            Stage::Plan => &statuses.plan,
            Stage::Implement => &statuses.implement,
            Stage::Validate => &statuses.validate,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Research => write!(f, "research"),
            Stage::Plan => write!(f, "plan"),
            Stage::Implement => write!(f, "implement"),
            Stage::Validate => write!(f, "validate"),
        }
    }
}

/// Resolve a board column name to its watched stage, if any.
pub fn stage_for_status(status: &str, statuses: &StatusesConfig) -> Option<Stage> {
    Stage::all()
        .into_iter()
        .find(|s| s.status_name(statuses) == status)
}

/// All running-label names, for actor lookups over the label family.
pub fn running_label_family() -> Vec<String> {
    Stage::all()
        .iter()
        .map(|s| s.running_label().to_string())
        .collect()
}

// --- Label definitions ---

/// Definition used when ensuring a label exists on a repository.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelSpec {
    pub name: &'static str,
    pub color: &'static str,
    pub description: &'static str,
}

/// The full label set drover requires on every repository it manages.
pub fn required_labels() -> Vec<LabelSpec> {
    let mut labels = Vec::new();
    for stage in Stage::all() {
        labels.push(LabelSpec {
            name: stage.running_label(),
            color: "1d76db",
            description: match stage {
                Stage::Research => "Research workflow in progress",
                Stage::Plan => "Planning workflow in progress",
                Stage::Implement => "Implementation workflow in progress",
                Stage::Validate => "Validation workflow in progress",
            },
        });
        if let Some(name) = stage.complete_label() {
            labels.push(LabelSpec {
                name,
                color: "0e8a16",
                description: match stage {
                    Stage::Research => "Research finished, awaiting promotion",
                    Stage::Plan => "Plan finished, awaiting promotion",
                    Stage::Implement => "Implementation finished, awaiting promotion",
                    Stage::Validate => unreachable!(),
                },
            });
        }
    }
    labels.push(LabelSpec {
        name: FAILED_LABEL,
        color: "d93f0b",
        description: "Most recent workflow failed; needs operator attention",
    });
    labels
}
