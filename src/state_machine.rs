//! Per-item dispatch eligibility.
//!
//! `screen_item` applies the label/status rules as a pure function;
//! `evaluate_item` wraps it with the tracker round-trips (stale-label
//! reclamation, actor authorization) the rules call for.

use crate::config::{DaemonConfig, StatusesConfig};
use crate::registry::RunningRegistry;
use crate::stage::{running_label_family, stage_for_status, Stage};
use crate::tracker::TicketClient;
use crate::types::{ItemState, TicketItem, UNKNOWN_STATUS};
use crate::{log_debug, log_info, log_warn};

/// Outcome of the pure screening rules.
///
/// `stale_label` is a running label observed without a live registry entry
/// for the item's key. It is set independently of the decision: staleness is
/// noticed before a later rule refuses, and the caller removes the label
/// either way. Closed and unwatched items never reach the label rules, so
/// their refusals carry no stale label.
#[derive(Debug, Clone, PartialEq)]
pub enum Screening {
    /// Label and status rules passed; authorization remains.
    Eligible {
        stage: Stage,
        stale_label: Option<&'static str>,
    },
    Refused {
        reason: Refusal,
        stale_label: Option<&'static str>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Refusal {
    /// Closed items never run workflows, whatever their labels say.
    Closed,
    /// Status is not a watched stage column.
    Unwatched,
    /// A workflow is genuinely in flight for this item.
    InFlight(Stage),
    /// The stage's complete label is present; awaiting manual promotion.
    StageComplete(Stage),
}

/// Apply the dispatch rules that need no I/O, in fixed order: closed,
/// unwatched status, running label vs. registry liveness, complete label.
///
/// `live` is whether the registry holds an entry for the item's key.
pub fn screen_item(item: &TicketItem, live: bool, statuses: &StatusesConfig) -> Screening {
    if item.state == ItemState::Closed {
        return Screening::Refused {
            reason: Refusal::Closed,
            stale_label: None,
        };
    }

    let Some(stage) = stage_for_status(&item.status, statuses) else {
        return Screening::Refused {
            reason: Refusal::Unwatched,
            stale_label: None,
        };
    };

    let running_label_present = item.labels.contains(stage.running_label());
    if running_label_present && live {
        return Screening::Refused {
            reason: Refusal::InFlight(stage),
            stale_label: None,
        };
    }

    // Label present, no live process: a prior run died without cleaning up.
    let stale_label = if running_label_present {
        Some(stage.running_label())
    } else {
        None
    };

    if let Some(complete) = stage.complete_label() {
        if item.labels.contains(complete) {
            return Screening::Refused {
                reason: Refusal::StageComplete(stage),
                stale_label,
            };
        }
    }

    Screening::Eligible { stage, stale_label }
}

/// Full eligibility decision for one item. Returns the stage to dispatch,
/// or `None` when any rule refuses (reasons are logged, not returned).
pub async fn evaluate_item(
    item: &TicketItem,
    registry: &RunningRegistry,
    config: &DaemonConfig,
    statuses: &StatusesConfig,
    client: &impl TicketClient,
) -> Option<Stage> {
    let live = registry.is_running(&item.registry_key());

    let (stage, stale_label) = match screen_item(item, live, statuses) {
        Screening::Refused { reason, stale_label } => {
            if let Some(label) = stale_label {
                reclaim_stale_label(item, label, client).await;
            }
            match reason {
                Refusal::Closed => {
                    log_debug!("{}#{}: closed; skipping", item.repo, item.ticket_id)
                }
                Refusal::Unwatched => log_debug!(
                    "{}#{}: status '{}' not watched; skipping",
                    item.repo,
                    item.ticket_id,
                    item.status
                ),
                Refusal::InFlight(stage) => log_debug!(
                    "{}#{}: {} workflow already running; skipping",
                    item.repo,
                    item.ticket_id,
                    stage
                ),
                Refusal::StageComplete(stage) => log_debug!(
                    "{}#{}: {} already complete, awaiting promotion; skipping",
                    item.repo,
                    item.ticket_id,
                    stage
                ),
            }
            return None;
        }
        Screening::Eligible { stage, stale_label } => (stage, stale_label),
    };

    if let Some(label) = stale_label {
        reclaim_stale_label(item, label, client).await;
    }

    if !config.allow_external_tickets && !is_authorized(item, config, client).await {
        return None;
    }

    Some(stage)
}

/// Whether the scheduler should move this item to the baseline column.
///
/// Only items the tracker reports with an unset status, while still open,
/// qualify. Items already in any named column are left where they are, so
/// the correction is idempotent across ticks.
pub fn needs_baseline_correction(item: &TicketItem) -> bool {
    item.status == UNKNOWN_STATUS && item.state == ItemState::Open
}

async fn reclaim_stale_label(item: &TicketItem, label: &str, client: &impl TicketClient) {
    log_warn!(
        "{}#{}: label '{}' present with no live workflow; removing stale label",
        item.repo,
        item.ticket_id,
        label
    );
    // Advisory cleanup. A failed removal must not block the decision; the
    // dispatch path re-asserts the label anyway.
    if let Err(e) = client.remove_label(&item.repo, item.ticket_id, label).await {
        log_warn!(
            "{}#{}: failed to remove stale label '{}': {}",
            item.repo,
            item.ticket_id,
            label,
            e
        );
    }
}

/// Fail-safe actor check: only items whose current status was set by the
/// configured identity are dispatched. An indeterminate actor counts as
/// unauthorized.
async fn is_authorized(
    item: &TicketItem,
    config: &DaemonConfig,
    client: &impl TicketClient,
) -> bool {
    let Some(self_identity) = config.self_identity.as_deref() else {
        log_warn!(
            "{}#{}: no self_identity configured and external tickets disallowed; skipping",
            item.repo,
            item.ticket_id
        );
        return false;
    };

    match resolve_actor(item, client).await {
        Some(actor) if actor == self_identity => true,
        Some(actor) => {
            if config.team_members.iter().any(|m| m == &actor) {
                log_info!(
                    "{}#{}: status set by team member '{}', not '{}'; skipping",
                    item.repo,
                    item.ticket_id,
                    actor,
                    self_identity
                );
            } else {
                log_warn!(
                    "{}#{}: status set by '{}', not '{}'; skipping",
                    item.repo,
                    item.ticket_id,
                    actor,
                    self_identity
                );
            }
            false
        }
        None => {
            log_warn!(
                "{}#{}: could not determine who set status '{}'; treating as unauthorized",
                item.repo,
                item.ticket_id,
                item.status
            );
            false
        }
    }
}

/// Who put the item in its current status. Falls back to the running-label
/// audit trail on trackers without status-actor support.
async fn resolve_actor(item: &TicketItem, client: &impl TicketClient) -> Option<String> {
    if client.capabilities().supports_status_actor_check {
        match client.get_last_status_actor(&item.item_id).await {
            Ok(actor) => actor,
            Err(e) => {
                log_warn!(
                    "{}#{}: status actor lookup failed: {}",
                    item.repo,
                    item.ticket_id,
                    e
                );
                None
            }
        }
    } else {
        match client
            .get_label_actor(&item.repo, item.ticket_id, &running_label_family())
            .await
        {
            Ok(actor) => actor,
            Err(e) => {
                log_warn!(
                    "{}#{}: label actor lookup failed: {}",
                    item.repo,
                    item.ticket_id,
                    e
                );
                None
            }
        }
    }
}
