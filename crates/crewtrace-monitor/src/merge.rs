//! Field-level merge of a validated event into a stored step.
//!
//! Events are ordered by producer `sequence` when both the event and the step
//! carry one, and by receive time otherwise; the two are never compared with
//! each other. A field carried by a newer (or equally new) event overwrites
//! the stored value; an older event only fills fields the step lacks. Status
//! is special-cased: terminal beats non-terminal, otherwise latest wins.

use crewtrace_core::{Status, Step};
use serde::Serialize;
use tracing::{info, warn};

use crate::event::StepUpdate;

/// What happened to the step's status during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusChange {
    /// The event carried no status, or the same one.
    Unchanged,
    Applied { from: Status, to: Status },
    /// A newer terminal status replaced a different terminal status.
    Corrected { from: Status, to: Status },
    /// The status was not applied; the other fields still merged.
    Rejected { stored: Status, incoming: Status },
}

impl StatusChange {
    /// True for updates that lost a race against a terminal status.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StatusChange::Rejected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Whether any stored field differs after the merge.
    pub changed: bool,
    pub status_change: StatusChange,
}

/// Creates a step from its first event, received at `received_at`.
pub fn create(id: String, update: &StepUpdate, received_at: i64) -> Step {
    let mut step = Step::new(id, update.run_id.clone(), update.agent_name.clone().unwrap_or_default());
    step.created_at = received_at;
    step.updated_at = received_at;
    step.sequence = update.sequence;
    merge_fields(&mut step, update, true);
    if let Some(status) = update.status {
        step.status = status;
    }
    derive_duration(&mut step);
    step
}

/// Whether an event is at least as new as everything merged into `step`.
pub fn is_newer(step: &Step, update: &StepUpdate, received_at: i64) -> bool {
    match (update.sequence, step.sequence) {
        (Some(incoming), Some(stored)) => incoming >= stored,
        _ => received_at >= step.updated_at,
    }
}

/// Merges `update`, received at `received_at`, into `step`.
pub fn apply(step: &mut Step, update: &StepUpdate, received_at: i64) -> MergeOutcome {
    let before = step.clone();
    let newer = is_newer(step, update, received_at);

    merge_fields(step, update, newer);
    let status_change = merge_status(step, update.status, newer);
    derive_duration(step);
    step.sequence = step.sequence.max(update.sequence);
    step.updated_at = step.updated_at.max(received_at);

    let changed = {
        let mut unkeyed = step.clone();
        unkeyed.sequence = before.sequence;
        unkeyed.updated_at = before.updated_at;
        unkeyed != before
    };

    MergeOutcome {
        changed,
        status_change,
    }
}

fn merge_status(step: &mut Step, incoming: Option<Status>, newer: bool) -> StatusChange {
    let Some(incoming) = incoming else {
        return StatusChange::Unchanged;
    };
    let stored = step.status;
    if incoming == stored {
        return StatusChange::Unchanged;
    }

    match (stored.is_terminal(), incoming.is_terminal()) {
        (false, _) => {
            step.status = incoming;
            StatusChange::Applied {
                from: stored,
                to: incoming,
            }
        }
        (true, true) if newer => {
            info!(
                step_id = %step.id,
                from = stored.as_str(),
                to = incoming.as_str(),
                "Terminal status corrected"
            );
            step.status = incoming;
            StatusChange::Corrected {
                from: stored,
                to: incoming,
            }
        }
        (true, _) => {
            warn!(
                step_id = %step.id,
                stored = stored.as_str(),
                incoming = incoming.as_str(),
                "Concurrency conflict: status update rejected"
            );
            StatusChange::Rejected { stored, incoming }
        }
    }
}

fn merge_fields(step: &mut Step, update: &StepUpdate, newer: bool) {
    fn take<T: Clone>(slot: &mut T, incoming: &Option<T>, newer: bool, lacks: bool) {
        if let Some(value) = incoming {
            if newer || lacks {
                *slot = value.clone();
            }
        }
    }
    fn take_opt<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>, newer: bool) {
        if incoming.is_some() && (newer || slot.is_none()) {
            slot.clone_from(incoming);
        }
    }

    let lacks_name = step.agent_name.is_empty();
    take(&mut step.agent_name, &update.agent_name, newer, lacks_name);
    take_opt(&mut step.parent_ref, &update.parent_ref, newer);
    take_opt(&mut step.start_time, &update.start_time, newer);
    take_opt(&mut step.end_time, &update.end_time, newer);

    let lacks_duration = step.duration_ms == 0;
    take(&mut step.duration_ms, &update.duration_ms, newer, lacks_duration);
    let lacks_prompt = step.prompt.is_empty();
    take(&mut step.prompt, &update.prompt, newer, lacks_prompt);
    let lacks_output = step.output.is_empty();
    take(&mut step.output, &update.output, newer, lacks_output);
    take_opt(&mut step.error_message, &update.error_message, newer);

    let tokens = &mut step.tokens;
    // A total that matches the parts was derived, or never sent.
    let derived_total = tokens.total == tokens.input.saturating_add(tokens.output);
    let lacks = tokens.input == 0;
    take(&mut tokens.input, &update.input_tokens, newer, lacks);
    let lacks = tokens.output == 0;
    take(&mut tokens.output, &update.output_tokens, newer, lacks);
    let lacks = tokens.total == 0;
    take(&mut tokens.total, &update.total_tokens, newer, lacks);
    if update.total_tokens.is_none() && derived_total {
        tokens.total = tokens.input.saturating_add(tokens.output);
    }

    let lacks_cost = step.cost_usd == 0.0;
    take(&mut step.cost_usd, &update.cost_usd, newer, lacks_cost);
    let lacks_claims = step.claimed_actions.is_empty();
    take(&mut step.claimed_actions, &update.claimed_actions, newer, lacks_claims);
    let lacks_actions = step.actual_actions.is_empty();
    take(&mut step.actual_actions, &update.actual_actions, newer, lacks_actions);
    if let Some(span_type) = update.span_type {
        if newer {
            step.span_type = span_type;
        }
    }

    if let Some(metadata) = &update.metadata {
        for (key, value) in metadata {
            if newer || !step.metadata.contains_key(key) {
                step.metadata.insert(key.clone(), value.clone());
            }
        }
    }
}

/// `end - start` when both are known and ordered; otherwise the merged
/// explicit duration stands.
fn derive_duration(step: &mut Step) {
    let (Some(start), Some(end)) = (step.start_time, step.end_time) else {
        return;
    };
    if let Some(elapsed) = end.checked_sub(start).and_then(|d| u64::try_from(d).ok()) {
        step.duration_ms = elapsed;
    }
}
