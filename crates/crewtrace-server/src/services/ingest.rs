//! Event ingestion followed by live publication.

use crewtrace_monitor::{IngestOutcome, StepEvent};
use tracing::info;

use crate::error::AppError;
use crate::ServerState;

/// Stores an event and, when it changed anything, notifies live subscribers.
pub fn ingest_event(state: &ServerState, event: StepEvent) -> Result<IngestOutcome, AppError> {
    let outcome = state.ingestor.ingest_event(event)?;

    if outcome.changed {
        state.broadcaster.step_changed(&outcome.step, &outcome.run);
    }
    if outcome.created {
        info!(
            step_id = %outcome.step.id,
            run_id = %outcome.run.id,
            agent = %outcome.step.agent_name,
            "Step recorded"
        );
    }

    Ok(outcome)
}
