//! Forwards replay requests to an external webhook.

use std::sync::Arc;

use crewtrace_core::Step;
use serde::Serialize;
use tracing::{info, warn};

use crate::ServerState;

#[derive(Serialize)]
struct ReplayPayload<'a> {
    step_id: &'a str,
    run_id: &'a str,
    agent_name: &'a str,
    step: &'a Step,
}

/// Posts the step to the configured webhook in the background. The replayed
/// agent reports its new execution through the regular event endpoint.
pub fn schedule(state: Arc<ServerState>, step: Step) {
    let Some(url) = state.config.replay.webhook_url.clone() else {
        info!(step_id = %step.id, "Replay requested; no webhook configured");
        return;
    };

    tokio::spawn(async move {
        let payload = ReplayPayload {
            step_id: &step.id,
            run_id: &step.run_id,
            agent_name: &step.agent_name,
            step: &step,
        };
        match state.http.post(&url).json(&payload).send().await {
            Ok(res) if res.status().is_success() => {
                info!(step_id = %step.id, status = %res.status(), "Replay forwarded");
            }
            Ok(res) => {
                warn!(step_id = %step.id, status = %res.status(), "Replay webhook rejected request");
            }
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "Replay webhook unreachable");
            }
        }
    });
}
