//! Step lookup and replay handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use crewtrace_core::Step;

use crate::dto::ReplayResponse;
use crate::error::AppError;
use crate::services;
use crate::ServerState;

fn find_step(state: &ServerState, step_id: &str) -> Result<Step, AppError> {
    state
        .store()
        .get_step(step_id)?
        .ok_or_else(|| AppError::NotFound(format!("step '{}' not found", step_id)))
}

/// GET /step/{id}
pub async fn get(
    State(state): State<Arc<ServerState>>,
    Path(step_id): Path<String>,
) -> Result<Json<Step>, AppError> {
    Ok(Json(find_step(&state, &step_id)?))
}

/// POST /step/{id}/replay - Ask the configured webhook to re-run a step.
pub async fn replay(
    State(state): State<Arc<ServerState>>,
    Path(step_id): Path<String>,
) -> Result<(StatusCode, Json<ReplayResponse>), AppError> {
    let step = find_step(&state, &step_id)?;
    services::replay::schedule(state.clone(), step);
    Ok((
        StatusCode::ACCEPTED,
        Json(ReplayResponse {
            message: "Replay requested".into(),
            step_id,
        }),
    ))
}
