//! Ingestion endpoints.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use crewtrace_monitor::StepEvent;

use crate::broadcast::LiveMessage;
use crate::dto::{AckResponse, IngestResponse, ProgressRequest};
use crate::error::AppError;
use crate::services;
use crate::ServerState;

/// POST /event - Ingest one step event.
pub async fn ingest(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<StepEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let Json(event) = payload?;
    let outcome = services::ingest::ingest_event(&state, event)?;
    Ok((StatusCode::ACCEPTED, Json(outcome.into())))
}

/// POST /debate/progress - Relay a collaborator's progress signal.
pub async fn progress(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<ProgressRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AckResponse>), AppError> {
    let Json(req) = payload?;
    if req.status.trim().is_empty() {
        return Err(AppError::Validation("missing required field 'status'".into()));
    }

    let run_id = req.run_id.filter(|r| !r.is_empty());
    state.broadcaster.publish(
        run_id.as_deref(),
        LiveMessage::DebateProgress {
            status: req.status,
            run_id: run_id.clone(),
        },
    );
    Ok((StatusCode::ACCEPTED, Json(AckResponse { ok: true })))
}
