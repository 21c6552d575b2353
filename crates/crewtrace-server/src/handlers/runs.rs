//! Run query API handlers.

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use crewtrace_core::{Run, Step};
use crewtrace_monitor::RunQuery;
use serde_json::Value;

use crate::dto::{AnalysisResponse, TraceResponse};
use crate::error::AppError;
use crate::ServerState;

const DEFAULT_LIMIT: u32 = 50;

fn find_run(state: &ServerState, run_id: &str) -> Result<Run, AppError> {
    state
        .store()
        .get_run(run_id)?
        .ok_or_else(|| AppError::NotFound(format!("run '{}' not found", run_id)))
}

/// GET /runs - Bare list of runs, newest first.
pub async fn list(
    State(state): State<Arc<ServerState>>,
    params: Result<Query<RunQuery>, QueryRejection>,
) -> Result<Json<Vec<Run>>, AppError> {
    let Query(mut query) = params?;
    query.limit = query.limit.or(Some(DEFAULT_LIMIT));
    Ok(Json(state.store().list_runs(&query)?))
}

/// GET /run/{id}
pub async fn get(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, AppError> {
    Ok(Json(find_run(&state, &run_id)?))
}

/// GET /run/{id}/steps - Flat step list ordered by start time.
pub async fn steps(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<Step>>, AppError> {
    find_run(&state, &run_id)?;
    Ok(Json(state.store().list_steps(&run_id)?))
}

/// GET /run/{id}/trace - Span trees of the run.
pub async fn trace(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Result<Json<TraceResponse>, AppError> {
    let run = find_run(&state, &run_id)?;
    let snapshot = state.analysis.snapshot(state.store(), &run)?;
    Ok(Json(TraceResponse::from_forest(&snapshot.forest)))
}

/// GET /run/{id}/coordination-analysis - Failures and health of the primary tree.
pub async fn analysis(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let run = find_run(&state, &run_id)?;
    let snapshot = state.analysis.snapshot(state.store(), &run)?;
    let response = AnalysisResponse {
        report: &snapshot.report,
        detected_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    Ok(Json(serde_json::to_value(response).map_err(AppError::internal)?))
}
