use crewtrace_core::Status;
use crewtrace_engine::{CoordinationReport, Forest, SpanNode, TraceIssue};
use crewtrace_monitor::{IngestOutcome, StatusChange};
use serde::{Deserialize, Serialize};

// === HTTP DTOs ===

/// Body of `202 Accepted` for an ingested event.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub ok: bool,
    /// Stored step id; SDKs use it as the parent of child steps.
    pub agent_id: String,
    pub run_id: String,
    pub status: Status,
    pub created: bool,
    pub status_change: StatusChange,
}

impl From<IngestOutcome> for IngestResponse {
    fn from(outcome: IngestOutcome) -> Self {
        Self {
            ok: true,
            agent_id: outcome.step.id,
            run_id: outcome.run.id,
            status: outcome.step.status,
            created: outcome.created,
            status_change: outcome.status_change,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TraceResponse {
    /// Primary (most recently started) tree.
    pub trace: Option<SpanNode>,
    pub latest_trace: Option<SpanNode>,
    pub traces: Vec<SpanNode>,
    pub total_spans: usize,
    pub total_duration_ms: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub malformed: bool,
    pub issues: Vec<TraceIssue>,
}

impl TraceResponse {
    pub fn from_forest(forest: &Forest) -> Self {
        let primary = forest.primary().map(|t| t.to_tree());
        Self {
            latest_trace: primary.clone(),
            trace: primary,
            traces: forest.trees.iter().map(|t| t.to_tree()).collect(),
            total_spans: forest.total_spans(),
            total_duration_ms: forest.primary().map(|t| t.total_duration_ms()).unwrap_or(0),
            total_tokens: forest.trees.iter().fold(0u64, |acc, t| acc.saturating_add(t.total_tokens())),
            total_cost_usd: forest.trees.iter().map(|t| t.total_cost_usd()).sum(),
            malformed: forest.is_malformed(),
            issues: forest.issues().cloned().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse<'a> {
    #[serde(flatten)]
    pub report: &'a CoordinationReport,
    /// RFC 3339 time the response was produced.
    pub detected_at: String,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub message: String,
    pub step_id: String,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub status: String,
    #[serde(default)]
    pub run_id: Option<String>,
}

// === WebSocket DTOs ===

#[derive(Debug, Default, Deserialize)]
pub struct LiveParams {
    /// Restricts the channel to one run; omitted means every run.
    pub run_id: Option<String>,
}
