//! Step records and their closed enumerations.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ModelError;

/// Execution status of a step (and, by aggregation, of a run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Still executing.
    Running,
    /// Finished without error.
    Success,
    /// Finished with an error.
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Success => "success",
            Status::Error => "error",
        }
    }

    /// Success and error are terminal; running is not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Running)
    }
}

impl FromStr for Status {
    type Err = ModelError;

    /// Parses a wire status. `started` is what instrumentation SDKs send for
    /// the first event of a step and maps to [`Status::Running`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" | "started" => Ok(Status::Running),
            "success" => Ok(Status::Success),
            "error" => Ok(Status::Error),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Kind of operation a span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    Root,
    #[default]
    Agent,
    LlmCall,
    ApiCall,
    Database,
    Tool,
    Retrieval,
}

impl SpanType {
    pub const ALL: [SpanType; 7] = [
        SpanType::Root,
        SpanType::Agent,
        SpanType::LlmCall,
        SpanType::ApiCall,
        SpanType::Database,
        SpanType::Tool,
        SpanType::Retrieval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpanType::Root => "root",
            SpanType::Agent => "agent",
            SpanType::LlmCall => "llm_call",
            SpanType::ApiCall => "api_call",
            SpanType::Database => "database",
            SpanType::Tool => "tool",
            SpanType::Retrieval => "retrieval",
        }
    }
}

impl FromStr for SpanType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        SpanType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or(ModelError::UnknownSpanType(normalized))
    }
}

/// Token counts for a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input.saturating_add(output),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input == 0 && self.output == 0 && self.total == 0
    }
}

/// One agent's execution record within a run.
///
/// Steps are stored flat; the parent relation is a reference by id or agent
/// name that the span tree builder resolves at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique step identifier.
    pub id: String,
    /// Owning run.
    pub run_id: String,
    /// Agent identity within the run.
    pub agent_name: String,
    /// Parent step id or agent name within the same run.
    pub parent_ref: Option<String>,
    pub status: Status,
    /// Unix timestamp (milliseconds) when the step started.
    pub start_time: Option<i64>,
    /// Unix timestamp (milliseconds) when the step ended.
    pub end_time: Option<i64>,
    pub duration_ms: u64,
    pub prompt: String,
    pub output: String,
    pub error_message: Option<String>,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub claimed_actions: Vec<String>,
    pub actual_actions: Vec<String>,
    pub span_type: SpanType,
    pub metadata: Map<String, Value>,
    /// Hallucination subtypes flagged on this step alone at ingestion.
    pub hallucination_flags: Vec<String>,
    /// Highest producer sequence merged into this step, if any event sent one.
    pub sequence: Option<i64>,
    /// Receive time (Unix milliseconds) of the latest event merged in.
    pub updated_at: i64,
    /// Unix timestamp (milliseconds) when the step was first stored.
    pub created_at: i64,
}

impl Step {
    /// Creates a running agent step with empty payload fields.
    pub fn new(id: impl Into<String>, run_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            run_id: run_id.into(),
            agent_name: agent_name.into(),
            parent_ref: None,
            status: Status::Running,
            start_time: None,
            end_time: None,
            duration_ms: 0,
            prompt: String::new(),
            output: String::new(),
            error_message: None,
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            claimed_actions: Vec::new(),
            actual_actions: Vec::new(),
            span_type: SpanType::default(),
            metadata: Map::new(),
            hallucination_flags: Vec::new(),
            sequence: None,
            updated_at: 0,
            created_at: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_flagged(&self) -> bool {
        !self.hallucination_flags.is_empty()
    }

    /// Start time, falling back to when the step was first stored.
    pub fn effective_start(&self) -> i64 {
        self.start_time.unwrap_or(self.created_at)
    }

    /// Claimed actions with no matching actual action, in claim order.
    pub fn unmatched_claims(&self) -> impl Iterator<Item = &str> {
        self.claimed_actions
            .iter()
            .filter(|c| !self.actual_actions.contains(*c))
            .map(String::as_str)
    }

    /// Non-null metadata value under `key`.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key).filter(|v| !v.is_null())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// String entries of a metadata array under `key`.
    pub fn metadata_list(&self, key: &str) -> Option<Vec<&str>> {
        let items = self.metadata.get(key)?.as_array()?;
        Some(items.iter().filter_map(Value::as_str).collect())
    }
}
