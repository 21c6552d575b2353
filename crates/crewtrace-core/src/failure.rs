//! Coordination failure records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a detected coordination failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Hallucination,
    LogicalInconsistency,
    MissingContext,
    ContractViolation,
}

impl FailureType {
    pub const ALL: [FailureType; 4] = [
        FailureType::Hallucination,
        FailureType::LogicalInconsistency,
        FailureType::MissingContext,
        FailureType::ContractViolation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Hallucination => "hallucination",
            FailureType::LogicalInconsistency => "logical_inconsistency",
            FailureType::MissingContext => "missing_context",
            FailureType::ContractViolation => "contract_violation",
        }
    }
}

/// Severity of a failure. Ordered low < medium < high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::High, Severity::Medium, Severity::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// A detected anomaly in how agents handed off work or reported results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationFailure {
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    /// Free-form refinement such as `TOOL_NOT_AVAILABLE`.
    pub subtype: String,
    pub severity: Severity,
    pub span_id: String,
    pub span_name: String,
    pub message: String,
    /// Structured data supporting the finding.
    pub evidence: Value,
}
