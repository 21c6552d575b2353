//! Coordination failure detection.
//!
//! Each [`Analyzer`] inspects every span of a [`Trace`] independently. The
//! [`Detector`] runs them in a fixed order, isolates failures of individual
//! analyzers, and reduces the findings to a [`CoordinationReport`].

mod consistency;
mod context;
mod contract;
mod hallucination;
mod score;

use std::panic::{self, AssertUnwindSafe};

use crewtrace_config::DetectorPolicy;
use crewtrace_core::{CoordinationFailure, FailureType, Severity, Step};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::tree::Trace;

pub use consistency::LogicalInconsistencyAnalyzer;
pub use context::MissingContextAnalyzer;
pub use contract::ContractViolationAnalyzer;
pub use hallucination::{step_flags, HallucinationAnalyzer};
pub use score::{health_score, HealthSummary};

/// Errors an analyzer may report instead of findings.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Analyzer failed: {0}")]
    Internal(String),
}

impl From<regex::Error> for AnalyzerError {
    fn from(err: regex::Error) -> Self {
        AnalyzerError::InvalidPolicy(err.to_string())
    }
}

/// A stateless rule set applied to every span of a trace.
pub trait Analyzer: Send + Sync {
    /// Stable name reported when the analyzer fails.
    fn name(&self) -> &'static str;

    fn analyze(
        &self,
        trace: &Trace,
        policy: &DetectorPolicy,
    ) -> Result<Vec<CoordinationFailure>, AnalyzerError>;
}

/// Result of analyzing one trace. Contains no timestamps so identical trees
/// always produce identical reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinationReport {
    pub summary: HealthSummary,
    pub failures: Vec<CoordinationFailure>,
    pub has_failures: bool,
    /// Number of analyzers that errored or panicked.
    pub internal_errors: u32,
    pub failed_analyzers: Vec<String>,
}

/// Runs the analyzers and aggregates their findings.
pub struct Detector {
    policy: DetectorPolicy,
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl Detector {
    /// Creates a detector with the four built-in analyzers.
    pub fn new(policy: DetectorPolicy) -> Self {
        Self::with_analyzers(
            policy,
            vec![
                Box::new(HallucinationAnalyzer),
                Box::new(LogicalInconsistencyAnalyzer),
                Box::new(MissingContextAnalyzer),
                Box::new(ContractViolationAnalyzer),
            ],
        )
    }

    pub fn with_analyzers(policy: DetectorPolicy, analyzers: Vec<Box<dyn Analyzer>>) -> Self {
        Self { policy, analyzers }
    }

    pub fn policy(&self) -> &DetectorPolicy {
        &self.policy
    }

    pub fn analyze(&self, trace: &Trace) -> CoordinationReport {
        let mut failures = Vec::new();
        let mut failed_analyzers = Vec::new();

        for analyzer in &self.analyzers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(trace, &self.policy)));
            match outcome {
                Ok(Ok(found)) => {
                    debug!(analyzer = analyzer.name(), count = found.len(), "Analyzer finished");
                    failures.extend(found);
                }
                Ok(Err(e)) => {
                    warn!(analyzer = analyzer.name(), error = %e, "Analyzer failed");
                    failed_analyzers.push(analyzer.name().to_string());
                }
                Err(_) => {
                    warn!(analyzer = analyzer.name(), "Analyzer panicked");
                    failed_analyzers.push(analyzer.name().to_string());
                }
            }
        }

        let summary = HealthSummary::from_failures(&failures, &self.policy.weights);
        CoordinationReport {
            has_failures: !failures.is_empty(),
            internal_errors: failed_analyzers.len() as u32,
            summary,
            failures,
            failed_analyzers,
        }
    }
}

/// Case-insensitive, word-bounded alternation of the phrases. `None` when the
/// list is empty.
pub(crate) fn phrase_pattern(phrases: &[String]) -> Result<Option<Regex>, AnalyzerError> {
    if phrases.is_empty() {
        return Ok(None);
    }
    let alternation = phrases
        .iter()
        .map(|p| regex::escape(p.trim()))
        .collect::<Vec<_>>()
        .join("|");
    Ok(Some(Regex::new(&format!(r"(?i)\b(?:{alternation})\b"))?))
}

pub(crate) fn failure(
    failure_type: FailureType,
    subtype: &str,
    severity: Severity,
    span: &Step,
    message: String,
    evidence: Value,
) -> CoordinationFailure {
    CoordinationFailure {
        failure_type,
        subtype: subtype.to_string(),
        severity,
        span_id: span.id.clone(),
        span_name: span.agent_name.clone(),
        message,
        evidence,
    }
}
