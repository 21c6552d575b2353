use crewtrace_config::DetectorPolicy;
use crewtrace_core::{CoordinationFailure, FailureType, Severity, Status};
use serde_json::json;

use super::{failure, phrase_pattern, Analyzer, AnalyzerError};
use crate::tree::Trace;

/// Flags spans whose reported status, output and numbers contradict each other.
pub struct LogicalInconsistencyAnalyzer;

impl Analyzer for LogicalInconsistencyAnalyzer {
    fn name(&self) -> &'static str {
        "logical_inconsistency"
    }

    fn analyze(
        &self,
        trace: &Trace,
        policy: &DetectorPolicy,
    ) -> Result<Vec<CoordinationFailure>, AnalyzerError> {
        let success = phrase_pattern(&policy.success_phrases)?;
        let mut failures = Vec::new();

        for idx in 0..trace.len() {
            let span = trace.span(idx);
            let kind = FailureType::LogicalInconsistency;

            match span.status {
                Status::Error => {
                    if let Some(phrase) = success.as_ref().and_then(|re| re.find(&span.output)) {
                        failures.push(failure(
                            kind,
                            "SUCCESS_CLAIMED_ON_ERROR",
                            Severity::Medium,
                            span,
                            format!("Agent '{}' errored but its output claims success", span.agent_name),
                            json!({ "status": span.status, "matched_phrase": phrase.as_str() }),
                        ));
                    }
                    if span.error_message.as_deref().map_or(true, |m| m.trim().is_empty()) {
                        failures.push(failure(
                            kind,
                            "MISSING_ERROR_DETAILS",
                            Severity::Low,
                            span,
                            format!("Agent '{}' errored without an error message", span.agent_name),
                            json!({ "status": span.status }),
                        ));
                    }
                }
                Status::Success => {
                    if let Some(message) = span.error_message.as_deref().filter(|m| !m.trim().is_empty()) {
                        failures.push(failure(
                            kind,
                            "STATUS_ERROR_MISMATCH",
                            Severity::Medium,
                            span,
                            format!("Agent '{}' succeeded but reports an error", span.agent_name),
                            json!({ "status": span.status, "error_message": message }),
                        ));
                    }
                }
                Status::Running => {}
            }

            let tokens = &span.tokens;
            let parts = tokens.input.saturating_add(tokens.output);
            if parts > 0 && tokens.total != parts {
                failures.push(failure(
                    kind,
                    "TOKEN_COUNT_MISMATCH",
                    Severity::Low,
                    span,
                    format!(
                        "Agent '{}' reports {} total tokens but {} input + {} output",
                        span.agent_name, tokens.total, tokens.input, tokens.output
                    ),
                    json!({ "tokens": tokens }),
                ));
            }

            if let Some(parent) = trace.parent(idx).map(|p| trace.span(p)) {
                if span.is_terminal() && parent.is_terminal() && span.duration_ms > parent.duration_ms {
                    failures.push(failure(
                        kind,
                        "DURATION_EXCEEDS_PARENT",
                        Severity::Low,
                        span,
                        format!(
                            "Agent '{}' ran {}ms, longer than its parent '{}' ({}ms)",
                            span.agent_name, span.duration_ms, parent.agent_name, parent.duration_ms
                        ),
                        json!({
                            "duration_ms": span.duration_ms,
                            "parent_id": parent.id,
                            "parent_duration_ms": parent.duration_ms,
                        }),
                    ));
                }
            }
        }

        Ok(failures)
    }
}
