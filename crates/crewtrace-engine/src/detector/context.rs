use crewtrace_config::DetectorPolicy;
use crewtrace_core::{CoordinationFailure, FailureType, Severity, Status, Step};
use regex::Regex;
use serde_json::{json, Value};

use super::{failure, Analyzer, AnalyzerError};
use crate::tree::Trace;

const PLACEHOLDER: &str = r"\{\{\s*parent\.([A-Za-z0-9_\-]+)\s*\}\}";

/// Flags spans that consume parent context the parent never produced.
pub struct MissingContextAnalyzer;

impl Analyzer for MissingContextAnalyzer {
    fn name(&self) -> &'static str {
        "missing_context"
    }

    fn analyze(
        &self,
        trace: &Trace,
        policy: &DetectorPolicy,
    ) -> Result<Vec<CoordinationFailure>, AnalyzerError> {
        let placeholder = Regex::new(PLACEHOLDER)?;
        let mut failures = Vec::new();

        for idx in 0..trace.len() {
            let span = trace.span(idx);
            let required = required_keys(span, &policy.required_context_key, &placeholder);
            if required.is_empty() {
                continue;
            }

            let Some(parent) = trace.parent(idx).map(|p| trace.span(p)) else {
                failures.push(failure(
                    FailureType::MissingContext,
                    "NO_PARENT_CONTEXT",
                    Severity::Medium,
                    span,
                    format!("Agent '{}' references parent context but has no parent", span.agent_name),
                    json!({ "required_keys": required, "parent_ref": span.parent_ref }),
                ));
                continue;
            };

            match parent.status {
                Status::Running => {}
                Status::Error => failures.push(failure(
                    FailureType::MissingContext,
                    "PARENT_FAILED",
                    Severity::Medium,
                    span,
                    format!(
                        "Agent '{}' depends on '{}', which failed",
                        span.agent_name, parent.agent_name
                    ),
                    json!({
                        "parent_id": parent.id,
                        "parent_error": parent.error_message,
                        "required_keys": required,
                    }),
                )),
                Status::Success => {
                    let output = parse_object(&parent.output);
                    for key in &required {
                        if provides(parent, output.as_ref(), key) {
                            continue;
                        }
                        failures.push(failure(
                            FailureType::MissingContext,
                            "MISSING_PARENT_KEY",
                            Severity::Medium,
                            span,
                            format!(
                                "Agent '{}' needs '{}' from '{}', which never provided it",
                                span.agent_name, key, parent.agent_name
                            ),
                            json!({ "parent_id": parent.id, "key": key }),
                        ));
                    }
                }
            }
        }

        Ok(failures)
    }
}

/// Keys declared in metadata followed by prompt placeholders, deduplicated.
fn required_keys<'a>(span: &'a Step, metadata_key: &str, placeholder: &Regex) -> Vec<&'a str> {
    let mut keys: Vec<&str> = span.metadata_list(metadata_key).unwrap_or_default();
    for caps in placeholder.captures_iter(&span.prompt) {
        if let Some(key) = caps.get(1).map(|m| m.as_str()) {
            keys.push(key);
        }
    }
    let mut seen = Vec::with_capacity(keys.len());
    keys.retain(|k| {
        if seen.contains(k) {
            false
        } else {
            seen.push(*k);
            true
        }
    });
    keys
}

pub(super) fn parse_object(output: &str) -> Option<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(output) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn provides(parent: &Step, output: Option<&serde_json::Map<String, Value>>, key: &str) -> bool {
    parent.metadata_value(key).is_some()
        || output.and_then(|o| o.get(key)).is_some_and(|v| !v.is_null())
}
