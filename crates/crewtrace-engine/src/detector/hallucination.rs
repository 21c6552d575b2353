use std::collections::HashSet;

use crewtrace_config::{DetectorPolicy, UndeclaredToolsSubtype};
use crewtrace_core::{CoordinationFailure, FailureType, Severity, SpanType, Step};
use regex::Regex;
use serde_json::json;

use super::{failure, phrase_pattern, Analyzer, AnalyzerError};
use crate::tree::Trace;

const TOOL_NOT_AVAILABLE: &str = "TOOL_NOT_AVAILABLE";
const CLAIMED_WITHOUT_ACTION: &str = "CLAIMED_WITHOUT_ACTION";
const UNKNOWN_MODEL: &str = "UNKNOWN_MODEL";
const INVENTED_API: &str = "INVENTED_API";

const API_REFERENCE: &str = r"/api/[A-Za-z0-9_/-]+";

/// Flags actions a span claims but never performed, models nobody knows, and
/// API endpoints that do not exist.
pub struct HallucinationAnalyzer;

/// Compiled per-call matchers for the policy's phrase and API checks.
struct Matchers {
    completion: Option<Regex>,
    api: Option<Regex>,
}

impl Matchers {
    fn new(policy: &DetectorPolicy) -> Result<Self, AnalyzerError> {
        let api = if policy.known_api_prefixes.is_empty() {
            None
        } else {
            Some(Regex::new(API_REFERENCE)?)
        };
        Ok(Self {
            completion: phrase_pattern(&policy.completion_phrases)?,
            api,
        })
    }

    /// The completion phrase an agent or tool span uses while recording no
    /// action at all.
    fn unbacked_completion<'a>(&self, span: &'a Step) -> Option<&'a str> {
        if !matches!(span.span_type, SpanType::Agent | SpanType::Tool)
            || !span.is_terminal()
            || !span.actual_actions.is_empty()
            || !span.claimed_actions.is_empty()
        {
            return None;
        }
        self.completion.as_ref()?.find(&span.output).map(|m| m.as_str())
    }

    /// `/api/...` references in the output that match no known prefix.
    fn invented_apis<'a>(&self, span: &'a Step, policy: &DetectorPolicy) -> Vec<&'a str> {
        let Some(api) = &self.api else {
            return Vec::new();
        };
        api.find_iter(&span.output)
            .map(|m| m.as_str())
            .filter(|reference| !policy.known_api_prefixes.iter().any(|p| reference.starts_with(p.as_str())))
            .collect()
    }
}

fn claim_subtype(declared: Option<&[&str]>, claim: &str, policy: &DetectorPolicy) -> &'static str {
    match declared {
        Some(tools) if tools.contains(&claim) => CLAIMED_WITHOUT_ACTION,
        Some(_) => TOOL_NOT_AVAILABLE,
        None => match policy.undeclared_tools_subtype {
            UndeclaredToolsSubtype::ClaimedWithoutAction => CLAIMED_WITHOUT_ACTION,
            UndeclaredToolsSubtype::ToolNotAvailable => TOOL_NOT_AVAILABLE,
        },
    }
}

fn unknown_model<'a>(span: &'a Step, policy: &DetectorPolicy) -> Option<&'a str> {
    if policy.known_models.is_empty() {
        return None;
    }
    span.metadata_str("model")
        .filter(|model| !policy.known_models.iter().any(|m| m == model))
}

impl Analyzer for HallucinationAnalyzer {
    fn name(&self) -> &'static str {
        "hallucination"
    }

    fn analyze(
        &self,
        trace: &Trace,
        policy: &DetectorPolicy,
    ) -> Result<Vec<CoordinationFailure>, AnalyzerError> {
        let matchers = Matchers::new(policy)?;
        let mut reported_apis: HashSet<&str> = HashSet::new();
        let mut failures = Vec::new();

        for idx in 0..trace.len() {
            let span = trace.span(idx);

            let mut claims = span.unmatched_claims().peekable();
            if claims.peek().is_some() {
                let declared = declared_tools(trace, idx, &policy.available_tools_key);
                for claim in claims {
                    failures.push(failure(
                        FailureType::Hallucination,
                        claim_subtype(declared.as_deref(), claim, policy),
                        Severity::High,
                        span,
                        format!("Agent '{}' claimed '{}' but no matching action was recorded", span.agent_name, claim),
                        json!({
                            "claimed": claim,
                            "actual_actions": span.actual_actions,
                            "available_tools": declared,
                        }),
                    ));
                }
            }

            if let Some(phrase) = matchers.unbacked_completion(span) {
                failures.push(failure(
                    FailureType::Hallucination,
                    CLAIMED_WITHOUT_ACTION,
                    Severity::High,
                    span,
                    format!("Agent '{}' reports finished work but recorded no action", span.agent_name),
                    json!({ "matched_phrase": phrase, "actual_actions": span.actual_actions }),
                ));
            }

            for reference in matchers.invented_apis(span, policy) {
                if !reported_apis.insert(reference) {
                    continue;
                }
                failures.push(failure(
                    FailureType::Hallucination,
                    INVENTED_API,
                    Severity::High,
                    span,
                    format!("Agent '{}' references non-existent API endpoint '{}'", span.agent_name, reference),
                    json!({ "claimed_api": reference, "found_in": "output" }),
                ));
            }

            if let Some(model) = unknown_model(span, policy) {
                failures.push(failure(
                    FailureType::Hallucination,
                    UNKNOWN_MODEL,
                    Severity::High,
                    span,
                    format!("Agent '{}' reports unknown model '{}'", span.agent_name, model),
                    json!({ "model": model, "known_models": policy.known_models }),
                ));
            }
        }

        Ok(failures)
    }
}

/// Hallucination subtypes visible on one step without its trace, in a stable
/// order and without duplicates. Only tools declared on the step itself count.
pub fn step_flags(step: &Step, policy: &DetectorPolicy) -> Result<Vec<String>, AnalyzerError> {
    let matchers = Matchers::new(policy)?;
    let declared = step.metadata_list(&policy.available_tools_key);

    let mut flags: Vec<&'static str> = step
        .unmatched_claims()
        .map(|claim| claim_subtype(declared.as_deref(), claim, policy))
        .collect();
    if matchers.unbacked_completion(step).is_some() {
        flags.push(CLAIMED_WITHOUT_ACTION);
    }
    if !matchers.invented_apis(step, policy).is_empty() {
        flags.push(INVENTED_API);
    }
    if unknown_model(step, policy).is_some() {
        flags.push(UNKNOWN_MODEL);
    }

    let mut unique: Vec<String> = Vec::with_capacity(flags.len());
    for flag in flags {
        if !unique.iter().any(|f| f == flag) {
            unique.push(flag.to_string());
        }
    }
    Ok(unique)
}

/// Union of the tool lists declared on the span and its ancestors, or `None`
/// when no span on the chain declares any.
fn declared_tools<'a>(trace: &'a Trace, idx: usize, key: &str) -> Option<Vec<&'a str>> {
    let mut found = false;
    let mut tools: Vec<&str> = Vec::new();
    for ancestor in trace.ancestors_inclusive(idx) {
        if let Some(list) = trace.span(ancestor).metadata_list(key) {
            found = true;
            for tool in list {
                if !tools.contains(&tool) {
                    tools.push(tool);
                }
            }
        }
    }
    found.then_some(tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Forest;
    use crewtrace_core::Status;

    fn step(id: &str, parent: Option<&str>, start: i64) -> Step {
        let mut s = Step::new(id, "run-1", id);
        s.parent_ref = parent.map(String::from);
        s.start_time = Some(start);
        s.status = Status::Success;
        s
    }

    fn run(steps: &[Step], policy: &DetectorPolicy) -> Vec<CoordinationFailure> {
        let forest = Forest::build(steps);
        HallucinationAnalyzer.analyze(forest.primary().unwrap(), policy).unwrap()
    }

    #[test]
    fn test_unmatched_claim_without_declared_tools() {
        let mut s = step("a", None, 0);
        s.claimed_actions = vec!["used:mcp-tools".into()];
        let failures = run(&[s], &DetectorPolicy::default());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subtype, CLAIMED_WITHOUT_ACTION);
        assert_eq!(failures[0].severity, Severity::High);
        assert_eq!(failures[0].evidence["claimed"], "used:mcp-tools");
    }

    #[test]
    fn test_undeclared_subtype_follows_policy() {
        let mut s = step("a", None, 0);
        s.claimed_actions = vec!["search".into()];
        let policy = DetectorPolicy {
            undeclared_tools_subtype: UndeclaredToolsSubtype::ToolNotAvailable,
            ..DetectorPolicy::default()
        };
        assert_eq!(run(&[s], &policy)[0].subtype, TOOL_NOT_AVAILABLE);
    }

    #[test]
    fn test_tools_declared_on_ancestor_are_inherited() {
        let mut root = step("root", None, 0);
        root.metadata.insert("available_tools".into(), json!(["search"]));
        let mut child = step("child", Some("root"), 10);
        child.claimed_actions = vec!["search".into(), "deploy".into()];
        child.actual_actions = vec![];

        let failures = run(&[root, child], &DetectorPolicy::default());
        let subtypes: Vec<_> = failures.iter().map(|f| f.subtype.as_str()).collect();
        assert_eq!(subtypes, vec![CLAIMED_WITHOUT_ACTION, TOOL_NOT_AVAILABLE]);
        assert!(failures.iter().all(|f| f.span_id == "child"));
    }

    #[test]
    fn test_matched_claims_are_clean() {
        let mut s = step("a", None, 0);
        s.claimed_actions = vec!["search".into()];
        s.actual_actions = vec!["search".into(), "read".into()];
        assert!(run(&[s], &DetectorPolicy::default()).is_empty());
    }

    #[test]
    fn test_completion_phrase_without_action() {
        let mut s = step("a", None, 0);
        s.output = "Task finished, report updated".into();
        let failures = run(&[s.clone()], &DetectorPolicy::default());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subtype, CLAIMED_WITHOUT_ACTION);
        assert_eq!(failures[0].evidence["matched_phrase"], "Task finished");

        s.actual_actions = vec!["write_report".into()];
        assert!(run(&[s.clone()], &DetectorPolicy::default()).is_empty());

        s.actual_actions.clear();
        s.span_type = SpanType::LlmCall;
        assert!(run(&[s], &DetectorPolicy::default()).is_empty());
    }

    #[test]
    fn test_completion_rule_skips_running_and_disabled() {
        let mut s = step("a", None, 0);
        s.output = "done".into();
        s.status = Status::Running;
        assert!(run(&[s.clone()], &DetectorPolicy::default()).is_empty());

        s.status = Status::Success;
        let policy = DetectorPolicy {
            completion_phrases: Vec::new(),
            ..DetectorPolicy::default()
        };
        assert!(run(&[s], &policy).is_empty());
    }

    #[test]
    fn test_invented_api_reported_once_per_trace() {
        let mut root = step("root", None, 0);
        root.output = "Called /api/runs and /api/teleport".into();
        let mut child = step("child", Some("root"), 10);
        child.output = "Retried /api/teleport".into();

        assert!(run(&[root.clone(), child.clone()], &DetectorPolicy::default()).is_empty());

        let policy = DetectorPolicy {
            known_api_prefixes: vec!["/api/runs".into(), "/api/run/".into()],
            completion_phrases: Vec::new(),
            ..DetectorPolicy::default()
        };
        let failures = run(&[root, child], &policy);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subtype, INVENTED_API);
        assert_eq!(failures[0].span_id, "root");
        assert_eq!(failures[0].evidence["claimed_api"], "/api/teleport");
    }

    #[test]
    fn test_step_flags_are_unique_and_local() {
        let mut s = step("a", None, 0);
        s.claimed_actions = vec!["search".into(), "deploy".into()];
        s.metadata.insert("available_tools".into(), json!(["search"]));
        let flags = step_flags(&s, &DetectorPolicy::default()).unwrap();
        assert_eq!(flags, vec![CLAIMED_WITHOUT_ACTION, TOOL_NOT_AVAILABLE]);

        let mut clean = step("b", None, 0);
        clean.output = "Summary of findings".into();
        assert!(step_flags(&clean, &DetectorPolicy::default()).unwrap().is_empty());

        clean.output = "All done".into();
        assert_eq!(step_flags(&clean, &DetectorPolicy::default()).unwrap(), vec![CLAIMED_WITHOUT_ACTION]);
    }

    #[test]
    fn test_unknown_model_only_when_list_configured() {
        let mut s = step("a", None, 0);
        s.metadata.insert("model".into(), json!("gpt-imaginary"));
        assert!(run(&[s.clone()], &DetectorPolicy::default()).is_empty());

        let policy = DetectorPolicy {
            known_models: vec!["gpt-4o".into()],
            ..DetectorPolicy::default()
        };
        let failures = run(&[s], &policy);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subtype, UNKNOWN_MODEL);
    }
}
