use crewtrace_config::{AgentContract, DetectorPolicy, FieldRequirement};
use crewtrace_core::{CoordinationFailure, FailureType, Severity, SpanType, Status, Step};
use serde_json::json;

use super::context::parse_object;
use super::{failure, Analyzer, AnalyzerError};
use crate::tree::Trace;

/// Checks span-type field requirements and per-agent contracts.
pub struct ContractViolationAnalyzer;

impl Analyzer for ContractViolationAnalyzer {
    fn name(&self) -> &'static str {
        "contract_violation"
    }

    fn analyze(
        &self,
        trace: &Trace,
        policy: &DetectorPolicy,
    ) -> Result<Vec<CoordinationFailure>, AnalyzerError> {
        let mut failures = Vec::new();

        for idx in 0..trace.len() {
            let span = trace.span(idx);

            if span.span_type == SpanType::Root && span.parent_ref.is_some() {
                failures.push(violation(
                    "ROOT_HAS_PARENT",
                    span,
                    format!("Root span '{}' declares a parent", span.agent_name),
                    json!({ "parent_ref": span.parent_ref }),
                ));
            }

            if span.is_terminal() {
                let required = policy
                    .span_requirements
                    .get(&span.span_type)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for requirement in required.iter().filter(|r| !satisfies(span, r)) {
                    failures.push(violation(
                        "MISSING_REQUIRED_FIELD",
                        span,
                        format!(
                            "{} span '{}' is missing '{}'",
                            span.span_type.as_str(),
                            span.agent_name,
                            requirement
                        ),
                        json!({ "span_type": span.span_type, "field": requirement.to_string() }),
                    ));
                }
            }

            if let Some(contract) = policy.agent_contracts.get(&span.agent_name) {
                check_contract(trace, idx, contract, &mut failures);
            }
        }

        Ok(failures)
    }
}

fn check_contract(trace: &Trace, idx: usize, contract: &AgentContract, failures: &mut Vec<CoordinationFailure>) {
    let span = trace.span(idx);

    if let Some(expected) = &contract.expected_parent {
        let actual = trace.parent(idx).map(|p| trace.span(p).agent_name.as_str());
        if actual != Some(expected.as_str()) {
            failures.push(violation(
                "WRONG_PARENT",
                span,
                format!("Agent '{}' should run under '{}'", span.agent_name, expected),
                json!({ "expected_parent": expected, "actual_parent": actual }),
            ));
        }
    }

    check_order(trace, idx, contract, failures);

    if !span.is_terminal() {
        return;
    }

    if let Some(max) = contract.max_duration_ms {
        if span.duration_ms > max {
            failures.push(violation(
                "DURATION_EXCEEDED",
                span,
                format!("Agent '{}' took {}ms, limit is {}ms", span.agent_name, span.duration_ms, max),
                json!({ "duration_ms": span.duration_ms, "max_duration_ms": max }),
            ));
        }
    }

    if span.status == Status::Success && !contract.required_output_keys.is_empty() {
        let output = parse_object(&span.output);
        for key in &contract.required_output_keys {
            if output.as_ref().is_some_and(|o| o.contains_key(key)) {
                continue;
            }
            failures.push(violation(
                "MISSING_OUTPUT_KEY",
                span,
                format!("Agent '{}' output lacks '{}'", span.agent_name, key),
                json!({ "key": key }),
            ));
        }
    }
}

/// `must_run_first` and `must_run_after`. Predecessors absent from the trace
/// are not checked.
fn check_order(trace: &Trace, idx: usize, contract: &AgentContract, failures: &mut Vec<CoordinationFailure>) {
    let span = trace.span(idx);
    let start = span.effective_start();

    if contract.must_run_first {
        let earlier = trace
            .spans()
            .iter()
            .filter(|s| s.span_type == SpanType::Agent && s.agent_name != span.agent_name)
            .filter(|s| s.effective_start() < start)
            .min_by(|a, b| a.effective_start().cmp(&b.effective_start()).then_with(|| a.id.cmp(&b.id)));
        if let Some(first) = earlier {
            failures.push(out_of_order(
                span,
                format!("Agent '{}' must run first but '{}' started earlier", span.agent_name, first.agent_name),
                json!({
                    "first_agent": first.agent_name,
                    "contract": format!("{}.must_run_first", span.agent_name),
                }),
            ));
        }
    }

    for predecessor in &contract.must_run_after {
        let runs: Vec<&Step> = trace.spans().iter().filter(|s| &s.agent_name == predecessor).collect();
        if runs.is_empty() {
            continue;
        }
        let unfinished = runs.iter().find(|s| !s.is_terminal());
        let overlapping = runs.iter().map(|s| finish_time(s)).filter(|&end| start < end).max();
        let detail = match (unfinished, overlapping) {
            (Some(_), _) => json!({ "predecessor": predecessor, "predecessor_status": "running" }),
            (None, Some(end)) => json!({ "predecessor": predecessor, "predecessor_end": end, "start": start }),
            (None, None) => continue,
        };
        failures.push(out_of_order(
            span,
            format!("Agent '{}' must run after '{}' finishes", span.agent_name, predecessor),
            detail,
        ));
    }
}

/// End time, else start plus duration.
fn finish_time(span: &Step) -> i64 {
    span.end_time.unwrap_or_else(|| {
        let duration = i64::try_from(span.duration_ms).unwrap_or(i64::MAX);
        span.effective_start().saturating_add(duration)
    })
}

fn satisfies(span: &Step, requirement: &FieldRequirement) -> bool {
    match requirement {
        FieldRequirement::Tokens => !span.tokens.is_empty(),
        FieldRequirement::Cost => span.cost_usd > 0.0,
        FieldRequirement::Output => !span.output.trim().is_empty(),
        FieldRequirement::EndTime => span.end_time.is_some(),
        FieldRequirement::Metadata(key) => span.metadata_value(key).is_some(),
    }
}

fn violation(subtype: &str, span: &Step, message: String, evidence: serde_json::Value) -> CoordinationFailure {
    failure(FailureType::ContractViolation, subtype, Severity::Low, span, message, evidence)
}

fn out_of_order(span: &Step, message: String, evidence: serde_json::Value) -> CoordinationFailure {
    failure(FailureType::ContractViolation, "EXECUTION_ORDER", Severity::High, span, message, evidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Forest;
    use crewtrace_core::TokenUsage;
    use std::collections::BTreeMap;

    fn subtypes(steps: &[Step], policy: &DetectorPolicy) -> Vec<String> {
        let forest = Forest::build(steps);
        ContractViolationAnalyzer
            .analyze(forest.primary().unwrap(), policy)
            .unwrap()
            .into_iter()
            .map(|f| f.subtype)
            .collect()
    }

    fn llm_call(status: Status) -> Step {
        let mut s = Step::new("llm", "run-1", "llm");
        s.span_type = SpanType::LlmCall;
        s.status = status;
        s
    }

    #[test]
    fn test_llm_call_requirements() {
        let policy = DetectorPolicy::default();
        let bare = llm_call(Status::Success);
        assert_eq!(subtypes(&[bare], &policy), vec!["MISSING_REQUIRED_FIELD", "MISSING_REQUIRED_FIELD"]);

        let mut complete = llm_call(Status::Success);
        complete.tokens = TokenUsage::new(10, 2);
        complete.metadata.insert("model".into(), json!("gpt-4o"));
        assert!(subtypes(&[complete], &policy).is_empty());
    }

    #[test]
    fn test_running_spans_skip_requirements() {
        assert!(subtypes(&[llm_call(Status::Running)], &DetectorPolicy::default()).is_empty());
    }

    #[test]
    fn test_root_with_parent() {
        let mut s = Step::new("r", "run-1", "entry");
        s.span_type = SpanType::Root;
        s.parent_ref = Some("missing".into());
        assert_eq!(subtypes(&[s], &DetectorPolicy::default()), vec!["ROOT_HAS_PARENT"]);
    }

    #[test]
    fn test_agent_contracts() {
        let policy = DetectorPolicy {
            agent_contracts: BTreeMap::from([(
                "writer".to_string(),
                AgentContract {
                    max_duration_ms: Some(1_000),
                    expected_parent: Some("editor".into()),
                    required_output_keys: vec!["draft".into(), "title".into()],
                    ..AgentContract::default()
                },
            )]),
            ..DetectorPolicy::default()
        };

        let mut planner = Step::new("p", "run-1", "planner");
        planner.status = Status::Success;
        let mut writer = Step::new("w", "run-1", "writer");
        writer.parent_ref = Some("planner".into());
        writer.start_time = Some(1);
        writer.status = Status::Success;
        writer.duration_ms = 5_000;
        writer.output = r#"{"draft": "..."}"#.into();

        assert_eq!(
            subtypes(&[planner, writer], &policy),
            vec!["WRONG_PARENT", "DURATION_EXCEEDED", "MISSING_OUTPUT_KEY"]
        );
    }

    fn agent(id: &str, name: &str, start: i64, end: Option<i64>) -> Step {
        let mut s = Step::new(id, "run-1", name);
        s.parent_ref = (id != "root").then(|| "root".to_string());
        s.start_time = Some(start);
        s.end_time = end;
        s.status = if end.is_some() { Status::Success } else { Status::Running };
        s
    }

    fn ordering(name: &str, contract: AgentContract) -> DetectorPolicy {
        DetectorPolicy {
            agent_contracts: BTreeMap::from([(name.to_string(), contract)]),
            ..DetectorPolicy::default()
        }
    }

    #[test]
    fn test_must_run_first() {
        let policy = ordering(
            "analyzer",
            AgentContract {
                must_run_first: true,
                ..AgentContract::default()
            },
        );
        let mut root = agent("root", "workflow", 0, Some(100));
        root.span_type = SpanType::Root;

        let late = [root.clone(), agent("c", "collector", 10, Some(20)), agent("a", "analyzer", 30, Some(40))];
        assert_eq!(subtypes(&late, &policy), vec!["EXECUTION_ORDER"]);

        let early = [root, agent("a", "analyzer", 10, Some(20)), agent("c", "collector", 30, Some(40))];
        assert!(subtypes(&early, &policy).is_empty());
    }

    #[test]
    fn test_must_run_after() {
        let policy = ordering(
            "reporter",
            AgentContract {
                must_run_after: vec!["analyzer".into(), "data_collector".into()],
                ..AgentContract::default()
            },
        );
        let root = agent("root", "workflow", 0, Some(1_000));

        let ordered = [root.clone(), agent("a", "analyzer", 10, Some(50)), agent("r", "reporter", 60, Some(90))];
        assert!(subtypes(&ordered, &policy).is_empty());

        let overlapping = [root.clone(), agent("a", "analyzer", 10, Some(80)), agent("r", "reporter", 60, Some(90))];
        assert_eq!(subtypes(&overlapping, &policy), vec!["EXECUTION_ORDER"]);

        let unfinished = [root, agent("a", "analyzer", 10, None), agent("r", "reporter", 60, Some(90))];
        let forest = Forest::build(&unfinished);
        let failures = ContractViolationAnalyzer
            .analyze(forest.primary().unwrap(), &policy)
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].severity, Severity::High);
        assert_eq!(failures[0].evidence["predecessor"], "analyzer");
    }
}
