//! Span tree reconstruction.
//!
//! Steps reference their parent by id or agent name. The builder resolves
//! those references into an arena per tree (flat spans plus index-based
//! parent/children lists). Nested output is a projection built on demand.

use std::collections::HashMap;

use crewtrace_core::Step;
use serde::Serialize;
use tracing::{debug, warn};

/// A data-quality problem found while building trees. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceIssue {
    /// The span's parent link closed a cycle and was cut; the span became a root.
    Cycle { span_id: String, parent_ref: String },
    /// The span's parent reference matched no step in the run.
    UnresolvedParent { span_id: String, parent_ref: String },
}

impl TraceIssue {
    fn span_id(&self) -> &str {
        match self {
            TraceIssue::Cycle { span_id, .. } | TraceIssue::UnresolvedParent { span_id, .. } => span_id,
        }
    }
}

/// One rooted tree of spans. Index 0 is the root; spans are stored in pre-order.
#[derive(Debug, Clone)]
pub struct Trace {
    spans: Vec<Step>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    depths: Vec<usize>,
    /// True when a cycle was broken inside this tree.
    pub malformed: bool,
    pub issues: Vec<TraceIssue>,
}

impl Trace {
    pub fn root(&self) -> &Step {
        &self.spans[0]
    }

    pub fn spans(&self) -> &[Step] {
        &self.spans
    }

    pub fn span(&self, idx: usize) -> &Step {
        &self.spans[idx]
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn parent(&self, idx: usize) -> Option<usize> {
        self.parents[idx]
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    pub fn depth(&self, idx: usize) -> usize {
        self.depths[idx]
    }

    /// The span itself followed by each ancestor up to the root.
    pub fn ancestors_inclusive(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(idx), move |&i| self.parents[i])
    }

    /// Earliest effective start time of any span in the tree.
    pub fn start_time(&self) -> i64 {
        self.spans
            .iter()
            .map(Step::effective_start)
            .min()
            .unwrap_or_default()
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.root().duration_ms
    }

    pub fn total_tokens(&self) -> u64 {
        self.spans
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(s.tokens.total))
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.spans.iter().map(|s| s.cost_usd).sum()
    }

    /// Nested projection of the tree for display.
    pub fn to_tree(&self) -> SpanNode {
        self.node(0, self.root().effective_start())
    }

    fn node(&self, idx: usize, origin: i64) -> SpanNode {
        let span = self.spans[idx].clone();
        SpanNode {
            start_offset_ms: span.effective_start().saturating_sub(origin),
            depth: self.depths[idx],
            children: self.children[idx].iter().map(|&c| self.node(c, origin)).collect(),
            span,
        }
    }
}

/// Nested view of a span and its descendants.
#[derive(Debug, Clone, Serialize)]
pub struct SpanNode {
    #[serde(flatten)]
    pub span: Step,
    pub depth: usize,
    /// Milliseconds since the root started.
    pub start_offset_ms: i64,
    pub children: Vec<SpanNode>,
}

impl SpanNode {
    /// Number of spans in this subtree.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(SpanNode::count).sum::<usize>()
    }
}

/// All trees reconstructed from one run, ordered by start time.
#[derive(Debug, Clone, Default)]
pub struct Forest {
    pub trees: Vec<Trace>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    OnPath,
    Done,
}

impl Forest {
    /// Builds every tree for a run's steps. No step is dropped: unresolved
    /// parents become roots and cyclic links are cut.
    pub fn build(steps: &[Step]) -> Self {
        let mut order: Vec<usize> = (0..steps.len()).collect();
        order.sort_by(|&a, &b| {
            let (sa, sb) = (&steps[a], &steps[b]);
            sa.effective_start()
                .cmp(&sb.effective_start())
                .then_with(|| sa.id.cmp(&sb.id))
        });

        let mut by_id: HashMap<&str, usize> = HashMap::new();
        let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
        for &i in &order {
            by_id.insert(steps[i].id.as_str(), i);
            by_name.entry(steps[i].agent_name.as_str()).or_default().push(i);
        }

        let mut issues = Vec::new();
        let mut parents: Vec<Option<usize>> = vec![None; steps.len()];
        for &i in &order {
            let Some(reference) = steps[i].parent_ref.as_deref() else { continue };
            let resolved = by_id.get(reference).copied().or_else(|| {
                // Latest-started step with that name, excluding the step itself.
                by_name
                    .get(reference)
                    .and_then(|candidates| candidates.iter().rev().find(|&&c| c != i).copied())
            });
            match resolved {
                Some(p) if p != i => parents[i] = Some(p),
                Some(_) => issues.push(TraceIssue::Cycle {
                    span_id: steps[i].id.clone(),
                    parent_ref: reference.to_string(),
                }),
                None => issues.push(TraceIssue::UnresolvedParent {
                    span_id: steps[i].id.clone(),
                    parent_ref: reference.to_string(),
                }),
            }
        }

        break_cycles(steps, &order, &mut parents, &mut issues);

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for &i in &order {
            if let Some(p) = parents[i] {
                children[p].push(i);
            }
        }

        let mut trees: Vec<Trace> = order
            .iter()
            .filter(|&&i| parents[i].is_none())
            .map(|&root| assemble(steps, root, &children, &issues))
            .collect();
        trees.sort_by(|a, b| {
            a.start_time()
                .cmp(&b.start_time())
                .then_with(|| a.root().id.cmp(&b.root().id))
        });

        if !issues.is_empty() {
            warn!(
                issue_count = issues.len(),
                tree_count = trees.len(),
                "Span tree built with data-quality issues"
            );
        }
        debug!(spans = steps.len(), trees = trees.len(), "Built span forest");

        Self { trees }
    }

    /// The most recently started tree.
    pub fn primary(&self) -> Option<&Trace> {
        self.trees.iter().max_by_key(|t| t.start_time())
    }

    pub fn total_spans(&self) -> usize {
        self.trees.iter().map(Trace::len).sum()
    }

    pub fn is_malformed(&self) -> bool {
        self.trees.iter().any(|t| t.malformed)
    }

    pub fn issues(&self) -> impl Iterator<Item = &TraceIssue> {
        self.trees.iter().flat_map(|t| t.issues.iter())
    }
}

/// Walks each node toward its ancestors and cuts the link that closes a loop.
fn break_cycles(
    steps: &[Step],
    order: &[usize],
    parents: &mut [Option<usize>],
    issues: &mut Vec<TraceIssue>,
) {
    let mut state = vec![Visit::New; steps.len()];
    for &start in order {
        let mut path: Vec<usize> = Vec::new();
        let mut cur = start;
        loop {
            match state[cur] {
                Visit::Done => break,
                Visit::OnPath => {
                    if let Some(&last) = path.last() {
                        parents[last] = None;
                        issues.push(TraceIssue::Cycle {
                            span_id: steps[last].id.clone(),
                            parent_ref: steps[last].parent_ref.clone().unwrap_or_default(),
                        });
                    }
                    break;
                }
                Visit::New => {
                    state[cur] = Visit::OnPath;
                    path.push(cur);
                    match parents[cur] {
                        Some(p) => cur = p,
                        None => break,
                    }
                }
            }
        }
        for i in path {
            state[i] = Visit::Done;
        }
    }
}

/// Copies the subtree under `root` into a pre-order arena.
fn assemble(steps: &[Step], root: usize, children: &[Vec<usize>], issues: &[TraceIssue]) -> Trace {
    let mut spans = Vec::new();
    let mut parents = Vec::new();
    let mut depths = Vec::new();
    let mut local_children: Vec<Vec<usize>> = Vec::new();

    // (global index, local parent, depth)
    let mut stack = vec![(root, None::<usize>, 0usize)];
    while let Some((global, parent, depth)) = stack.pop() {
        let local = spans.len();
        spans.push(steps[global].clone());
        parents.push(parent);
        depths.push(depth);
        local_children.push(Vec::new());
        if let Some(p) = parent {
            local_children[p].push(local);
        }
        for &c in children[global].iter().rev() {
            stack.push((c, Some(local), depth + 1));
        }
    }

    let tree_issues: Vec<TraceIssue> = issues
        .iter()
        .filter(|issue| spans.iter().any(|s| s.id == issue.span_id()))
        .cloned()
        .collect();
    let malformed = tree_issues
        .iter()
        .any(|issue| matches!(issue, TraceIssue::Cycle { .. }));

    Trace {
        spans,
        parents,
        children: local_children,
        depths,
        malformed,
        issues: tree_issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewtrace_core::Status;

    fn step(id: &str, name: &str, parent: Option<&str>, start: i64) -> Step {
        let mut s = Step::new(id, "run-1", name);
        s.parent_ref = parent.map(String::from);
        s.start_time = Some(start);
        s.status = Status::Success;
        s
    }

    #[test]
    fn test_builds_single_tree_by_name_and_id() {
        let steps = vec![
            step("c", "summarizer", Some("a"), 20),
            step("a", "collector", None, 10),
            step("b", "synthesizer", Some("collector"), 30),
        ];
        let forest = Forest::build(&steps);
        assert_eq!(forest.trees.len(), 1);
        let trace = &forest.trees[0];
        assert_eq!(trace.root().id, "a");
        let child_ids: Vec<&str> = trace.children(0).iter().map(|&c| trace.span(c).id.as_str()).collect();
        assert_eq!(child_ids, vec!["c", "b"]);
        assert!(!trace.malformed);
        assert!(trace.issues.is_empty());
    }

    #[test]
    fn test_unresolved_parent_becomes_root() {
        let steps = vec![step("a", "collector", None, 10), step("b", "writer", Some("ghost"), 20)];
        let forest = Forest::build(&steps);
        assert_eq!(forest.trees.len(), 2);
        assert_eq!(forest.total_spans(), 2);
        assert_eq!(
            forest.issues().collect::<Vec<_>>(),
            vec![&TraceIssue::UnresolvedParent {
                span_id: "b".into(),
                parent_ref: "ghost".into()
            }]
        );
        assert!(!forest.is_malformed());
    }

    #[test]
    fn test_cycle_is_broken_and_flagged() {
        let steps = vec![
            step("a", "one", Some("c"), 10),
            step("b", "two", Some("a"), 20),
            step("c", "three", Some("b"), 30),
        ];
        let forest = Forest::build(&steps);
        assert_eq!(forest.total_spans(), 3);
        assert_eq!(forest.trees.len(), 1);
        let trace = &forest.trees[0];
        assert!(trace.malformed);
        // Walking from "a" reaches a -> c -> b -> a; the link b -> a is cut.
        assert_eq!(trace.root().id, "b");
        assert!(matches!(trace.issues[0], TraceIssue::Cycle { ref span_id, .. } if span_id == "b"));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let steps = vec![step("a", "loner", Some("a"), 10)];
        let forest = Forest::build(&steps);
        assert_eq!(forest.trees.len(), 1);
        assert!(forest.is_malformed());
    }

    #[test]
    fn test_primary_is_latest_started_tree() {
        let steps = vec![
            step("old", "collector", None, 10),
            step("new", "collector-rerun", None, 500),
            step("x", "child", Some("old"), 20),
        ];
        let forest = Forest::build(&steps);
        assert_eq!(forest.trees.len(), 2);
        assert_eq!(forest.trees[0].root().id, "old");
        assert_eq!(forest.primary().unwrap().root().id, "new");
    }

    #[test]
    fn test_conservation_with_duplicate_names() {
        let steps = vec![
            step("r", "root", None, 0),
            step("w1", "worker", Some("r"), 10),
            step("w2", "worker", Some("r"), 20),
            step("f", "fixer", Some("worker"), 30),
            step("o", "orphan", Some("nobody"), 40),
        ];
        let forest = Forest::build(&steps);
        assert_eq!(forest.total_spans(), steps.len());
        let trace = &forest.trees[0];
        // "worker" resolves to the latest-started worker.
        let fixer = trace.spans().iter().position(|s| s.id == "f").unwrap();
        assert_eq!(trace.span(trace.parent(fixer).unwrap()).id, "w2");
        assert_eq!(trace.depth(fixer), 2);
    }

    #[test]
    fn test_totals_and_projection() {
        let mut root = step("a", "collector", None, 1_000);
        root.duration_ms = 900;
        root.cost_usd = 0.5;
        root.tokens.total = 10;
        let mut child = step("b", "writer", Some("a"), 1_250);
        child.cost_usd = 0.25;
        child.tokens.total = 5;
        let forest = Forest::build(&[root, child]);
        let trace = forest.primary().unwrap();
        assert_eq!(trace.total_duration_ms(), 900);
        assert_eq!(trace.total_tokens(), 15);
        assert!((trace.total_cost_usd() - 0.75).abs() < 1e-9);

        let tree = trace.to_tree();
        assert_eq!(tree.count(), 2);
        assert_eq!(tree.children[0].start_offset_ms, 250);
        assert_eq!(tree.children[0].depth, 1);
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["agent_name"], "collector");
        assert_eq!(json["children"][0]["id"], "b");
    }

    #[test]
    fn test_token_total_saturates() {
        let mut root = step("a", "collector", None, 0);
        root.tokens.total = u64::MAX;
        let mut child = step("b", "writer", Some("a"), 10);
        child.tokens.total = 1;
        let forest = Forest::build(&[root, child]);
        assert_eq!(forest.primary().unwrap().total_tokens(), u64::MAX);
    }

    #[test]
    fn test_cycle_through_long_chain_keeps_every_span() {
        let steps = vec![
            step("a", "one", Some("d"), 10),
            step("b", "two", Some("a"), 20),
            step("c", "three", Some("b"), 30),
            step("d", "four", Some("c"), 40),
            step("e", "five", Some("b"), 50),
        ];
        let forest = Forest::build(&steps);
        assert_eq!(forest.total_spans(), 5);
        assert_eq!(forest.issues().filter(|i| matches!(i, TraceIssue::Cycle { .. })).count(), 1);
    }
}
