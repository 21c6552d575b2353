//! Run aggregate recomputation.

use crewtrace_core::{Run, Status, Step};
use crewtrace_engine::Forest;

/// Recomputes every derived field of `run` from the run's current steps.
///
/// `id`, `created_at` and `revision` are carried over unchanged. The
/// integrity score is the share of steps carrying no hallucination flag.
pub fn recompute(run: &Run, steps: &[Step]) -> Run {
    let mut next = Run::new(run.id.clone(), run.created_at);
    next.revision = run.revision;

    for step in steps {
        next.num_steps += 1;
        match step.status {
            Status::Running => next.num_running += 1,
            Status::Success => next.num_success += 1,
            Status::Error => next.num_failed += 1,
        }
        next.cost += step.cost_usd;
        next.total_tokens = next.total_tokens.saturating_add(step.tokens.total);
    }

    let flagged = steps.iter().filter(|s| s.is_flagged()).count();
    next.integrity_score = if steps.is_empty() {
        1.0
    } else {
        1.0 - flagged as f64 / steps.len() as f64
    };

    next.status = if next.num_failed > 0 {
        Status::Error
    } else if next.num_running > 0 || steps.is_empty() {
        Status::Running
    } else {
        Status::Success
    };

    next.duration = Forest::build(steps)
        .primary()
        .map(|trace| trace.total_duration_ms())
        .unwrap_or(0);

    next
}
