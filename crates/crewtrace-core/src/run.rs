//! Run aggregate record.

use serde::{Deserialize, Serialize};

use crate::Status;

/// Aggregate view over all steps of one run.
///
/// Every field except `id` and `created_at` is derived from the run's steps
/// and recomputed on each upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier supplied by the instrumented system.
    pub id: String,
    pub status: Status,
    pub num_steps: u32,
    pub num_success: u32,
    pub num_failed: u32,
    pub num_running: u32,
    /// Duration of the primary trace's root span, in milliseconds.
    pub duration: u64,
    /// Summed step cost in USD.
    pub cost: f64,
    pub total_tokens: u64,
    /// Share of steps with no hallucination flag, in `[0, 1]`.
    pub integrity_score: f64,
    /// Unix timestamp (milliseconds) of the run's first step.
    pub created_at: i64,
    /// Bumped on every effective change to the run's steps.
    pub revision: u64,
}

impl Run {
    /// An empty run created lazily for its first step.
    pub fn new(id: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            status: Status::Running,
            num_steps: 0,
            num_success: 0,
            num_failed: 0,
            num_running: 0,
            duration: 0,
            cost: 0.0,
            total_tokens: 0,
            integrity_score: 1.0,
            created_at,
            revision: 0,
        }
    }
}
