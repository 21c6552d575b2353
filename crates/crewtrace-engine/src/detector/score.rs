//! Health score reduction.

use std::collections::BTreeMap;

use crewtrace_config::SeverityWeights;
use crewtrace_core::{CoordinationFailure, FailureType, Severity};
use serde::Serialize;

/// Aggregated view of a failure set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    /// 0 (unhealthy) to 100 (no failures).
    pub health_score: u8,
    pub total_failures: usize,
    /// Count of high-severity failures.
    pub critical_issues: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_type: BTreeMap<FailureType, usize>,
}

impl HealthSummary {
    pub fn from_failures(failures: &[CoordinationFailure], weights: &SeverityWeights) -> Self {
        let mut by_severity: BTreeMap<Severity, usize> = Severity::ALL.iter().map(|s| (*s, 0)).collect();
        let mut by_type: BTreeMap<FailureType, usize> = FailureType::ALL.iter().map(|t| (*t, 0)).collect();
        for f in failures {
            *by_severity.entry(f.severity).or_default() += 1;
            *by_type.entry(f.failure_type).or_default() += 1;
        }

        Self {
            health_score: health_score(failures, weights),
            total_failures: failures.len(),
            critical_issues: by_severity[&Severity::High],
            by_severity,
            by_type,
        }
    }
}

/// `100 - Σ weight(severity)`, clamped to `[0, 100]`.
pub fn health_score(failures: &[CoordinationFailure], weights: &SeverityWeights) -> u8 {
    let deduction = failures
        .iter()
        .fold(0u32, |acc, f| acc.saturating_add(weights.weight(f.severity)));
    100u32.saturating_sub(deduction) as u8
}
