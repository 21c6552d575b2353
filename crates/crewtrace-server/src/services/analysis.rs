//! Per-run cache of reconstructed traces and coordination reports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crewtrace_config::DetectorPolicy;
use crewtrace_core::Run;
use crewtrace_engine::{CoordinationReport, Detector, Forest, HealthSummary};
use crewtrace_monitor::{StepStore, StoreError};
use dashmap::DashMap;
use tracing::debug;

/// Tree and analysis of one run at one revision.
#[derive(Debug)]
pub struct RunSnapshot {
    pub revision: u64,
    pub forest: Forest,
    /// Analysis of the primary tree.
    pub report: CoordinationReport,
}

/// Builds snapshots on demand and reuses them until the run's revision moves.
///
/// At most `capacity` runs are cached; the least recently used is evicted.
pub struct AnalysisService {
    detector: Detector,
    capacity: usize,
    clock: AtomicU64,
    // Value: (snapshot, last use tick)
    cache: DashMap<String, (Arc<RunSnapshot>, AtomicU64)>,
}

impl AnalysisService {
    pub fn new(policy: DetectorPolicy, capacity: usize) -> Self {
        Self {
            detector: Detector::new(policy),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            cache: DashMap::new(),
        }
    }

    pub fn cached_runs(&self) -> usize {
        self.cache.len()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn snapshot(&self, store: &StepStore, run: &Run) -> Result<Arc<RunSnapshot>, StoreError> {
        if let Some(cached) = self.cache.get(&run.id) {
            let (snapshot, last_used) = cached.value();
            if snapshot.revision == run.revision {
                last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(snapshot.clone());
            }
        }

        let steps = store.list_steps(&run.id)?;
        let forest = Forest::build(&steps);
        let report = match forest.primary() {
            Some(trace) => self.detector.analyze(trace),
            None => clean_report(self.detector.policy()),
        };
        debug!(
            run_id = %run.id,
            revision = run.revision,
            trees = forest.trees.len(),
            failures = report.failures.len(),
            "Run snapshot rebuilt"
        );

        let snapshot = Arc::new(RunSnapshot {
            revision: run.revision,
            forest,
            report,
        });
        self.cache
            .insert(run.id.clone(), (snapshot.clone(), AtomicU64::new(self.tick())));
        self.evict();
        Ok(snapshot)
    }

    fn evict(&self) {
        while self.cache.len() > self.capacity {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|entry| entry.value().1.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());
            let Some(run_id) = oldest else {
                break;
            };
            debug!(run_id = %run_id, "Run snapshot evicted");
            self.cache.remove(&run_id);
        }
    }
}

fn clean_report(policy: &DetectorPolicy) -> CoordinationReport {
    CoordinationReport {
        summary: HealthSummary::from_failures(&[], &policy.weights),
        failures: Vec::new(),
        has_failures: false,
        internal_errors: 0,
        failed_analyzers: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewtrace_core::{Status, Step};

    #[test]
    fn test_snapshot_reused_until_revision_changes() {
        let store = StepStore::in_memory().unwrap();
        let mut run = Run::new("run-1", 0);
        run.revision = 1;
        let mut step = Step::new("s1", "run-1", "writer");
        step.status = Status::Error;
        step.output = "Completed successfully".into();
        store.save(&step, &run).unwrap();

        let service = AnalysisService::new(DetectorPolicy::default(), 8);
        let first = service.snapshot(&store, &run).unwrap();
        let again = service.snapshot(&store, &run).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(first.report.has_failures);

        run.revision = 2;
        let fresh = service.snapshot(&store, &run).unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(fresh.revision, 2);
    }

    #[test]
    fn test_empty_run_reports_full_health() {
        let store = StepStore::in_memory().unwrap();
        let service = AnalysisService::new(DetectorPolicy::default(), 8);
        let snapshot = service.snapshot(&store, &Run::new("empty", 0)).unwrap();
        assert_eq!(snapshot.report.summary.health_score, 100);
        assert!(snapshot.forest.trees.is_empty());
    }

    #[test]
    fn test_least_recently_used_run_is_evicted() {
        let store = StepStore::in_memory().unwrap();
        let service = AnalysisService::new(DetectorPolicy::default(), 2);
        let runs: Vec<Run> = (0..3).map(|i| Run::new(format!("run-{i}"), i)).collect();

        let first = service.snapshot(&store, &runs[0]).unwrap();
        service.snapshot(&store, &runs[1]).unwrap();
        // Touch run-0 so run-1 becomes the oldest.
        assert!(Arc::ptr_eq(&first, &service.snapshot(&store, &runs[0]).unwrap()));
        service.snapshot(&store, &runs[2]).unwrap();

        assert_eq!(service.cached_runs(), 2);
        assert!(Arc::ptr_eq(&first, &service.snapshot(&store, &runs[0]).unwrap()));
        assert!(service.cache.get("run-1").is_none());
        assert!(service.cache.get("run-2").is_some());
    }
}
