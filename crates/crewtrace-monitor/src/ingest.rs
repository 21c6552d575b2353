//! Serialized per-run ingestion of step events.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use crewtrace_config::DetectorPolicy;
use crewtrace_core::{Run, Status, Step};
use crewtrace_engine::step_flags;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate;
use crate::event::{StepEvent, StepUpdate, ValidationError};
use crate::merge::{self, MergeOutcome, StatusChange};
use crate::store::{StepStore, StoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("step '{step_id}' belongs to run '{existing_run}', not '{incoming_run}'")]
    RunMismatch {
        step_id: String,
        existing_run: String,
        incoming_run: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of ingesting one event.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// The step as stored after the merge.
    pub step: Step,
    /// The run aggregate after the merge.
    pub run: Run,
    pub created: bool,
    /// False when the event changed nothing and nothing was written.
    pub changed: bool,
    pub status_change: StatusChange,
}

/// Applies events to the store, one run at a time.
///
/// Lock entries live only while some event for the run is in flight.
pub struct Ingestor {
    store: Arc<StepStore>,
    policy: DetectorPolicy,
    run_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Ingestor {
    pub fn new(store: Arc<StepStore>) -> Self {
        Self::with_policy(store, DetectorPolicy::default())
    }

    /// Uses `policy` for the per-step hallucination flags.
    pub fn with_policy(store: Arc<StepStore>, policy: DetectorPolicy) -> Self {
        Self {
            store,
            policy,
            run_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &StepStore {
        &self.store
    }

    /// Validates a wire event and ingests it.
    pub fn ingest_event(&self, event: StepEvent) -> Result<IngestOutcome, IngestError> {
        self.ingest(event.validate()?)
    }

    /// Ingests an event received now.
    pub fn ingest(&self, update: StepUpdate) -> Result<IngestOutcome, IngestError> {
        self.ingest_at(update, Utc::now().timestamp_millis())
    }

    /// Ingests an event received at `received_at` (epoch ms), which orders it
    /// unless the event carries its own `sequence`.
    pub fn ingest_at(&self, update: StepUpdate, received_at: i64) -> Result<IngestOutcome, IngestError> {
        let run_id = update.run_id.clone();
        let lock = self.run_lock(&run_id);
        let result = {
            // Each save is one transaction; a poisoned guard protects no state.
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.ingest_locked(&update, received_at)
        };
        // Two owners left: the map and this call.
        self.run_locks.remove_if(&run_id, |_, l| Arc::strong_count(l) == 2);
        result
    }

    /// Number of runs with an event in flight.
    pub fn active_runs(&self) -> usize {
        self.run_locks.len()
    }

    fn ingest_locked(&self, update: &StepUpdate, received_at: i64) -> Result<IngestOutcome, IngestError> {
        let (mut step, created, mut merged) = match self.locate(update)? {
            Some(mut step) => {
                let merged = merge::apply(&mut step, update, received_at);
                (step, false, merged)
            }
            None => {
                let id = update.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
                let step = merge::create(id, update, received_at);
                let merged = MergeOutcome {
                    changed: true,
                    status_change: StatusChange::Unchanged,
                };
                (step, true, merged)
            }
        };

        let flags = step_flags(&step, &self.policy).unwrap_or_else(|e| {
            warn!(step_id = %step.id, error = %e, "Skipping hallucination flags");
            Vec::new()
        });
        if flags != step.hallucination_flags {
            step.hallucination_flags = flags;
            merged.changed = true;
        }

        let base = match self.store.get_run(&update.run_id)? {
            Some(run) if !merged.changed => {
                debug!(step_id = %step.id, run_id = %run.id, "Event changed nothing");
                return Ok(IngestOutcome {
                    step,
                    run,
                    created,
                    changed: false,
                    status_change: merged.status_change,
                });
            }
            Some(run) => run,
            None => {
                info!(run_id = %update.run_id, "New run");
                Run::new(update.run_id.clone(), received_at)
            }
        };

        let mut steps = self.store.list_steps(&update.run_id)?;
        match steps.iter_mut().find(|s| s.id == step.id) {
            Some(slot) => *slot = step.clone(),
            None => steps.push(step.clone()),
        }
        let mut run = aggregate::recompute(&base, &steps);
        run.revision = base.revision + 1;
        self.store.save(&step, &run)?;

        debug!(
            step_id = %step.id,
            run_id = %run.id,
            status = step.status.as_str(),
            created,
            revision = run.revision,
            "Step ingested"
        );

        Ok(IngestOutcome {
            step,
            run,
            created,
            changed: true,
            status_change: merged.status_change,
        })
    }

    fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Finds the stored step an event refers to, by id or else by agent name.
    fn locate(&self, update: &StepUpdate) -> Result<Option<Step>, IngestError> {
        if let Some(id) = &update.id {
            let found = self.store.get_step(id)?;
            if let Some(step) = &found {
                if step.run_id != update.run_id {
                    return Err(IngestError::RunMismatch {
                        step_id: id.clone(),
                        existing_run: step.run_id.clone(),
                        incoming_run: update.run_id.clone(),
                    });
                }
            }
            return Ok(found);
        }

        let Some(name) = &update.agent_name else {
            return Ok(None);
        };
        let mut candidates = self.store.find_steps_by_name(&update.run_id, name)?;
        if let Some(pos) = candidates.iter().position(|s| !s.is_terminal()) {
            return Ok(Some(candidates.swap_remove(pos)));
        }
        // Only finished steps remain: a new `running` event is a re-execution.
        if update.status == Some(Status::Running) || candidates.is_empty() {
            return Ok(None);
        }
        Ok(Some(candidates.swap_remove(0)))
    }
}
