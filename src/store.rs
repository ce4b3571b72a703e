use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::events::ProgressEvent;
use crate::run::{Experiment, ExperimentId, Fold, Run, RunId, RunState};

/// Point-in-time view of a run plus its event-log position.
///
/// This is the polling fallback: because both the snapshot and the
/// sequence number come from the same durable log, a poller always sees
/// state consistent with what a live subscriber observed at that sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    /// Sequence number of the last published event (0 when none).
    pub last_sequence: u64,
}

/// Durable record of every run's identity, state, folds and event log.
///
/// The store is the single source of truth for what happened. Writers
/// follow write-then-notify ordering: a state change is durable here
/// before the corresponding event is fanned out, and fold records are
/// written whole or not at all.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError>;

    async fn experiment(&self, id: ExperimentId) -> Result<Experiment, StoreError>;

    /// Insert freshly expanded runs (state `Queued`).
    async fn insert_runs(&self, runs: &[Run]) -> Result<(), StoreError>;

    async fn run(&self, id: RunId) -> Result<Run, StoreError>;

    /// All stored runs, in no particular cross-run order.
    async fn list_runs(&self) -> Result<Vec<Run>, StoreError>;

    /// Transition a queued (or crash-interrupted running) run to `Running`.
    async fn mark_running(&self, id: RunId, started_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record a terminal fold result, whole or not at all.
    ///
    /// Rejects writes to a fold that is already terminal: completed folds
    /// are immutable.
    async fn record_fold(&self, id: RunId, variant: usize, fold: Fold) -> Result<(), StoreError>;

    /// Transition a run into a terminal state, exactly once.
    ///
    /// Re-finalizing with the same state is an idempotent no-op (terminal
    /// states are safe to re-observe); a different state is rejected.
    async fn finalize(
        &self,
        id: RunId,
        state: RunState,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Durably append one progress event to the run's log.
    async fn append_event(&self, event: &ProgressEvent) -> Result<(), StoreError>;

    /// Stored events with `sequence > after`, in sequence order.
    async fn events_after(&self, id: RunId, after: u64) -> Result<Vec<ProgressEvent>, StoreError>;

    /// Sequence number of the last event for a run (0 when none).
    async fn last_sequence(&self, id: RunId) -> Result<u64, StoreError>;

    /// Consistent run + sequence view for polling clients.
    async fn snapshot(&self, id: RunId) -> Result<RunSnapshot, StoreError>;

    /// Remove a terminal run and its event log.
    async fn delete_run(&self, id: RunId) -> Result<(), StoreError>;
}

/// Shared in-memory projection used by both the map-backed store and the
/// journal-backed store (where it is rebuilt by replay).
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) experiments: HashMap<ExperimentId, Experiment>,
    pub(crate) runs: HashMap<RunId, Run>,
    pub(crate) events: HashMap<RunId, Vec<ProgressEvent>>,
}

impl StoreState {
    pub(crate) fn run_mut(&mut self, id: RunId) -> Result<&mut Run, StoreError> {
        self.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))
    }

    pub(crate) fn apply_fold(
        &mut self,
        id: RunId,
        variant: usize,
        fold: Fold,
    ) -> Result<(), StoreError> {
        let run = self.run_mut(id)?;
        let slot = run
            .variants
            .get_mut(variant)
            .ok_or(StoreError::VariantOutOfRange {
                run_id: id,
                variant,
            })?;
        let index = fold.index;
        let existing = slot
            .folds
            .get_mut(index)
            .ok_or(StoreError::FoldOutOfRange {
                run_id: id,
                variant,
                fold: index,
            })?;
        if existing.state.is_terminal() {
            return Err(StoreError::FoldAlreadyRecorded {
                run_id: id,
                variant,
                fold: index,
            });
        }
        *existing = fold;
        Ok(())
    }

    pub(crate) fn apply_finalize(
        &mut self,
        id: RunId,
        state: RunState,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let run = self.run_mut(id)?;
        if run.state.is_terminal() {
            if run.state == state {
                return Ok(());
            }
            return Err(StoreError::AlreadyTerminal {
                run_id: id,
                current: run.state,
            });
        }
        run.state = state;
        run.error = error;
        run.finished_at = Some(finished_at);
        Ok(())
    }

    pub(crate) fn apply_insert_runs(&mut self, runs: &[Run]) {
        for run in runs {
            self.runs.insert(run.id, run.clone());
            self.events.entry(run.id).or_default();
        }
    }

    pub(crate) fn apply_mark_running(
        &mut self,
        id: RunId,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let run = self.run_mut(id)?;
        if run.state.is_terminal() {
            return Err(StoreError::AlreadyTerminal {
                run_id: id,
                current: run.state,
            });
        }
        run.state = RunState::Running;
        if run.started_at.is_none() {
            run.started_at = Some(started_at);
        }
        Ok(())
    }

    pub(crate) fn apply_event(&mut self, event: &ProgressEvent) -> Result<(), StoreError> {
        if !self.runs.contains_key(&event.run_id) {
            return Err(StoreError::RunNotFound(event.run_id));
        }
        self.events
            .entry(event.run_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    pub(crate) fn apply_delete(&mut self, id: RunId) -> Result<(), StoreError> {
        let run = self.runs.get(&id).ok_or(StoreError::RunNotFound(id))?;
        if !run.state.is_terminal() {
            return Err(StoreError::NotTerminal {
                run_id: id,
                current: run.state,
            });
        }
        self.runs.remove(&id);
        self.events.remove(&id);
        Ok(())
    }

    fn run_ref(&self, id: RunId) -> Result<&Run, StoreError> {
        self.runs.get(&id).ok_or(StoreError::RunNotFound(id))
    }

    // Read-only admission checks. The journal-backed store runs these before
    // the durable append and mutates only after the append succeeds, so a
    // failed write never leaves the projection ahead of disk.

    pub(crate) fn check_run_exists(&self, id: RunId) -> Result<(), StoreError> {
        self.run_ref(id).map(|_| ())
    }

    pub(crate) fn check_mark_running(&self, id: RunId) -> Result<(), StoreError> {
        let run = self.run_ref(id)?;
        if run.state.is_terminal() {
            return Err(StoreError::AlreadyTerminal {
                run_id: id,
                current: run.state,
            });
        }
        Ok(())
    }

    pub(crate) fn check_fold_writable(
        &self,
        id: RunId,
        variant: usize,
        fold: usize,
    ) -> Result<(), StoreError> {
        let run = self.run_ref(id)?;
        let slot = run
            .variants
            .get(variant)
            .ok_or(StoreError::VariantOutOfRange {
                run_id: id,
                variant,
            })?;
        let existing = slot.folds.get(fold).ok_or(StoreError::FoldOutOfRange {
            run_id: id,
            variant,
            fold,
        })?;
        if existing.state.is_terminal() {
            return Err(StoreError::FoldAlreadyRecorded {
                run_id: id,
                variant,
                fold,
            });
        }
        Ok(())
    }

    /// `Ok(false)` is the idempotent re-finalize with the same state, which
    /// must not be journaled again.
    pub(crate) fn check_finalize(&self, id: RunId, state: RunState) -> Result<bool, StoreError> {
        let run = self.run_ref(id)?;
        if run.state.is_terminal() {
            if run.state == state {
                return Ok(false);
            }
            return Err(StoreError::AlreadyTerminal {
                run_id: id,
                current: run.state,
            });
        }
        Ok(true)
    }

    pub(crate) fn check_delete(&self, id: RunId) -> Result<(), StoreError> {
        let run = self.run_ref(id)?;
        if !run.state.is_terminal() {
            return Err(StoreError::NotTerminal {
                run_id: id,
                current: run.state,
            });
        }
        Ok(())
    }

    pub(crate) fn last_sequence_for(&self, id: RunId) -> u64 {
        self.events
            .get(&id)
            .and_then(|log| log.last())
            .map(|e| e.sequence)
            .unwrap_or(0)
    }
}

/// Map-backed store for tests and ephemeral embedding.
///
/// Same contract as the journal-backed store, minus durability across
/// process restarts.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    state: Mutex<StoreState>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.experiments.insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn experiment(&self, id: ExperimentId) -> Result<Experiment, StoreError> {
        let state = self.state.lock().await;
        state
            .experiments
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::ExperimentNotFound(id.to_string()))
    }

    async fn insert_runs(&self, runs: &[Run]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.apply_insert_runs(runs);
        Ok(())
    }

    async fn run(&self, id: RunId) -> Result<Run, StoreError> {
        let state = self.state.lock().await;
        state.runs.get(&id).cloned().ok_or(StoreError::RunNotFound(id))
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.values().cloned().collect())
    }

    async fn mark_running(&self, id: RunId, started_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.apply_mark_running(id, started_at)
    }

    async fn record_fold(&self, id: RunId, variant: usize, fold: Fold) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.apply_fold(id, variant, fold)
    }

    async fn finalize(
        &self,
        id: RunId,
        state: RunState,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        guard.apply_finalize(id, state, error, finished_at)
    }

    async fn append_event(&self, event: &ProgressEvent) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.apply_event(event)
    }

    async fn events_after(&self, id: RunId, after: u64) -> Result<Vec<ProgressEvent>, StoreError> {
        let state = self.state.lock().await;
        if !state.runs.contains_key(&id) {
            return Err(StoreError::RunNotFound(id));
        }
        Ok(state
            .events
            .get(&id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn last_sequence(&self, id: RunId) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        if !state.runs.contains_key(&id) {
            return Err(StoreError::RunNotFound(id));
        }
        Ok(state.last_sequence_for(id))
    }

    async fn snapshot(&self, id: RunId) -> Result<RunSnapshot, StoreError> {
        let state = self.state.lock().await;
        let run = state.runs.get(&id).cloned().ok_or(StoreError::RunNotFound(id))?;
        let last_sequence = state.last_sequence_for(id);
        Ok(RunSnapshot { run, last_sequence })
    }

    async fn delete_run(&self, id: RunId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.apply_delete(id)
    }
}
