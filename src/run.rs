use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::{DatasetRef, PipelineRef, StepDef};

/// Unique identifier for an experiment.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ExperimentId(pub Uuid);

impl Default for ExperimentId {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ExperimentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a variant within a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct VariantId(pub Uuid);

impl Default for VariantId {
    fn default() -> Self {
        Self::new()
    }
}

impl VariantId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for VariantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run lifecycle states.
///
/// `Stopped`, `Completed` and `Failed` are terminal: a run reaches exactly
/// one of them and never transitions again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// Created by expansion, waiting for a scheduler slot.
    Queued,
    /// A runner is executing (or was executing when the process died).
    Running,
    /// Stopped at a fold boundary on user request; completed folds kept.
    Stopped,
    /// All folds processed and at least one completed.
    Completed,
    /// Every fold failed, or an infrastructure error aborted the run.
    Failed,
}

impl RunState {
    /// Whether no further transitions can occur from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fold lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum FoldState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl FoldState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Display for FoldState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One cross-validation split execution.
///
/// A fold is the atomic unit of persistence: it is recorded in full
/// (state, metrics, duration) or not at all, and once terminal it is
/// immutable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fold {
    /// Zero-based index within the variant.
    pub index: usize,
    /// Total fold count of the owning variant.
    pub total: usize,
    pub state: FoldState,
    /// Metric name to value, produced by the operator executor.
    pub metrics: BTreeMap<String, f64>,
    /// Wall-clock execution time, set when the fold reaches a terminal state.
    pub duration_ms: Option<u64>,
    /// Error message when the fold failed.
    pub error: Option<String>,
}

impl Fold {
    /// Create a pending fold.
    pub fn pending(index: usize, total: usize) -> Self {
        Self {
            index,
            total,
            state: FoldState::Pending,
            metrics: BTreeMap::new(),
            duration_ms: None,
            error: None,
        }
    }

    /// Build the completed record for this fold slot.
    pub fn completed(
        index: usize,
        total: usize,
        metrics: BTreeMap<String, f64>,
        duration_ms: u64,
    ) -> Self {
        Self {
            index,
            total,
            state: FoldState::Completed,
            metrics,
            duration_ms: Some(duration_ms),
            error: None,
        }
    }

    /// Build the failed record for this fold slot.
    pub fn failed(index: usize, total: usize, error: String, duration_ms: u64) -> Self {
        Self {
            index,
            total,
            state: FoldState::Failed,
            metrics: BTreeMap::new(),
            duration_ms: Some(duration_ms),
            error: Some(error),
        }
    }
}

/// One fully-resolved, generator-free pipeline chain within a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    /// Zero-based ordinal within the run; display as "variant i+1/total".
    pub index: usize,
    /// Total variant count of the owning run.
    pub total: usize,
    /// Concrete step chain. Opaque to the engine; handed to the executor.
    pub steps: Vec<StepDef>,
    /// Folds in execution order.
    pub folds: Vec<Fold>,
}

impl Variant {
    pub fn new(index: usize, total: usize, steps: Vec<StepDef>, fold_count: usize) -> Self {
        Self {
            id: VariantId::new(),
            index,
            total,
            steps,
            folds: (0..fold_count)
                .map(|i| Fold::pending(i, fold_count))
                .collect(),
        }
    }
}

/// One (dataset, pipeline) execution unit of an experiment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub experiment_id: ExperimentId,
    pub dataset: DatasetRef,
    pub pipeline: PipelineRef,
    pub state: RunState,
    pub variants: Vec<Variant>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Fatal error message when the run failed outside of fold isolation.
    pub error: Option<String>,
    /// The terminal run this one was retried from, if any.
    pub retry_of: Option<RunId>,
}

impl Run {
    pub fn new(
        experiment_id: ExperimentId,
        dataset: DatasetRef,
        pipeline: PipelineRef,
        variants: Vec<Variant>,
    ) -> Self {
        Self {
            id: RunId::new(),
            experiment_id,
            dataset,
            pipeline,
            state: RunState::Queued,
            variants,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            retry_of: None,
        }
    }

    /// Total folds across all variants.
    pub fn total_folds(&self) -> usize {
        self.variants.iter().map(|v| v.folds.len()).sum()
    }

    /// Folds that completed successfully.
    pub fn completed_folds(&self) -> usize {
        self.fold_count_in(FoldState::Completed)
    }

    /// Folds that reached a terminal state (completed or failed).
    pub fn processed_folds(&self) -> usize {
        self.variants
            .iter()
            .flat_map(|v| v.folds.iter())
            .filter(|f| f.state.is_terminal())
            .count()
    }

    fn fold_count_in(&self, state: FoldState) -> usize {
        self.variants
            .iter()
            .flat_map(|v| v.folds.iter())
            .filter(|f| f.state == state)
            .count()
    }

    /// Overall progress as a floor-rounded percentage of processed folds.
    ///
    /// Floor rounding means 100 is only reported once every fold has been
    /// durably recorded; the value never regresses while running.
    pub fn progress_percent(&self) -> u8 {
        let total = self.total_folds();
        if total == 0 {
            return 0;
        }
        ((self.processed_folds() * 100) / total) as u8
    }

    /// Terminal state for a run whose folds have all been processed.
    ///
    /// A run only fails wholesale when every fold failed; partial failures
    /// still complete, exposing the failed folds in the record.
    pub fn outcome_state(&self) -> RunState {
        if self.total_folds() > 0 && self.completed_folds() == 0 {
            RunState::Failed
        } else {
            RunState::Completed
        }
    }
}

/// A named, immutable experiment request as accepted by the scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub datasets: Vec<DatasetRef>,
    pub pipelines: Vec<PipelineRef>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{DatasetRef, PipelineRef};

    fn run_with_folds(fold_states: &[FoldState]) -> Run {
        let mut variant = Variant::new(0, 1, vec![], fold_states.len());
        for (i, state) in fold_states.iter().enumerate() {
            variant.folds[i].state = *state;
        }
        Run::new(
            ExperimentId::new(),
            DatasetRef::from("iris"),
            PipelineRef::from("baseline"),
            vec![variant],
        )
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunState::Queued.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Stopped.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
    }

    #[test]
    fn test_progress_floor_never_early_hundred() {
        use FoldState::*;
        let run = run_with_folds(&[Completed, Completed, Pending]);
        assert_eq!(run.progress_percent(), 66);

        let run = run_with_folds(&[Completed, Completed, Completed]);
        assert_eq!(run.progress_percent(), 100);
    }

    #[test]
    fn test_failed_folds_advance_progress() {
        use FoldState::*;
        let run = run_with_folds(&[Completed, Failed, Pending]);
        assert_eq!(run.processed_folds(), 2);
        assert_eq!(run.completed_folds(), 1);
        assert_eq!(run.progress_percent(), 66);
    }

    #[test]
    fn test_outcome_requires_all_folds_failed() {
        use FoldState::*;
        let run = run_with_folds(&[Failed, Failed, Completed]);
        assert_eq!(run.outcome_state(), RunState::Completed);

        let run = run_with_folds(&[Failed, Failed, Failed]);
        assert_eq!(run.outcome_state(), RunState::Failed);
    }

    #[test]
    fn test_empty_run_progress_is_zero() {
        let run = run_with_folds(&[]);
        assert_eq!(run.progress_percent(), 0);
    }

    #[test]
    fn test_variant_starts_with_pending_folds() {
        let variant = Variant::new(2, 4, vec![], 5);
        assert_eq!(variant.index, 2);
        assert_eq!(variant.total, 4);
        assert_eq!(variant.folds.len(), 5);
        assert!(variant.folds.iter().all(|f| f.state == FoldState::Pending));
        assert_eq!(variant.folds[3].index, 3);
        assert_eq!(variant.folds[3].total, 5);
    }
}
