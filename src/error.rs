use thiserror::Error;

use crate::run::{RunId, RunState};

/// Experiment expansion failure.
///
/// Surfaced synchronously to the submitter before any `Run` is created;
/// a request that fails expansion never reaches the scheduler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpansionError {
    /// Referenced dataset does not exist in the catalog.
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    /// Referenced pipeline does not exist in the catalog.
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    /// Pipeline cannot run against the dataset's shape.
    #[error("pipeline {pipeline} incompatible with dataset {dataset}: {reason}")]
    IncompatibleShape {
        pipeline: String,
        dataset: String,
        reason: String,
    },

    /// A generator node cannot be resolved (empty alternatives, empty sweep).
    #[error("unresolvable generator in pipeline {pipeline}: {reason}")]
    UnresolvableGenerator { pipeline: String, reason: String },

    /// Expansion would exceed the configured limits.
    #[error("expansion exceeds limits: {0}")]
    LimitExceeded(String),

    /// The request itself is malformed (no datasets, no pipelines).
    #[error("invalid experiment request: {0}")]
    InvalidRequest(String),
}

/// A single fold's execution failure, raised by the operator executor.
///
/// Fold errors are isolated: the runner records them and continues with
/// the next fold.
#[derive(Error, Debug, Clone)]
pub enum FoldError {
    /// A step received parameter values it cannot accept.
    #[error("invalid parameters for step {step}: {message}")]
    InvalidParams { step: String, message: String },

    /// The dataset split could not be processed.
    #[error("data error: {0}")]
    Data(String),

    /// A pipeline step failed mid-fold.
    #[error("step {step} failed: {message}")]
    Step { step: String, message: String },

    /// The executor was interrupted before the fold finished.
    #[error("fold interrupted: {0}")]
    Interrupted(String),
}

/// Infrastructure failure that aborts a whole run immediately.
///
/// Unlike [`FoldError`], a fatal error is not isolated: the run transitions
/// to `Failed` with the error attached.
#[derive(Error, Debug)]
pub enum FatalRunError {
    /// The lifecycle store rejected a write.
    #[error("store write failed for run {run_id}: {source}")]
    StoreWrite {
        run_id: RunId,
        #[source]
        source: StoreError,
    },

    /// The progress bus could not durably append an event.
    #[error("event append failed for run {run_id}: {source}")]
    EventAppend {
        run_id: RunId,
        #[source]
        source: StoreError,
    },
}

/// Subscription failures, distinct from "no new events yet".
#[derive(Error, Debug)]
pub enum SubscriptionError {
    /// No event channel exists for this run.
    #[error("unknown run: {0}")]
    UnknownRun(RunId),

    /// The requested resume point is ahead of the retained log.
    ///
    /// The client should request a full resync (`from_sequence = 0`).
    #[error("sequence {requested} is beyond the log head {head} for run {run_id}")]
    OutOfRange {
        run_id: RunId,
        requested: u64,
        head: u64,
    },

    /// The live channel dropped events faster than the subscriber consumed
    /// them; the no-gap guarantee is broken and the client must resync.
    #[error("subscriber lagged behind by {skipped} events on run {run_id}")]
    Lagged { run_id: RunId, skipped: u64 },
}

/// Failures surfaced by scheduler operations (submit, stop, retry, delete).
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Expansion(#[from] ExpansionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The scheduler no longer accepts work; in-flight runs are draining.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Lifecycle store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    /// A terminal run was asked to transition to a different terminal state.
    #[error("run {run_id} is already terminal ({current:?})")]
    AlreadyTerminal { run_id: RunId, current: RunState },

    /// Operation requires a terminal run (retry, delete).
    #[error("run {run_id} is not terminal ({current:?})")]
    NotTerminal { run_id: RunId, current: RunState },

    #[error("variant {variant} out of range for run {run_id}")]
    VariantOutOfRange { run_id: RunId, variant: usize },

    #[error("fold {fold} out of range for variant {variant} of run {run_id}")]
    FoldOutOfRange {
        run_id: RunId,
        variant: usize,
        fold: usize,
    },

    /// A completed fold is immutable; rewriting it is a bug upstream.
    #[error("fold {fold} of variant {variant} in run {run_id} is already recorded")]
    FoldAlreadyRecorded {
        run_id: RunId,
        variant: usize,
        fold: usize,
    },

    /// The journal contains a line that cannot be decoded.
    #[error("corrupt journal at line {line}: {message}")]
    CorruptJournal { line: usize, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
