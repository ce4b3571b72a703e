//! Tracing and telemetry instrumentation for the run engine.
//!
//! This module provides helper functions for creating tracing spans and
//! recording metrics during the run lifecycle. All functions work both with
//! and without the `metrics` feature flag.
//!
//! # Features
//!
//! - Tracing spans for the run lifecycle: expand, execute, fold
//! - Integration with the `metrics` module for Prometheus metrics
//! - Helper functions that are no-ops when features are disabled
//!
//! # Example
//!
//! ```ignore
//! use crucible::telemetry::{run_execute_span, record_run_started};
//!
//! let span = run_execute_span(run_id, "iris", "baseline");
//! let _enter = span.enter();
//! // ... run execution
//! record_run_started("iris", "baseline");
//! ```

use std::future::Future;
use tracing::{Instrument, Span, info_span};

use crate::run::RunId;

/// Create a tracing span for experiment expansion.
///
/// The span includes the experiment name and the request's fan-out.
#[must_use]
pub fn expand_span(experiment: impl AsRef<str>, datasets: usize, pipelines: usize) -> Span {
    info_span!(
        "crucible.expand",
        experiment = %experiment.as_ref(),
        datasets = datasets,
        pipelines = pipelines,
    )
}

/// Create a tracing span for one run's execution.
///
/// The span includes the run_id, dataset and pipeline as fields.
#[must_use]
pub fn run_execute_span(run_id: RunId, dataset: impl AsRef<str>, pipeline: impl AsRef<str>) -> Span {
    info_span!(
        "crucible.run",
        run_id = %run_id,
        dataset = %dataset.as_ref(),
        pipeline = %pipeline.as_ref(),
    )
}

/// Create a tracing span for one fold's execution.
#[must_use]
pub fn fold_span(run_id: RunId, variant: usize, fold: usize) -> Span {
    info_span!(
        "crucible.fold",
        run_id = %run_id,
        variant = variant,
        fold = fold,
    )
}

/// Instrument a future with a run execution span.
pub fn instrument_run<F>(
    run_id: RunId,
    dataset: impl AsRef<str>,
    pipeline: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = run_execute_span(run_id, dataset, pipeline);
    future.instrument(span)
}

/// Record a run entering execution.
///
/// This function records the event both in tracing logs and in Prometheus
/// metrics (when the `metrics` feature is enabled).
pub fn record_run_started(dataset: impl AsRef<str>, pipeline: impl AsRef<str>) {
    tracing::info!(
        dataset = %dataset.as_ref(),
        pipeline = %pipeline.as_ref(),
        "run started"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_started(dataset.as_ref(), pipeline.as_ref());
}

/// Record a run reaching a terminal state.
pub fn record_run_finished(
    dataset: impl AsRef<str>,
    pipeline: impl AsRef<str>,
    state: impl AsRef<str>,
) {
    tracing::info!(
        dataset = %dataset.as_ref(),
        pipeline = %pipeline.as_ref(),
        state = %state.as_ref(),
        "run finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_finished(dataset.as_ref(), pipeline.as_ref(), state.as_ref());
}

/// Record a fold reaching a terminal state and observe its duration.
pub fn record_fold_processed(
    dataset: impl AsRef<str>,
    pipeline: impl AsRef<str>,
    state: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::debug!(
        dataset = %dataset.as_ref(),
        pipeline = %pipeline.as_ref(),
        state = %state.as_ref(),
        duration_secs = duration_secs,
        "fold processed"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_fold_processed(dataset.as_ref(), pipeline.as_ref(), state.as_ref());
        crate::metrics::observe_fold_duration(
            dataset.as_ref(),
            pipeline.as_ref(),
            state.as_ref(),
            duration_secs,
        );
    }
}

/// Update the run-budget utilization metric.
pub fn set_budget_utilization(active: usize, utilization: f64) {
    tracing::debug!(
        active = active,
        utilization = utilization,
        "budget utilization updated"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::set_active_runs(active as f64);
        crate::metrics::set_budget_utilization(utilization);
    }
}

/// Record the start of a fold for duration tracking.
///
/// Returns an opaque handle that should be passed to `record_fold_end`.
pub fn record_fold_start(run_id: RunId) -> FoldTimingHandle {
    FoldTimingHandle {
        run_id,
        start: std::time::Instant::now(),
    }
}

/// Record the end of a fold and update duration metrics.
pub fn record_fold_end(
    handle: &FoldTimingHandle,
    dataset: impl AsRef<str>,
    pipeline: impl AsRef<str>,
    state: impl AsRef<str>,
) {
    let duration_secs = handle.elapsed().as_secs_f64();
    record_fold_processed(dataset, pipeline, state, duration_secs);
}

/// Handle for tracking fold execution duration.
#[derive(Debug)]
pub struct FoldTimingHandle {
    run_id: RunId,
    start: std::time::Instant,
}

impl FoldTimingHandle {
    /// Get the run ID associated with this timing handle.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Get the elapsed time since the fold started.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
