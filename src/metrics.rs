//! Prometheus metrics for the run engine.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `crucible_runs_started_total` - Runs that entered execution
//! - `crucible_runs_finished_total` - Runs that reached a terminal state
//! - `crucible_folds_processed_total` - Folds that reached a terminal state
//!
//! ## Gauges
//! - `crucible_active_runs` - Runs currently executing
//! - `crucible_budget_utilization` - Fraction of the run budget in use
//!
//! ## Histograms
//! - `crucible_fold_duration_seconds` - Fold execution duration
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for engine metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for runs that entered execution.
///
/// Labels:
/// - `dataset`: The dataset reference
/// - `pipeline`: The pipeline reference
pub static RUNS_STARTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "crucible_runs_started_total",
        "Total number of runs that entered execution",
    );
    CounterVec::new(opts, &["dataset", "pipeline"])
        .expect("crucible_runs_started_total metric creation failed")
});

/// Counter for runs that reached a terminal state.
///
/// Labels:
/// - `dataset`: The dataset reference
/// - `pipeline`: The pipeline reference
/// - `state`: The terminal state (completed, failed, stopped)
pub static RUNS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "crucible_runs_finished_total",
        "Total number of runs that reached a terminal state",
    );
    CounterVec::new(opts, &["dataset", "pipeline", "state"])
        .expect("crucible_runs_finished_total metric creation failed")
});

/// Counter for folds that reached a terminal state.
///
/// Labels:
/// - `dataset`: The dataset reference
/// - `pipeline`: The pipeline reference
/// - `state`: The fold's terminal state (completed, failed)
pub static FOLDS_PROCESSED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "crucible_folds_processed_total",
        "Total number of folds that reached a terminal state",
    );
    CounterVec::new(opts, &["dataset", "pipeline", "state"])
        .expect("crucible_folds_processed_total metric creation failed")
});

/// Gauge for runs currently executing.
pub static ACTIVE_RUNS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("crucible_active_runs", "Runs currently executing");
    GaugeVec::new(opts, &[]).expect("crucible_active_runs metric creation failed")
});

/// Gauge for run-budget utilization.
pub static BUDGET_UTILIZATION: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "crucible_budget_utilization",
        "Fraction of the run budget in use (0-1)",
    );
    GaugeVec::new(opts, &[]).expect("crucible_budget_utilization metric creation failed")
});

/// Histogram for fold execution duration in seconds.
///
/// Labels:
/// - `dataset`: The dataset reference
/// - `pipeline`: The pipeline reference
/// - `state`: The fold's terminal state (completed, failed)
pub static FOLD_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "crucible_fold_duration_seconds",
        "Fold execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["dataset", "pipeline", "state"])
        .expect("crucible_fold_duration_seconds metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_STARTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RUNS_FINISHED_TOTAL.clone()),
        Box::new(FOLDS_PROCESSED_TOTAL.clone()),
        Box::new(ACTIVE_RUNS.clone()),
        Box::new(BUDGET_UTILIZATION.clone()),
        Box::new(FOLD_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Helper to record a run entering execution.
pub fn record_run_started(dataset: &str, pipeline: &str) {
    RUNS_STARTED_TOTAL
        .with_label_values(&[dataset, pipeline])
        .inc();
}

/// Helper to record a run reaching a terminal state.
pub fn record_run_finished(dataset: &str, pipeline: &str, state: &str) {
    RUNS_FINISHED_TOTAL
        .with_label_values(&[dataset, pipeline, state])
        .inc();
}

/// Helper to record a fold reaching a terminal state.
pub fn record_fold_processed(dataset: &str, pipeline: &str, state: &str) {
    FOLDS_PROCESSED_TOTAL
        .with_label_values(&[dataset, pipeline, state])
        .inc();
}

/// Helper to update the active-run gauge.
pub fn set_active_runs(count: f64) {
    ACTIVE_RUNS.with_label_values(&[]).set(count);
}

/// Helper to update the budget utilization gauge.
pub fn set_budget_utilization(utilization: f64) {
    BUDGET_UTILIZATION.with_label_values(&[]).set(utilization);
}

/// Helper to observe fold duration.
pub fn observe_fold_duration(dataset: &str, pipeline: &str, state: &str, duration_secs: f64) {
    FOLD_DURATION_SECONDS
        .with_label_values(&[dataset, pipeline, state])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
