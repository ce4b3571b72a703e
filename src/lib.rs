//! Crucible - experiment run execution for cross-validated ML pipelines.
//!
//! A crate that turns declarative experiment requests (datasets crossed with
//! pipeline definitions) into concrete cross-validated runs, executes them
//! under a concurrency budget and streams live progress to subscribers while
//! persisting every state change durably.
//!
//! # Core Concepts
//!
//! - **Expansion**: The [`WorkExpander`] resolves an [`ExperimentRequest`]
//!   against a [`Catalog`], multiplies generator nodes (alternatives,
//!   sweeps, branches) into concrete [`Variant`]s and produces one [`Run`]
//!   per (dataset, pipeline) pair.
//!
//! - **Run lifecycle**: A [`Run`] moves `Queued -> Running` and ends in
//!   exactly one terminal state: `Completed`, `Failed` or `Stopped`. Folds
//!   are the atomic unit of persistence and of cancellation.
//!
//! - **Store**: The [`RunStore`] trait is the durable source of truth for
//!   runs, folds and event logs. [`InMemoryRunStore`] backs tests and
//!   ephemeral embedding; [`JournalStore`] persists across restarts.
//!
//! - **Events**: The [`ProgressBus`] assigns per-run sequence numbers,
//!   appends each event durably and then fans it out; [`Subscription`]
//!   replays from any resume point before going live, with no gap and no
//!   duplicate.
//!
//! - **Execution**: The [`OperatorExecutor`] trait is the seam to the
//!   actual fit/transform computation; the engine sequences folds, isolates
//!   their failures and reports progress, never interpreting their content.
//!
//! - **Scheduling**: The [`RunScheduler`] ties everything together: submit,
//!   stop, retry, delete, subscribe, restart recovery and graceful
//!   shutdown, with dispatch bounded by a [`RunBudget`].
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use crucible::*;
//! use std::sync::Arc;
//!
//! let scheduler = RunSchedulerBuilder::new(EngineConfig::default())
//!     .with_catalog(Arc::new(catalog))
//!     .with_store(Arc::new(InMemoryRunStore::new()))
//!     .with_executor(Arc::new(my_executor))
//!     .build()?;
//!
//! let expanded = scheduler.submit(request).await?;
//! let mut sub = scheduler.subscribe(expanded.runs[0].id, 0).await?;
//! while let Some(event) = sub.next().await? {
//!     println!("{}: {}", event.sequence, event.payload.kind());
//! }
//! ```

/// Concurrency budget for simultaneously executing runs.
///
/// The `budget` module provides [`RunBudget`], a bounded slot counter, and
/// [`RunSlot`], a guard that returns capacity when dropped.
pub mod budget;

/// Engine configuration.
///
/// The `config` module defines [`EngineConfig`] plus the nested
/// [`ExpansionLimits`] and [`JournalConfig`] for tuning expansion guard
/// rails and journal durability.
pub mod config;

/// Error taxonomy.
///
/// The `error` module separates the failure classes the engine treats
/// differently: [`ExpansionError`] (synchronous, pre-persistence),
/// [`FoldError`] (isolated per fold), [`FatalRunError`] (aborts a run),
/// [`SubscriptionError`], [`SchedulerError`] and [`StoreError`].
pub mod error;

/// Progress events, the per-run event bus and subscriptions.
///
/// The `events` module provides:
/// - [`ProgressEvent`] and [`ProgressPayload`] - the event model
/// - [`ProgressBus`] - durable-append-then-broadcast fan-out
/// - [`Subscription`] - replay-then-live consumption
pub mod events;

/// The operator executor seam.
///
/// The `executor` module defines the [`OperatorExecutor`] trait along with
/// [`FoldContext`], [`FoldOutcome`] and the [`FoldReporter`] handle for
/// mid-fold step and log signals.
pub mod executor;

/// Experiment expansion.
///
/// The `expand` module provides the [`WorkExpander`] that turns an
/// [`ExperimentRequest`] into an [`ExpandedExperiment`] of runs, variants
/// and pending folds.
pub mod expand;

/// Dataset and pipeline model.
///
/// The `pipeline` module defines [`PipelineNode`] trees with their
/// generator nodes, [`StepDef`] and [`ParamValue`] for concrete steps,
/// [`DatasetShape`] and the [`Catalog`] lookup trait with its
/// [`InMemoryCatalog`] implementation.
pub mod pipeline;

/// Run, variant and fold lifecycle types.
///
/// The `run` module defines [`Run`], [`Variant`], [`Fold`] and their
/// states, plus the derived progress and outcome rules.
pub mod run;

/// The lifecycle store contract and in-memory implementation.
///
/// The `store` module defines the [`RunStore`] trait, [`RunSnapshot`] for
/// polling clients and [`InMemoryRunStore`].
pub mod store;

/// Durable journal-backed persistence.
///
/// The `persistence` module provides [`JournalStore`], a JSON-lines
/// append-only journal whose replay rebuilds engine state after a restart.
pub mod persistence;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics, behind the `metrics` feature.
pub mod metrics;

/// Scheduler, run workers and the builder.
///
/// The `runtime` module provides:
/// - [`RunScheduler`] - the engine's front door
/// - [`RunWorker`] - executes one run to a terminal state
/// - [`StopToken`] - cooperative fold-boundary cancellation
/// - [`RunSchedulerBuilder`] - dependency wiring with validation
pub mod runtime;

pub use budget::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use executor::*;
pub use expand::*;
pub use persistence::*;
pub use pipeline::*;
pub use run::*;
pub use runtime::{RunScheduler, RunSchedulerBuilder, RunWorker, StopToken};
pub use store::*;
