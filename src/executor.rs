use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::FoldError;
use crate::events::LogLevel;
use crate::pipeline::{DatasetRef, StepDef};
use crate::run::{RunId, VariantId};

/// Reference to a fitted-model artifact produced by a fold.
///
/// Opaque to the engine; the executor decides what it points at.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef(pub String);

/// Result of one fold execution.
#[derive(Clone, Debug, Default)]
pub struct FoldOutcome {
    /// Metric name to value (e.g. "rmse", "accuracy").
    pub metrics: BTreeMap<String, f64>,
    /// Optional handle to the fitted model.
    pub artifact: Option<ArtifactRef>,
}

/// Mid-fold signals an executor may emit while computing.
///
/// The runner forwards these to the progress bus as `step-progress` and
/// `log` events while the fold is still in flight.
#[derive(Clone, Debug)]
pub enum ExecutorSignal {
    StepStarted { step_index: usize, step_name: String },
    Log { level: LogLevel, message: String },
}

/// Cheap clonable handle an executor uses to report intra-fold progress.
///
/// Reporting is fire-and-forget: if the runner has gone away the signal is
/// dropped silently, never blocking the computation.
#[derive(Clone, Debug)]
pub struct FoldReporter {
    tx: mpsc::UnboundedSender<ExecutorSignal>,
}

impl FoldReporter {
    /// Create a reporter and the receiving end the runner drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutorSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Signal that a pipeline step has started within the fold.
    pub fn step_started(&self, step_index: usize, step_name: impl Into<String>) {
        let _ = self.tx.send(ExecutorSignal::StepStarted {
            step_index,
            step_name: step_name.into(),
        });
    }

    /// Emit a log line attributed to the executing fold.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.tx.send(ExecutorSignal::Log {
            level,
            message: message.into(),
        });
    }
}

/// Everything an executor needs to compute one fold.
#[derive(Clone, Debug)]
pub struct FoldContext {
    pub run_id: RunId,
    pub dataset: DatasetRef,
    pub variant_id: VariantId,
    /// Zero-based variant ordinal within the run.
    pub variant_index: usize,
    /// Zero-based fold ordinal within the variant.
    pub fold_index: usize,
    /// Total folds in the variant.
    pub fold_count: usize,
    /// The variant's concrete step chain.
    pub steps: Vec<StepDef>,
    pub reporter: FoldReporter,
}

/// The opaque fit/transform collaborator that computes folds.
///
/// The engine never interprets what an operator does; it only requires that
/// execution is repeatable, interruptible at fold granularity (the runner
/// never preempts an in-flight fold) and that data or parameter problems
/// surface as a typed [`FoldError`] rather than a panic.
#[async_trait]
pub trait OperatorExecutor: Send + Sync {
    async fn execute_fold(&self, ctx: FoldContext) -> Result<FoldOutcome, FoldError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reporter_signals_arrive_in_order() {
        let (reporter, mut rx) = FoldReporter::channel();
        reporter.step_started(0, "impute");
        reporter.log(LogLevel::Info, "imputed 3 rows");
        reporter.step_started(1, "linreg");
        drop(reporter);

        let mut names = Vec::new();
        while let Some(signal) = rx.recv().await {
            match signal {
                ExecutorSignal::StepStarted { step_name, .. } => names.push(step_name),
                ExecutorSignal::Log { message, .. } => names.push(message),
            }
        }
        assert_eq!(names, vec!["impute", "imputed 3 rows", "linreg"]);
    }

    #[test]
    fn test_reporter_survives_dropped_receiver() {
        let (reporter, rx) = FoldReporter::channel();
        drop(rx);
        // Must not panic or block.
        reporter.step_started(0, "scale");
        reporter.log(LogLevel::Warn, "receiver gone");
    }
}
