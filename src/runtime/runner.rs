use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{FatalRunError, StoreError};
use crate::events::{ProgressBus, ProgressPayload};
use crate::executor::{ExecutorSignal, FoldContext, FoldReporter, OperatorExecutor};
use crate::run::{Fold, Run, RunId, RunState};
use crate::store::RunStore;
use crate::telemetry;

/// Token for requesting a cooperative stop of one run.
///
/// A stop never preempts an in-flight fold: the runner checks the token at
/// fold boundaries only, so the current fold always finishes and is recorded
/// before the run transitions to `Stopped`.
#[derive(Clone, Debug)]
pub struct StopToken {
    inner: Arc<StopTokenInner>,
}

#[derive(Debug)]
struct StopTokenInner {
    requested: AtomicBool,
    notify: Notify,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopTokenInner {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Request a stop at the next fold boundary.
    pub fn request_stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Wait until a stop is requested.
    pub async fn stopped(&self) {
        if self.is_stop_requested() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes one run: every pending fold in variant order, fold order, with
/// persist-then-publish after each.
///
/// Two tokens govern a worker. The per-run `StopToken` is a user stop and
/// finalizes the run `Stopped`; the shared `shutdown` token pauses the run
/// at the next fold boundary without finalizing, so it stays durably
/// `Running` and is resumed by recovery on the next start.
pub struct RunWorker {
    store: Arc<dyn RunStore>,
    bus: Arc<ProgressBus>,
    executor: Arc<dyn OperatorExecutor>,
    shutdown: StopToken,
}

impl RunWorker {
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: Arc<ProgressBus>,
        executor: Arc<dyn OperatorExecutor>,
        shutdown: StopToken,
    ) -> Self {
        Self {
            store,
            bus,
            executor,
            shutdown,
        }
    }

    /// Drive the run as far as the tokens allow.
    ///
    /// Folds already terminal are skipped, which is what makes a resumed
    /// run (after restart or retry) continue where it left off. Returns the
    /// state the run was left in; `Running` means a shutdown suspended it
    /// for recovery. An `Err` means the store itself failed and not even
    /// the failure could be recorded.
    pub async fn execute(
        &self,
        run_id: RunId,
        stop: StopToken,
    ) -> Result<RunState, FatalRunError> {
        let run = self
            .store
            .run(run_id)
            .await
            .map_err(|source| FatalRunError::StoreWrite { run_id, source })?;

        if run.state.is_terminal() {
            debug!(run_id = %run_id, state = %run.state, "run already terminal, nothing to execute");
            return Ok(run.state);
        }

        let dataset = run.dataset.as_str().to_owned();
        let pipeline = run.pipeline.as_str().to_owned();
        match telemetry::instrument_run(run_id, dataset, pipeline, self.execute_inner(run, &stop))
            .await
        {
            Ok(state) => Ok(state),
            Err(fatal) => {
                error!(run_id = %run_id, error = %fatal, "run aborted by infrastructure failure");
                self.mark_failed(run_id, fatal).await
            }
        }
    }

    async fn execute_inner(
        &self,
        mut run: Run,
        stop: &StopToken,
    ) -> Result<RunState, FatalRunError> {
        let run_id = run.id;
        if self.shutdown.is_stop_requested() {
            debug!(run_id = %run_id, "shutdown in progress, leaving run for recovery");
            return Ok(run.state);
        }
        let last_sequence = self
            .store
            .last_sequence(run_id)
            .await
            .map_err(|source| FatalRunError::StoreWrite { run_id, source })?;
        self.bus.register(run_id, last_sequence).await;

        self.store
            .mark_running(run_id, Utc::now())
            .await
            .map_err(|source| FatalRunError::StoreWrite { run_id, source })?;
        telemetry::record_run_started(run.dataset.as_str(), run.pipeline.as_str());

        let total_variants = run.variants.len();
        let total_folds = run.total_folds();

        for variant_index in 0..total_variants {
            let fold_count = run.variants[variant_index].folds.len();
            if run.variants[variant_index]
                .folds
                .iter()
                .all(|f| f.state.is_terminal())
            {
                continue;
            }

            self.bus
                .publish(
                    run_id,
                    ProgressPayload::VariantProgress {
                        variant: variant_index,
                        total_variants,
                    },
                )
                .await?;

            for fold_index in 0..fold_count {
                if run.variants[variant_index].folds[fold_index]
                    .state
                    .is_terminal()
                {
                    continue;
                }
                if stop.is_stop_requested() {
                    return self.finish_stopped(&run).await;
                }
                if self.shutdown.is_stop_requested() {
                    return Ok(self.suspend(&run));
                }

                let fold = self
                    .execute_fold(&run, variant_index, fold_index, fold_count)
                    .await?;
                run.variants[variant_index].folds[fold_index] = fold;

                self.bus
                    .publish(
                        run_id,
                        ProgressPayload::Progress {
                            processed_folds: run.processed_folds(),
                            completed_folds: run.completed_folds(),
                            total_folds,
                            percent: run.progress_percent(),
                        },
                    )
                    .await?;
            }
        }

        if stop.is_stop_requested() {
            return self.finish_stopped(&run).await;
        }
        self.finish_processed(&run).await
    }

    /// Execute a single fold: run the executor, forward its mid-fold
    /// signals, then record the result durably before any fold-level event
    /// is published.
    async fn execute_fold(
        &self,
        run: &Run,
        variant_index: usize,
        fold_index: usize,
        fold_count: usize,
    ) -> Result<Fold, FatalRunError> {
        let run_id = run.id;
        let variant = &run.variants[variant_index];
        let span = telemetry::fold_span(run_id, variant_index, fold_index);

        let (reporter, mut signals) = FoldReporter::channel();
        let ctx = FoldContext {
            run_id,
            dataset: run.dataset.clone(),
            variant_id: variant.id,
            variant_index,
            fold_index,
            fold_count,
            steps: variant.steps.clone(),
            reporter,
        };

        // Forward executor signals live while the fold computes. The
        // forwarder ends when the executor drops its reporter, so awaiting
        // it below guarantees all mid-fold events precede the fold record.
        let forwarder = {
            let bus = Arc::clone(&self.bus);
            tokio::spawn(async move {
                while let Some(signal) = signals.recv().await {
                    let payload = match signal {
                        ExecutorSignal::StepStarted {
                            step_index,
                            step_name,
                        } => ProgressPayload::StepProgress {
                            variant: variant_index,
                            fold: fold_index,
                            step_index,
                            step_name,
                        },
                        ExecutorSignal::Log { level, message } => ProgressPayload::Log {
                            level,
                            message,
                            variant: Some(variant_index),
                            fold: Some(fold_index),
                        },
                    };
                    if let Err(e) = bus.publish(run_id, payload).await {
                        warn!(run_id = %run_id, error = %e, "dropping mid-fold signal");
                    }
                }
            })
        };

        let timing = telemetry::record_fold_start(run_id);
        let result = self.executor.execute_fold(ctx).instrument(span).await;
        // The executor future is done, so its reporter is gone and the
        // forwarder drains to completion.
        if let Err(e) = forwarder.await {
            warn!(run_id = %run_id, error = %e, "signal forwarder panicked");
        }
        let duration_ms = timing.elapsed().as_millis() as u64;

        let fold = match result {
            Ok(outcome) => Fold::completed(fold_index, fold_count, outcome.metrics, duration_ms),
            Err(e) => {
                info!(
                    run_id = %run_id,
                    variant = variant_index,
                    fold = fold_index,
                    error = %e,
                    "fold failed, continuing with remaining folds"
                );
                Fold::failed(fold_index, fold_count, e.to_string(), duration_ms)
            }
        };

        // Persist first. Only once the fold is durable do subscribers hear
        // about it.
        self.store
            .record_fold(run_id, variant_index, fold.clone())
            .await
            .map_err(|source| FatalRunError::StoreWrite { run_id, source })?;

        telemetry::record_fold_end(
            &timing,
            run.dataset.as_str(),
            run.pipeline.as_str(),
            fold.state.as_str(),
        );

        self.bus
            .publish(
                run_id,
                ProgressPayload::FoldProgress {
                    variant: variant_index,
                    fold: fold_index,
                    state: fold.state,
                    duration_ms: fold.duration_ms,
                    error: fold.error.clone(),
                },
            )
            .await?;
        if !fold.metrics.is_empty() {
            self.bus
                .publish(
                    run_id,
                    ProgressPayload::Metrics {
                        variant: variant_index,
                        fold: fold_index,
                        metrics: fold.metrics.clone(),
                    },
                )
                .await?;
        }

        Ok(fold)
    }

    /// Pause for shutdown without finalizing: the run stays `Running` in
    /// the store and recovery re-dispatches it on the next start.
    fn suspend(&self, run: &Run) -> RunState {
        info!(
            run_id = %run.id,
            completed = run.completed_folds(),
            "run suspended at fold boundary for shutdown"
        );
        RunState::Running
    }

    async fn finish_stopped(&self, run: &Run) -> Result<RunState, FatalRunError> {
        let run_id = run.id;
        self.store
            .finalize(run_id, RunState::Stopped, None, Utc::now())
            .await
            .map_err(|source| FatalRunError::StoreWrite { run_id, source })?;
        self.bus
            .publish(
                run_id,
                ProgressPayload::Stopped {
                    completed_folds: run.completed_folds(),
                },
            )
            .await?;
        telemetry::record_run_finished(run.dataset.as_str(), run.pipeline.as_str(), "stopped");
        info!(run_id = %run_id, completed = run.completed_folds(), "run stopped at fold boundary");
        Ok(RunState::Stopped)
    }

    async fn finish_processed(&self, run: &Run) -> Result<RunState, FatalRunError> {
        let run_id = run.id;
        let outcome = run.outcome_state();
        let error = match outcome {
            RunState::Failed => Some("all folds failed".to_string()),
            _ => None,
        };
        self.store
            .finalize(run_id, outcome, error.clone(), Utc::now())
            .await
            .map_err(|source| FatalRunError::StoreWrite { run_id, source })?;

        let payload = match outcome {
            RunState::Failed => ProgressPayload::Failed {
                error: error.unwrap_or_default(),
            },
            _ => ProgressPayload::Completed {
                completed_folds: run.completed_folds(),
                failed_folds: run.processed_folds() - run.completed_folds(),
            },
        };
        self.bus.publish(run_id, payload).await?;
        telemetry::record_run_finished(
            run.dataset.as_str(),
            run.pipeline.as_str(),
            outcome.as_str(),
        );
        info!(run_id = %run_id, state = %outcome, "run finished");
        Ok(outcome)
    }

    /// Best-effort transition to `Failed` after an infrastructure error.
    async fn mark_failed(
        &self,
        run_id: RunId,
        fatal: FatalRunError,
    ) -> Result<RunState, FatalRunError> {
        let message = fatal.to_string();
        match self
            .store
            .finalize(run_id, RunState::Failed, Some(message.clone()), Utc::now())
            .await
        {
            Ok(()) => {
                // The terminal event is best-effort too; the store already
                // has the authoritative state.
                if let Err(e) = self
                    .bus
                    .publish(run_id, ProgressPayload::Failed { error: message })
                    .await
                {
                    warn!(run_id = %run_id, error = %e, "could not publish failure event");
                }
                Ok(RunState::Failed)
            }
            Err(StoreError::AlreadyTerminal { current, .. }) => Ok(current),
            Err(_) => Err(fatal),
        }
    }
}
