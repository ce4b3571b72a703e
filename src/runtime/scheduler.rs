use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::budget::RunBudget;
use crate::config::EngineConfig;
use crate::error::{SchedulerError, SubscriptionError};
use crate::events::{ProgressBus, ProgressPayload, Subscription};
use crate::executor::OperatorExecutor;
use crate::expand::{ExpandedExperiment, ExperimentRequest, WorkExpander};
use crate::pipeline::CatalogHandle;
use crate::run::{Experiment, ExperimentId, FoldState, Run, RunId, RunState, Variant};
use crate::store::{RunSnapshot, RunStore};
use crate::telemetry;

use super::runner::{RunWorker, StopToken};

/// Queued and executing runs, under one lock so a run can never be seen in
/// both places (or neither) by a concurrent stop request.
struct SchedState {
    queue: VecDeque<RunId>,
    active: HashMap<RunId, StopToken>,
}

struct SchedulerInner {
    config: EngineConfig,
    catalog: CatalogHandle,
    store: Arc<dyn RunStore>,
    bus: Arc<ProgressBus>,
    executor: Arc<dyn OperatorExecutor>,
    expander: WorkExpander,
    budget: RunBudget,
    sched: Mutex<SchedState>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: StopToken,
}

/// Front door of the engine: accepts experiments, dispatches runs under the
/// concurrency budget and mediates stop/retry/delete/subscribe.
///
/// Cheap to clone; all clones share one scheduler.
#[derive(Clone)]
pub struct RunScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for RunScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunScheduler").finish_non_exhaustive()
    }
}

impl RunScheduler {
    pub(crate) fn new(
        config: EngineConfig,
        catalog: CatalogHandle,
        store: Arc<dyn RunStore>,
        executor: Arc<dyn OperatorExecutor>,
    ) -> Self {
        let bus = Arc::new(ProgressBus::new(
            Arc::clone(&store),
            config.event_channel_capacity,
        ));
        let budget = RunBudget::new(config.max_concurrent_runs);
        let expander = WorkExpander::new(config.limits);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                catalog,
                store,
                bus,
                executor,
                expander,
                budget,
                sched: Mutex::new(SchedState {
                    queue: VecDeque::new(),
                    active: HashMap::new(),
                }),
                handles: Mutex::new(Vec::new()),
                shutdown: StopToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Expand an experiment request into runs and queue them all.
    ///
    /// Expansion failures surface here, synchronously, before anything is
    /// persisted; a request that fails validation leaves no trace.
    pub async fn submit(
        &self,
        request: ExperimentRequest,
    ) -> Result<ExpandedExperiment, SchedulerError> {
        if self.inner.shutdown.is_stop_requested() {
            return Err(SchedulerError::ShuttingDown);
        }

        let span = telemetry::expand_span(
            &request.name,
            request.datasets.len(),
            request.pipelines.len(),
        );
        let _enter = span.enter();
        let expanded = self
            .inner
            .expander
            .expand(&request, self.inner.catalog.as_ref())?;
        drop(_enter);

        self.inner
            .store
            .insert_experiment(&expanded.experiment)
            .await?;
        self.inner.store.insert_runs(&expanded.runs).await?;

        {
            let mut sched = self.inner.sched.lock().await;
            for run in &expanded.runs {
                self.inner.bus.register(run.id, 0).await;
                sched.queue.push_back(run.id);
            }
        }
        info!(
            experiment = %expanded.experiment.id,
            runs = expanded.runs.len(),
            "experiment submitted"
        );

        Self::pump(Arc::clone(&self.inner)).await;
        Ok(expanded)
    }

    /// Boxed [`Self::pump`], used where a worker task re-pumps on
    /// completion (breaks the cycle in the future's type).
    fn pump_boxed(
        inner: Arc<SchedulerInner>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>> {
        Box::pin(Self::pump(inner))
    }

    /// Dispatch queued runs while budget slots are free.
    async fn pump(inner: Arc<SchedulerInner>) {
        loop {
            if inner.shutdown.is_stop_requested() {
                return;
            }
            let Some(slot) = inner.budget.try_acquire() else {
                return;
            };
            let (run_id, stop) = {
                let mut sched = inner.sched.lock().await;
                let Some(run_id) = sched.queue.pop_front() else {
                    return; // slot drops, capacity returns
                };
                let stop = StopToken::new();
                sched.active.insert(run_id, stop.clone());
                (run_id, stop)
            };
            telemetry::set_budget_utilization(inner.budget.active(), inner.budget.utilization());

            let task_inner = Arc::clone(&inner);
            let handle = tokio::spawn(async move {
                let worker = RunWorker::new(
                    Arc::clone(&task_inner.store),
                    Arc::clone(&task_inner.bus),
                    Arc::clone(&task_inner.executor),
                    task_inner.shutdown.clone(),
                );
                match worker.execute(run_id, stop).await {
                    Ok(state) => debug!(run_id = %run_id, state = %state, "run worker finished"),
                    Err(e) => warn!(run_id = %run_id, error = %e, "run worker could not record failure"),
                }

                {
                    let mut sched = task_inner.sched.lock().await;
                    sched.active.remove(&run_id);
                }
                drop(slot);
                telemetry::set_budget_utilization(
                    task_inner.budget.active(),
                    task_inner.budget.utilization(),
                );
                Self::pump_boxed(task_inner).await;
            });
            push_worker_handle(&inner, handle).await;
        }
    }

    /// Request a graceful stop of one run.
    ///
    /// Executing runs stop at the next fold boundary; queued runs are
    /// finalized `Stopped` immediately. Stopping a terminal run is a no-op.
    pub async fn stop(&self, run_id: RunId) -> Result<(), SchedulerError> {
        {
            let mut sched = self.inner.sched.lock().await;
            if let Some(stop) = sched.active.get(&run_id) {
                stop.request_stop();
                info!(run_id = %run_id, "stop requested, takes effect at next fold boundary");
                return Ok(());
            }
            if let Some(pos) = sched.queue.iter().position(|id| *id == run_id) {
                sched.queue.remove(pos);
            }
        }

        let run = self.inner.store.run(run_id).await?;
        if run.state.is_terminal() {
            return Ok(());
        }

        self.inner
            .store
            .finalize(run_id, RunState::Stopped, None, Utc::now())
            .await?;
        if let Err(e) = self
            .inner
            .bus
            .publish(
                run_id,
                ProgressPayload::Stopped {
                    completed_folds: run.completed_folds(),
                },
            )
            .await
        {
            warn!(run_id = %run_id, error = %e, "could not publish stop event");
        }
        info!(run_id = %run_id, "queued run stopped");
        Ok(())
    }

    /// Create and queue a fresh run from a terminal one.
    ///
    /// Completed folds are carried over as a checkpoint, so the new run only
    /// executes what the old one did not finish. Failed and pending folds
    /// start over. The new run records its lineage via `retry_of`.
    pub async fn retry(&self, run_id: RunId) -> Result<Run, SchedulerError> {
        if self.inner.shutdown.is_stop_requested() {
            return Err(SchedulerError::ShuttingDown);
        }

        let old = self.inner.store.run(run_id).await?;
        if !old.state.is_terminal() {
            return Err(SchedulerError::Store(crate::error::StoreError::NotTerminal {
                run_id,
                current: old.state,
            }));
        }

        let variants = old
            .variants
            .iter()
            .map(|v| {
                let mut fresh = Variant::new(v.index, v.total, v.steps.clone(), v.folds.len());
                for (i, fold) in v.folds.iter().enumerate() {
                    if fold.state == FoldState::Completed {
                        fresh.folds[i] = fold.clone();
                    }
                }
                fresh
            })
            .collect();
        let mut run = Run::new(
            old.experiment_id,
            old.dataset.clone(),
            old.pipeline.clone(),
            variants,
        );
        run.retry_of = Some(old.id);

        self.inner
            .store
            .insert_runs(std::slice::from_ref(&run))
            .await?;
        {
            let mut sched = self.inner.sched.lock().await;
            self.inner.bus.register(run.id, 0).await;
            sched.queue.push_back(run.id);
        }
        info!(
            run_id = %run.id,
            retry_of = %old.id,
            carried_folds = run.completed_folds(),
            "run retried"
        );

        Self::pump(Arc::clone(&self.inner)).await;
        Ok(run)
    }

    /// Remove a terminal run, its folds and its event log.
    pub async fn delete_run(&self, run_id: RunId) -> Result<(), SchedulerError> {
        self.inner.store.delete_run(run_id).await?;
        self.inner.bus.retire(run_id).await;
        info!(run_id = %run_id, "run deleted");
        Ok(())
    }

    /// Subscribe to a run's progress stream from a resume point.
    ///
    /// Works for executing and terminal runs alike; for a terminal run the
    /// stream is pure replay ending at the terminal event.
    pub async fn subscribe(
        &self,
        run_id: RunId,
        from_sequence: u64,
    ) -> Result<Subscription, SubscriptionError> {
        match self.inner.bus.subscribe(run_id, from_sequence).await {
            Err(SubscriptionError::UnknownRun(_)) => {
                // Known to the store but not yet to the bus (e.g. observed
                // after a restart, before the run was redispatched).
                let last = self
                    .inner
                    .store
                    .last_sequence(run_id)
                    .await
                    .map_err(|_| SubscriptionError::UnknownRun(run_id))?;
                self.inner.bus.register(run_id, last).await;
                self.inner.bus.subscribe(run_id, from_sequence).await
            }
            other => other,
        }
    }

    /// Consistent run + event-log position, for polling clients.
    pub async fn run_snapshot(&self, run_id: RunId) -> Result<RunSnapshot, SchedulerError> {
        Ok(self.inner.store.snapshot(run_id).await?)
    }

    pub async fn run_state(&self, run_id: RunId) -> Result<RunState, SchedulerError> {
        Ok(self.inner.store.run(run_id).await?.state)
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>, SchedulerError> {
        Ok(self.inner.store.list_runs().await?)
    }

    pub async fn experiment(&self, id: ExperimentId) -> Result<Experiment, SchedulerError> {
        Ok(self.inner.store.experiment(id).await?)
    }

    /// Re-queue every non-terminal run found in the store.
    ///
    /// Called once after opening a persistent store: interrupted `Running`
    /// runs and never-started `Queued` runs go back on the queue, with their
    /// event sequence numbering continued from where the log left off.
    /// Terminal folds inside resumed runs are skipped by the runner.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let mut runs = self.inner.store.list_runs().await?;
        runs.sort_by_key(|r| r.created_at);

        let mut resumed = 0usize;
        {
            let mut sched = self.inner.sched.lock().await;
            for run in runs {
                let last = self.inner.store.last_sequence(run.id).await?;
                self.inner.bus.register(run.id, last).await;
                if run.state.is_terminal() {
                    continue;
                }
                if sched.queue.contains(&run.id) || sched.active.contains_key(&run.id) {
                    continue;
                }
                sched.queue.push_back(run.id);
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "recovered interrupted runs");
        }
        Self::pump(Arc::clone(&self.inner)).await;
        Ok(resumed)
    }

    /// Graceful shutdown: stop accepting work and wait for workers to pause.
    ///
    /// Executing runs pause at their next fold boundary and stay durably
    /// `Running`; together with still-`Queued` runs they are picked up by
    /// `recover` on the next start. Only a user `stop` finalizes a run as
    /// `Stopped`.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        info!("scheduler shutting down");
        self.inner.shutdown.request_stop();

        let handles = {
            let mut guard = self.inner.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let grace = Duration::from_secs(self.inner.config.shutdown_grace_secs);
        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "run worker panicked during shutdown"),
                Err(_) => warn!("run worker did not drain within the grace period"),
            }
        }
        info!("scheduler shut down");
        Ok(())
    }
}

async fn push_worker_handle(inner: &Arc<SchedulerInner>, handle: tokio::task::JoinHandle<()>) {
    let mut guard = inner.handles.lock().await;
    // Finished workers leave completed handles behind; reap them here so
    // the vector stays bounded by the budget plus history since the last
    // pump.
    guard.retain(|h| !h.is_finished());
    guard.push(handle);
}
