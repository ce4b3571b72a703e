//! Restart-resume tests against the journal-backed store: a process that
//! dies mid-run must pick up where the journal left off, without repeating
//! recorded folds or reusing event sequence numbers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::timeout;

use crucible::{
    DatasetShape, EngineConfig, ExperimentRequest, FoldContext, FoldError, FoldOutcome,
    InMemoryCatalog, JournalConfig, JournalStore, LogLevel, OperatorExecutor, PipelineNode,
    PipelineSpec, ProgressBus, ProgressPayload, RunId, RunScheduler, RunSchedulerBuilder,
    RunState, RunStore, StepDef, Subscription,
};

const WAIT: Duration = Duration::from_secs(5);

struct CountingExecutor {
    delay: Duration,
    calls: Mutex<Vec<(usize, usize)>>,
}

impl CountingExecutor {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn calls(&self) -> Vec<(usize, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperatorExecutor for CountingExecutor {
    async fn execute_fold(&self, ctx: FoldContext) -> Result<FoldOutcome, FoldError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls
            .lock()
            .unwrap()
            .push((ctx.variant_index, ctx.fold_index));
        Ok(FoldOutcome {
            metrics: BTreeMap::from([("rmse".into(), 0.3)]),
            artifact: None,
        })
    }
}

fn catalog(folds: usize) -> InMemoryCatalog {
    InMemoryCatalog::new()
        .with_dataset(
            "iris",
            DatasetShape {
                rows: 150,
                columns: vec!["feature".into(), "target".into()],
            },
        )
        .with_pipeline(PipelineSpec {
            reference: "baseline".into(),
            folds,
            required_columns: vec![],
            root: PipelineNode::Step(StepDef::new("linreg")),
        })
}

fn request() -> ExperimentRequest {
    ExperimentRequest {
        name: "recovery".into(),
        datasets: vec!["iris".into()],
        pipelines: vec!["baseline".into()],
    }
}

async fn open_store(path: &Path) -> Arc<JournalStore> {
    Arc::new(
        JournalStore::open(path, &JournalConfig { fsync: false })
            .await
            .expect("journal opens"),
    )
}

fn scheduler_on(store: Arc<JournalStore>, executor: Arc<dyn OperatorExecutor>) -> RunScheduler {
    RunSchedulerBuilder::new(EngineConfig::default())
        .with_catalog(Arc::new(catalog(3)))
        .with_store(store)
        .with_executor(executor)
        .build()
        .expect("scheduler wiring")
}

async fn drain_to_terminal(sub: &mut Subscription) -> Vec<ProgressPayload> {
    let mut payloads = Vec::new();
    loop {
        let event = timeout(WAIT, sub.next())
            .await
            .expect("event within deadline")
            .expect("subscription healthy")
            .expect("stream open until terminal");
        let terminal = event.payload.is_terminal();
        payloads.push(event.payload);
        if terminal {
            return payloads;
        }
    }
}

/// Write a partially-executed run into the journal the same way a live
/// engine would, then drop everything, as if the process died mid-run.
async fn simulate_crash_mid_run(path: &Path) -> RunId {
    let store = open_store(path).await;

    // Expand through the real expander so the journal holds a realistic
    // run, then journal a partial execution by hand instead of spinning up
    // a scheduler that would finish it.
    let expander = crucible::WorkExpander::new(Default::default());
    let expanded = expander
        .expand(&request(), &catalog(3))
        .expect("expansion succeeds");
    store
        .insert_experiment(&expanded.experiment)
        .await
        .expect("experiment journaled");
    store.insert_runs(&expanded.runs).await.expect("runs journaled");
    let run_id = expanded.runs[0].id;

    let bus = ProgressBus::new(Arc::clone(&store) as Arc<dyn RunStore>, 64);
    bus.register(run_id, 0).await;
    store
        .mark_running(run_id, Utc::now())
        .await
        .expect("run marked running");
    store
        .record_fold(
            run_id,
            0,
            crucible::Fold::completed(0, 3, BTreeMap::from([("rmse".into(), 0.5)]), 8),
        )
        .await
        .expect("fold 0 journaled");
    bus.publish(
        run_id,
        ProgressPayload::FoldProgress {
            variant: 0,
            fold: 0,
            state: crucible::FoldState::Completed,
            duration_ms: Some(8),
            error: None,
        },
    )
    .await
    .expect("fold event published");
    bus.publish(
        run_id,
        ProgressPayload::Log {
            level: LogLevel::Info,
            message: "about to die".into(),
            variant: None,
            fold: None,
        },
    )
    .await
    .expect("log event published");

    run_id
}

#[tokio::test]
async fn test_recover_resumes_interrupted_run_without_repeating_folds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.jsonl");
    let run_id = simulate_crash_mid_run(&path).await;

    // "Restart": reopen the journal and recover.
    let store = open_store(&path).await;
    let run = store.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Running, "interrupted run replays as running");
    assert_eq!(run.completed_folds(), 1);

    let executor = Arc::new(CountingExecutor::new());
    let scheduler = scheduler_on(store, Arc::clone(&executor) as Arc<dyn OperatorExecutor>);
    let resumed = scheduler.recover().await.unwrap();
    assert_eq!(resumed, 1);

    let mut sub = scheduler.subscribe(run_id, 0).await.unwrap();
    drain_to_terminal(&mut sub).await;

    // Only folds 1 and 2 were executed after the restart.
    assert_eq!(executor.calls(), vec![(0, 1), (0, 2)]);
    let run = scheduler.run_snapshot(run_id).await.unwrap().run;
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.completed_folds(), 3);
    // The pre-crash metric value survived; the fold was not overwritten.
    assert_eq!(
        run.variants[0].folds[0].metrics.get("rmse").copied(),
        Some(0.5)
    );
}

#[tokio::test]
async fn test_sequences_continue_across_restart_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.jsonl");
    let run_id = simulate_crash_mid_run(&path).await;

    let store = open_store(&path).await;
    let pre_crash_head = store.last_sequence(run_id).await.unwrap();
    assert_eq!(pre_crash_head, 2);

    let scheduler = scheduler_on(store, Arc::new(CountingExecutor::new()));
    scheduler.recover().await.unwrap();
    let mut sub = scheduler.subscribe(run_id, 0).await.unwrap();
    drain_to_terminal(&mut sub).await;

    let events = scheduler.run_snapshot(run_id).await.unwrap();
    // Full replay from zero is strictly sequential: pre-crash events first,
    // post-restart events continuing from the journaled head.
    let mut replay = scheduler.subscribe(run_id, 0).await.unwrap();
    let mut expected = 1u64;
    loop {
        let event = timeout(WAIT, replay.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(event.sequence, expected);
        expected += 1;
        if event.payload.is_terminal() {
            break;
        }
    }
    assert_eq!(expected - 1, events.last_sequence);
    assert!(events.last_sequence > pre_crash_head);

    // Exactly one terminal fold event per fold across crash and resume.
    let log = {
        let mut sub = scheduler.subscribe(run_id, 0).await.unwrap();
        drain_to_terminal(&mut sub).await
    };
    for fold in 0..3usize {
        let count = log
            .iter()
            .filter(|p| matches!(p, ProgressPayload::FoldProgress { fold: f, .. } if *f == fold))
            .count();
        assert_eq!(count, 1, "fold {fold} must be reported exactly once");
    }
}

#[tokio::test]
async fn test_event_log_projection_matches_run_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.jsonl");

    let executor = Arc::new(CountingExecutor::new());
    {
        let store = open_store(&path).await;
        let scheduler =
            scheduler_on(store, Arc::clone(&executor) as Arc<dyn OperatorExecutor>);
        let expanded = scheduler.submit(request()).await.unwrap();
        let run_id = expanded.runs[0].id;
        let mut sub = scheduler.subscribe(run_id, 0).await.unwrap();
        drain_to_terminal(&mut sub).await;
        scheduler.shutdown().await.unwrap();
    }

    // Reopen cold and compare the event log against the stored run.
    let store = open_store(&path).await;
    let runs = store.list_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.state, RunState::Completed);

    let events = store.events_after(run.id, 0).await.unwrap();
    let last_progress = events
        .iter()
        .rev()
        .find_map(|e| match &e.payload {
            ProgressPayload::Progress {
                processed_folds,
                completed_folds,
                total_folds,
                percent,
            } => Some((*processed_folds, *completed_folds, *total_folds, *percent)),
            _ => None,
        })
        .expect("at least one progress event");
    assert_eq!(
        last_progress,
        (
            run.processed_folds(),
            run.completed_folds(),
            run.total_folds(),
            run.progress_percent()
        )
    );
    assert!(events.last().unwrap().payload.is_terminal());
}

#[tokio::test]
async fn test_terminal_runs_are_not_requeued_on_recover() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.jsonl");

    {
        let store = open_store(&path).await;
        let scheduler = scheduler_on(store, Arc::new(CountingExecutor::new()));
        let expanded = scheduler.submit(request()).await.unwrap();
        let mut sub = scheduler.subscribe(expanded.runs[0].id, 0).await.unwrap();
        drain_to_terminal(&mut sub).await;
        scheduler.shutdown().await.unwrap();
    }

    let store = open_store(&path).await;
    let executor = Arc::new(CountingExecutor::new());
    let scheduler = scheduler_on(store, Arc::clone(&executor) as Arc<dyn OperatorExecutor>);
    let resumed = scheduler.recover().await.unwrap();
    assert_eq!(resumed, 0);
    assert!(executor.calls().is_empty());

    // The terminal run is still fully subscribable as pure replay.
    let runs = scheduler.list_runs().await.unwrap();
    let mut sub = scheduler.subscribe(runs[0].id, 0).await.unwrap();
    let payloads = drain_to_terminal(&mut sub).await;
    assert!(matches!(
        payloads.last(),
        Some(ProgressPayload::Completed { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_mid_run_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.jsonl");

    // First process: start a long run, shut down while it is executing.
    let (run_id, executed_before) = {
        let store = open_store(&path).await;
        let executor = Arc::new(CountingExecutor::slow(Duration::from_millis(10)));
        let scheduler = RunSchedulerBuilder::new(EngineConfig::default())
            .with_catalog(Arc::new(catalog(20)))
            .with_store(store)
            .with_executor(Arc::clone(&executor) as Arc<dyn OperatorExecutor>)
            .build()
            .expect("scheduler wiring");
        let expanded = scheduler.submit(request()).await.unwrap();
        let run_id = expanded.runs[0].id;
        tokio::time::sleep(Duration::from_millis(35)).await;
        timeout(WAIT, scheduler.shutdown()).await.unwrap().unwrap();
        (run_id, executor.calls().len())
    };
    assert!(executed_before > 0 && executed_before < 20);

    // Second process: the run replays as Running, is requeued by recover
    // and finishes from where it paused, without repeating folds.
    let store = open_store(&path).await;
    assert_eq!(store.run(run_id).await.unwrap().state, RunState::Running);

    let executor = Arc::new(CountingExecutor::new());
    let scheduler = scheduler_on(store, Arc::clone(&executor) as Arc<dyn OperatorExecutor>);
    assert_eq!(scheduler.recover().await.unwrap(), 1);

    let mut sub = scheduler.subscribe(run_id, 0).await.unwrap();
    drain_to_terminal(&mut sub).await;

    let run = scheduler.run_snapshot(run_id).await.unwrap().run;
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.completed_folds(), 20);
    assert_eq!(executor.calls().len(), 20 - executed_before);
}
