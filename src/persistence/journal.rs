use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::JournalConfig;
use crate::error::StoreError;
use crate::events::ProgressEvent;
use crate::run::{Experiment, ExperimentId, Fold, Run, RunId, RunState};
use crate::store::{RunSnapshot, RunStore, StoreState};

/// One journaled state change, a single JSON line on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
enum JournalRecord {
    ExperimentInserted {
        experiment: Experiment,
    },
    RunsInserted {
        runs: Vec<Run>,
    },
    RunStarted {
        run_id: RunId,
        started_at: DateTime<Utc>,
    },
    FoldRecorded {
        run_id: RunId,
        variant: usize,
        fold: Fold,
    },
    RunFinalized {
        run_id: RunId,
        state: RunState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        finished_at: DateTime<Utc>,
    },
    EventAppended {
        event: ProgressEvent,
    },
    RunDeleted {
        run_id: RunId,
    },
}

struct JournalInner {
    state: StoreState,
    file: File,
    path: PathBuf,
    fsync: bool,
}

impl JournalInner {
    /// Append one record as a whole line, then flush (and fsync when
    /// configured). Line granularity is what makes fold records atomic: a
    /// torn write leaves a partial last line, which replay rejects, never a
    /// half-applied fold.
    async fn append(&mut self, record: &JournalRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        if self.fsync {
            self.file.sync_data().await?;
        }
        Ok(())
    }
}

/// File-backed [`RunStore`]: an in-memory projection plus an append-only
/// JSON-lines journal.
///
/// Every mutation is admission-checked against the projection, appended to
/// the journal, and applied in memory only once the append succeeded. A
/// failed append therefore leaves the projection unchanged, and the journal
/// never trails behind what callers were told happened.
pub struct JournalStore {
    inner: Mutex<JournalInner>,
}

impl JournalStore {
    /// Open (creating if absent) and replay the journal at `path`.
    pub async fn open(path: impl AsRef<Path>, config: &JournalConfig) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut state = StoreState::default();
        let mut records = 0usize;

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (number, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record: JournalRecord =
                        serde_json::from_str(line).map_err(|e| StoreError::CorruptJournal {
                            line: number + 1,
                            message: e.to_string(),
                        })?;
                    apply(&mut state, record).map_err(|e| StoreError::CorruptJournal {
                        line: number + 1,
                        message: e.to_string(),
                    })?;
                    records += 1;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "journal does not exist yet, starting fresh");
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            path = %path.display(),
            records,
            runs = state.runs.len(),
            "journal replayed"
        );

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            inner: Mutex::new(JournalInner {
                state,
                file,
                path,
                fsync: config.fsync,
            }),
        })
    }

    /// Rewrite the journal as a minimal snapshot of current state.
    ///
    /// Drops superseded records (per-fold writes already folded into their
    /// runs, deleted runs' history). The snapshot is written to a sibling
    /// file and renamed into place so a crash mid-compaction leaves the old
    /// journal intact.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        let tmp_path = inner.path.with_extension("compact");
        let mut tmp = File::create(&tmp_path).await?;

        for experiment in inner.state.experiments.values() {
            let record = JournalRecord::ExperimentInserted {
                experiment: experiment.clone(),
            };
            write_line(&mut tmp, &record).await?;
        }
        if !inner.state.runs.is_empty() {
            let record = JournalRecord::RunsInserted {
                runs: inner.state.runs.values().cloned().collect(),
            };
            write_line(&mut tmp, &record).await?;
        }
        for log in inner.state.events.values() {
            for event in log {
                let record = JournalRecord::EventAppended {
                    event: event.clone(),
                };
                write_line(&mut tmp, &record).await?;
            }
        }
        tmp.flush().await?;
        tmp.sync_data().await?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &inner.path).await?;
        inner.file = OpenOptions::new().append(true).open(&inner.path).await?;
        info!(path = %inner.path.display(), "journal compacted");
        Ok(())
    }
}

async fn write_line(file: &mut File, record: &JournalRecord) -> Result<(), StoreError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    Ok(())
}

/// Apply a replayed record to the projection.
///
/// Replay re-runs the same mutations the live path validated, so a failure
/// here means the journal and the validation rules disagree and the file is
/// treated as corrupt.
fn apply(state: &mut StoreState, record: JournalRecord) -> Result<(), StoreError> {
    match record {
        JournalRecord::ExperimentInserted { experiment } => {
            state.experiments.insert(experiment.id, experiment);
            Ok(())
        }
        JournalRecord::RunsInserted { runs } => {
            state.apply_insert_runs(&runs);
            Ok(())
        }
        JournalRecord::RunStarted { run_id, started_at } => {
            state.apply_mark_running(run_id, started_at)
        }
        JournalRecord::FoldRecorded {
            run_id,
            variant,
            fold,
        } => state.apply_fold(run_id, variant, fold),
        JournalRecord::RunFinalized {
            run_id,
            state: run_state,
            error,
            finished_at,
        } => state.apply_finalize(run_id, run_state, error, finished_at),
        JournalRecord::EventAppended { event } => state.apply_event(&event),
        JournalRecord::RunDeleted { run_id } => state.apply_delete(run_id),
    }
}

#[async_trait]
impl RunStore for JournalStore {
    async fn insert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .append(&JournalRecord::ExperimentInserted {
                experiment: experiment.clone(),
            })
            .await?;
        inner
            .state
            .experiments
            .insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn experiment(&self, id: ExperimentId) -> Result<Experiment, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .state
            .experiments
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::ExperimentNotFound(id.to_string()))
    }

    async fn insert_runs(&self, runs: &[Run]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .append(&JournalRecord::RunsInserted {
                runs: runs.to_vec(),
            })
            .await?;
        inner.state.apply_insert_runs(runs);
        Ok(())
    }

    async fn run(&self, id: RunId) -> Result<Run, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .state
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.state.runs.values().cloned().collect())
    }

    async fn mark_running(&self, id: RunId, started_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.state.check_mark_running(id)?;
        inner
            .append(&JournalRecord::RunStarted {
                run_id: id,
                started_at,
            })
            .await?;
        inner.state.apply_mark_running(id, started_at)
    }

    async fn record_fold(&self, id: RunId, variant: usize, fold: Fold) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.state.check_fold_writable(id, variant, fold.index)?;
        inner
            .append(&JournalRecord::FoldRecorded {
                run_id: id,
                variant,
                fold: fold.clone(),
            })
            .await?;
        inner.state.apply_fold(id, variant, fold)
    }

    async fn finalize(
        &self,
        id: RunId,
        state: RunState,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.check_finalize(id, state)? {
            return Ok(());
        }
        inner
            .append(&JournalRecord::RunFinalized {
                run_id: id,
                state,
                error: error.clone(),
                finished_at,
            })
            .await?;
        inner.state.apply_finalize(id, state, error, finished_at)
    }

    async fn append_event(&self, event: &ProgressEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.state.check_run_exists(event.run_id)?;
        inner
            .append(&JournalRecord::EventAppended {
                event: event.clone(),
            })
            .await?;
        inner.state.apply_event(event)
    }

    async fn events_after(&self, id: RunId, after: u64) -> Result<Vec<ProgressEvent>, StoreError> {
        let inner = self.inner.lock().await;
        if !inner.state.runs.contains_key(&id) {
            return Err(StoreError::RunNotFound(id));
        }
        Ok(inner
            .state
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
        let inner = self.inner.lock().await;
        if !inner.state.runs.contains_key(&id) {
            return Err(StoreError::RunNotFound(id));
        }
        Ok(inner.state.last_sequence_for(id))
    }

    async fn snapshot(&self, id: RunId) -> Result<RunSnapshot, StoreError> {
        let inner = self.inner.lock().await;
        let run = inner
            .state
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))?;
        let last_sequence = inner.state.last_sequence_for(id);
        Ok(RunSnapshot { run, last_sequence })
    }

    async fn delete_run(&self, id: RunId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.state.check_delete(id)?;
        inner
            .append(&JournalRecord::RunDeleted { run_id: id })
            .await?;
        warn!(run_id = %id, "run deleted from journal projection");
        inner.state.apply_delete(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LogLevel, ProgressPayload};
    use crate::pipeline::{DatasetRef, PipelineRef};
    use crate::run::{ExperimentId, Variant};
    use std::collections::BTreeMap;

    fn sample_run() -> Run {
        Run::new(
            ExperimentId::new(),
            DatasetRef::from("iris"),
            PipelineRef::from("base"),
            vec![Variant::new(0, 1, vec![], 3)],
        )
    }

    fn log_event(run_id: RunId, sequence: u64) -> ProgressEvent {
        ProgressEvent {
            run_id,
            sequence,
            timestamp: Utc::now(),
            payload: ProgressPayload::Log {
                level: LogLevel::Info,
                message: format!("event {sequence}"),
                variant: None,
                fold: None,
            },
        }
    }

    #[tokio::test]
    async fn test_reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let config = JournalConfig { fsync: false };

        let run = sample_run();
        let run_id = run.id;
        {
            let store = JournalStore::open(&path, &config).await.unwrap();
            store.insert_runs(&[run]).await.unwrap();
            store.mark_running(run_id, Utc::now()).await.unwrap();
            store
                .record_fold(
                    run_id,
                    0,
                    Fold::completed(0, 3, BTreeMap::from([("rmse".into(), 0.42)]), 10),
                )
                .await
                .unwrap();
            store.append_event(&log_event(run_id, 1)).await.unwrap();
        }

        let store = JournalStore::open(&path, &config).await.unwrap();
        let run = store.run(run_id).await.unwrap();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.completed_folds(), 1);
        assert_eq!(
            run.variants[0].folds[0].metrics.get("rmse").copied(),
            Some(0.42)
        );
        assert_eq!(store.last_sequence(run_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finalized_run_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let config = JournalConfig { fsync: false };

        let run = sample_run();
        let run_id = run.id;
        {
            let store = JournalStore::open(&path, &config).await.unwrap();
            store.insert_runs(&[run]).await.unwrap();
            store
                .finalize(run_id, RunState::Stopped, None, Utc::now())
                .await
                .unwrap();
        }

        let store = JournalStore::open(&path, &config).await.unwrap();
        assert_eq!(store.run(run_id).await.unwrap().state, RunState::Stopped);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_reported_with_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        tokio::fs::write(&path, "{\"record\":\"nope\"\n")
            .await
            .unwrap();

        let err = JournalStore::open(&path, &JournalConfig::default()).await;
        assert!(matches!(
            err,
            Err(StoreError::CorruptJournal { line: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_deleted_run_stays_deleted_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let config = JournalConfig { fsync: false };

        let run = sample_run();
        let run_id = run.id;
        {
            let store = JournalStore::open(&path, &config).await.unwrap();
            store.insert_runs(&[run]).await.unwrap();
            store
                .finalize(run_id, RunState::Completed, None, Utc::now())
                .await
                .unwrap();
            store.delete_run(run_id).await.unwrap();
        }

        let store = JournalStore::open(&path, &config).await.unwrap();
        assert!(matches!(
            store.run(run_id).await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_compact_preserves_state_and_drops_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let config = JournalConfig { fsync: false };

        let run = sample_run();
        let run_id = run.id;
        let store = JournalStore::open(&path, &config).await.unwrap();
        store.insert_runs(&[run]).await.unwrap();
        store.mark_running(run_id, Utc::now()).await.unwrap();
        for i in 0..3 {
            store
                .record_fold(run_id, 0, Fold::completed(i, 3, BTreeMap::new(), 5))
                .await
                .unwrap();
        }
        store
            .finalize(run_id, RunState::Completed, None, Utc::now())
            .await
            .unwrap();

        let before = tokio::fs::read_to_string(&path).await.unwrap().lines().count();
        store.compact().await.unwrap();
        let after = tokio::fs::read_to_string(&path).await.unwrap().lines().count();
        assert!(after < before);

        // State identical through the compaction, and the file still replays.
        assert_eq!(store.run(run_id).await.unwrap().completed_folds(), 3);
        drop(store);
        let reopened = JournalStore::open(&path, &config).await.unwrap();
        let run = reopened.run(run_id).await.unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.completed_folds(), 3);
    }

    #[tokio::test]
    async fn test_fold_rewrite_rejected_without_journaling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let config = JournalConfig { fsync: false };

        let run = sample_run();
        let run_id = run.id;
        let store = JournalStore::open(&path, &config).await.unwrap();
        store.insert_runs(&[run]).await.unwrap();
        store
            .record_fold(run_id, 0, Fold::completed(0, 3, BTreeMap::new(), 5))
            .await
            .unwrap();
        let err = store
            .record_fold(run_id, 0, Fold::completed(0, 3, BTreeMap::new(), 5))
            .await;
        assert!(matches!(err, Err(StoreError::FoldAlreadyRecorded { .. })));
        drop(store);

        // The rejected write never reached disk, so replay still succeeds.
        let reopened = JournalStore::open(&path, &config).await.unwrap();
        assert_eq!(reopened.run(run_id).await.unwrap().completed_folds(), 1);
    }

    async fn line_count(path: &Path) -> usize {
        tokio::fs::read_to_string(path)
            .await
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn test_rejected_mutations_touch_neither_disk_nor_projection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let config = JournalConfig { fsync: false };

        let run = sample_run();
        let run_id = run.id;
        let store = JournalStore::open(&path, &config).await.unwrap();
        store.insert_runs(&[run]).await.unwrap();
        store
            .finalize(run_id, RunState::Stopped, None, Utc::now())
            .await
            .unwrap();
        let before = line_count(&path).await;

        let err = store.mark_running(run_id, Utc::now()).await;
        assert!(matches!(err, Err(StoreError::AlreadyTerminal { .. })));
        let err = store
            .record_fold(run_id, 7, Fold::completed(0, 3, BTreeMap::new(), 5))
            .await;
        assert!(matches!(err, Err(StoreError::VariantOutOfRange { .. })));
        let err = store.append_event(&log_event(RunId::new(), 1)).await;
        assert!(matches!(err, Err(StoreError::RunNotFound(_))));

        assert_eq!(line_count(&path).await, before);
        assert_eq!(store.run(run_id).await.unwrap().state, RunState::Stopped);
        drop(store);

        let reopened = JournalStore::open(&path, &config).await.unwrap();
        assert_eq!(reopened.run(run_id).await.unwrap().state, RunState::Stopped);
    }

    #[tokio::test]
    async fn test_idempotent_refinalize_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let config = JournalConfig { fsync: false };

        let run = sample_run();
        let run_id = run.id;
        let store = JournalStore::open(&path, &config).await.unwrap();
        store.insert_runs(&[run]).await.unwrap();
        store
            .finalize(run_id, RunState::Completed, None, Utc::now())
            .await
            .unwrap();
        let before = line_count(&path).await;

        store
            .finalize(run_id, RunState::Completed, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(line_count(&path).await, before);
    }
}
