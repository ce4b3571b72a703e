use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

use crate::error::{FatalRunError, SubscriptionError};
use crate::run::{FoldState, RunId};
use crate::store::RunStore;

/// Severity of a log event attributed to a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// What a progress event reports.
///
/// Serialized with an explicit `kind` tag so consumers can dispatch without
/// decoding the whole payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProgressPayload {
    /// Overall run progress after a fold reached a terminal state.
    Progress {
        /// Folds that reached any terminal state.
        processed_folds: usize,
        /// Folds that completed successfully.
        completed_folds: usize,
        total_folds: usize,
        /// Floor-rounded percentage; 100 only once every fold is recorded.
        percent: u8,
    },
    /// A log line from the engine or the operator executor.
    Log {
        level: LogLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        variant: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fold: Option<usize>,
    },
    /// Metric values produced by a completed fold.
    Metrics {
        variant: usize,
        fold: usize,
        metrics: std::collections::BTreeMap<String, f64>,
    },
    /// A fold changed state.
    FoldProgress {
        variant: usize,
        fold: usize,
        state: FoldState,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The runner moved on to a new variant.
    VariantProgress {
        variant: usize,
        total_variants: usize,
    },
    /// A pipeline step started inside an in-flight fold.
    StepProgress {
        variant: usize,
        fold: usize,
        step_index: usize,
        step_name: String,
    },
    /// Terminal: the run finished with at least one completed fold.
    Completed {
        completed_folds: usize,
        failed_folds: usize,
    },
    /// Terminal: every fold failed, or an infrastructure error aborted the run.
    Failed { error: String },
    /// Terminal: the run was stopped at a fold boundary on request.
    Stopped { completed_folds: usize },
}

impl ProgressPayload {
    /// The wire-level `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Log { .. } => "log",
            Self::Metrics { .. } => "metrics",
            Self::FoldProgress { .. } => "fold-progress",
            Self::VariantProgress { .. } => "variant-progress",
            Self::StepProgress { .. } => "step-progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stopped { .. } => "stopped",
        }
    }

    /// Whether this payload marks the end of the run's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Stopped { .. }
        )
    }
}

/// One event on a run's progress stream.
///
/// Sequence numbers are per-run, start at 1 and increase by exactly one per
/// event; they are assigned and durably appended before any subscriber sees
/// the event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: ProgressPayload,
}

struct RunChannel {
    next_sequence: u64,
    tx: broadcast::Sender<ProgressEvent>,
}

/// Per-run fan-out of progress events with replay.
///
/// The bus owns each run's sequence counter and broadcast channel behind one
/// lock shared with the durable append, which gives two guarantees:
/// write-then-notify (an event is in the store before any subscriber
/// receives it) and gap-free replay handoff (a subscriber's backlog read and
/// live attach happen atomically with respect to publishes).
pub struct ProgressBus {
    store: Arc<dyn RunStore>,
    capacity: usize,
    channels: Mutex<HashMap<RunId, RunChannel>>,
}

impl ProgressBus {
    pub fn new(store: Arc<dyn RunStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or reopen after restart) a run's channel.
    ///
    /// `last_sequence` is the highest sequence already in the store for this
    /// run, so numbering continues without gaps across process restarts.
    pub async fn register(&self, run_id: RunId, last_sequence: u64) {
        let mut channels = self.channels.lock().await;
        channels.entry(run_id).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(self.capacity);
            RunChannel {
                next_sequence: last_sequence + 1,
                tx,
            }
        });
    }

    /// Assign the next sequence, durably append, then fan out.
    ///
    /// If the append fails the event is never broadcast and the sequence is
    /// not consumed; the caller treats this as fatal for the run.
    pub async fn publish(
        &self,
        run_id: RunId,
        payload: ProgressPayload,
    ) -> Result<ProgressEvent, FatalRunError> {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .get_mut(&run_id)
            .ok_or(FatalRunError::EventAppend {
                run_id,
                source: crate::error::StoreError::RunNotFound(run_id),
            })?;

        let event = ProgressEvent {
            run_id,
            sequence: channel.next_sequence,
            timestamp: Utc::now(),
            payload,
        };
        self.store
            .append_event(&event)
            .await
            .map_err(|source| FatalRunError::EventAppend { run_id, source })?;
        channel.next_sequence += 1;
        // No receivers is fine; the store already has the event.
        let _ = channel.tx.send(event.clone());
        Ok(event)
    }

    /// Subscribe from a resume point.
    ///
    /// Returns every stored event with `sequence > from_sequence` followed by
    /// live events, without gap or duplicate. `from_sequence = 0` replays the
    /// whole log; a resume point beyond the log head is rejected.
    pub async fn subscribe(
        &self,
        run_id: RunId,
        from_sequence: u64,
    ) -> Result<Subscription, SubscriptionError> {
        let channels = self.channels.lock().await;
        let channel = channels
            .get(&run_id)
            .ok_or(SubscriptionError::UnknownRun(run_id))?;
        let head = channel.next_sequence - 1;
        if from_sequence > head {
            return Err(SubscriptionError::OutOfRange {
                run_id,
                requested: from_sequence,
                head,
            });
        }
        // Backlog read and live attach under the same lock as publish, so
        // nothing can slip between them.
        let backlog = self
            .store
            .events_after(run_id, from_sequence)
            .await
            .map_err(|_| SubscriptionError::UnknownRun(run_id))?;
        let rx = channel.tx.subscribe();
        Ok(Subscription {
            run_id,
            backlog: backlog.into(),
            rx,
        })
    }

    /// Drop a run's channel, ending any live subscriptions.
    ///
    /// Called when a run is deleted; stored events for other runs are
    /// unaffected.
    pub async fn retire(&self, run_id: RunId) {
        let mut channels = self.channels.lock().await;
        channels.remove(&run_id);
    }

    /// Whether a channel is currently open for this run.
    pub async fn is_registered(&self, run_id: RunId) -> bool {
        self.channels.lock().await.contains_key(&run_id)
    }
}

/// A live progress stream for one run: replayed backlog, then live events.
pub struct Subscription {
    run_id: RunId,
    backlog: VecDeque<ProgressEvent>,
    rx: broadcast::Receiver<ProgressEvent>,
}

impl Subscription {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Next event in sequence order.
    ///
    /// `Ok(None)` means the channel was retired and no more events will
    /// arrive. A lag error means the subscriber fell too far behind and must
    /// resubscribe from its last seen sequence.
    pub async fn next(&mut self) -> Result<Option<ProgressEvent>, SubscriptionError> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(SubscriptionError::Lagged {
                        run_id: self.run_id,
                        skipped,
                    });
                }
            }
        }
    }
}
