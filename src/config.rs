use serde::{Deserialize, Serialize};

/// Guard rails for work expansion.
///
/// Generator nodes multiply combinatorially; these limits turn a runaway
/// pipeline definition into a single expansion error instead of an
/// unbounded run list.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ExpansionLimits {
    /// Maximum variants a single pipeline may expand into.
    pub max_variants_per_run: usize,
    /// Maximum folds across one whole experiment submission.
    pub max_total_folds: usize,
}

impl Default for ExpansionLimits {
    fn default() -> Self {
        Self {
            max_variants_per_run: 256,
            max_total_folds: 10_000,
        }
    }
}

/// Configuration for the durable run journal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Whether to fsync after every appended record.
    ///
    /// Disabling trades crash durability for throughput; fold atomicity is
    /// unaffected either way because records are whole lines.
    pub fsync: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { fsync: true }
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of runs executing at the same time.
    pub max_concurrent_runs: usize,
    /// Broadcast buffer size per run channel; subscribers that fall further
    /// behind than this observe a lag error and must resync.
    pub event_channel_capacity: usize,
    /// Seconds to wait for in-flight folds when shutting down.
    pub shutdown_grace_secs: u64,
    pub limits: ExpansionLimits,
    pub journal: JournalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 2,
            event_channel_capacity: 1024,
            shutdown_grace_secs: 30,
            limits: ExpansionLimits::default(),
            journal: JournalConfig::default(),
        }
    }
}
