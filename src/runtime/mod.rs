/// Builder for constructing scheduler instances.
pub mod builder;
/// Per-run execution worker and cooperative stop token.
pub mod runner;
/// Run scheduler: queueing, dispatch, lifecycle operations.
pub mod scheduler;

pub use builder::RunSchedulerBuilder;
pub use runner::{RunWorker, StopToken};
pub use scheduler::RunScheduler;
