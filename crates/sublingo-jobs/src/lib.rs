//! Job manager for sublingo.
//!
//! Queueing, scheduling under global and per-user caps, persistence,
//! cancellation, status read-models, partial-result salvage, and the
//! retention sweep. Pipeline work plugs in through [`JobExecutorPort`].

pub mod executor;
pub mod manager;
pub mod partial;
pub mod status;

pub use executor::{JobExecutionInput, JobExecutionOutput, JobExecutorPort, PipelineJobExecutor};
pub use manager::{CancelOutcome, CapacityCheck, CapacityLimit, JobManager};
pub use partial::{build_partial_from_sentences, build_partial_from_work_dir};
pub use status::{JobStatusView, TRANSLATE_CHUNKS_STAGE, map_stage_for_display};

// Silence unused dev-dependency warnings
#[cfg(test)]
use tokio_test as _;
