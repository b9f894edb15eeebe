//! Port definitions (hexagonal seams).
//!
//! Adapters implement these; the core and the orchestration crates only
//! ever see the traits.

pub mod job_store;
pub mod local_asr;
pub mod source_cache;
pub mod usage_sink;

pub use job_store::{JobStorePort, StoreError, StoredJobRow};
pub use local_asr::{AsrSegment, AsrWord, LocalAsrBackend, LocalAsrRequest};
pub use source_cache::SourceCacheIndexPort;
pub use usage_sink::{NoopUsageSink, UsageRecord, UsageSinkPort};
