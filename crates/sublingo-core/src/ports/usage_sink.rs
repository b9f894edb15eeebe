//! Metered usage sink port.
//!
//! Append-only records emitted per job completion (and per LLM probe).
//! The sink format is the collaborator's concern; failures must never fail
//! the job, so the port is infallible and implementations swallow errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One metered usage record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Billing scene, e.g. `subtitle_pipeline`, `subtitle_asr`,
    /// `subtitle_translation`.
    pub scene: String,
    /// Job id or user id the spend is attributed to.
    pub owner_id: String,
    pub provider_effective: String,
    pub model_effective: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub provider_request_id: String,
    pub timestamp_ms: i64,
}

/// Append-only usage sink.
#[async_trait]
pub trait UsageSinkPort: Send + Sync {
    async fn append(&self, record: &UsageRecord);
}

/// Sink that drops every record. Default wiring for tests and deployments
/// without metering.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSinkPort for NoopUsageSink {
    async fn append(&self, record: &UsageRecord) {
        tracing::trace!(
            target: "sublingo.usage",
            scene = %record.scene,
            owner_id = %record.owner_id,
            total_tokens = record.total_tokens,
            "usage record dropped (noop sink)"
        );
    }
}
