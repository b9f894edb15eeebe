//! Durable job-store port.
//!
//! One JSON blob per job. The payload is self-describing, so no schema
//! versioning happens at this layer; implementations may choose any store
//! with row-level transactions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage-layer error, string-captured so it stays serializable.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend failure (connection, SQL, serialization).
    #[error("storage error: {0}")]
    Storage(String),

    /// Row not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

/// A persisted job row: identity columns plus the opaque payload blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredJobRow {
    pub job_id: String,
    pub user_id: String,
    pub payload_json: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Durable KV-style storage for job records.
///
/// Writes are idempotent upserts keyed by `job_id`. `load_all` is only hit
/// at startup; the in-memory registry is authoritative afterwards.
#[async_trait]
pub trait JobStorePort: Send + Sync {
    /// Insert or replace the row for `row.job_id`.
    async fn upsert(&self, row: &StoredJobRow) -> Result<(), StoreError>;

    /// Load every persisted row, newest first per user.
    async fn load_all(&self) -> Result<Vec<StoredJobRow>, StoreError>;

    /// Delete the row for `job_id`. Deleting a missing row is not an error.
    async fn delete(&self, job_id: &str) -> Result<(), StoreError>;
}
