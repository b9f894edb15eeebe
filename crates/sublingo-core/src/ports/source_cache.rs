//! URL source-cache index port.

use async_trait::async_trait;

use super::job_store::StoreError;
use crate::domain::SourceCacheEntry;

/// Index over the content-addressed media cache.
///
/// The cache manager owns pruning policy; this port only exposes the row
/// operations it needs. All methods are serialized behind the manager's
/// mutex, so implementations need no extra locking.
#[async_trait]
pub trait SourceCacheIndexPort: Send + Sync {
    /// Upsert on the `(normalized_url, content_sha256)` uniqueness pair.
    async fn upsert(&self, entry: &SourceCacheEntry) -> Result<(), StoreError>;

    /// Most recently accessed entry for a normalized URL, if any.
    async fn find_latest_by_url(
        &self,
        normalized_url: &str,
    ) -> Result<Option<SourceCacheEntry>, StoreError>;

    /// Record a cache hit: bump `hit_count`, refresh `last_accessed_at`.
    async fn touch(&self, id: i64, accessed_at: i64) -> Result<(), StoreError>;

    /// All entries ordered by `last_accessed_at` ascending (prune order).
    async fn list_by_access(&self) -> Result<Vec<SourceCacheEntry>, StoreError>;

    /// Remove one row by id.
    async fn delete(&self, id: i64) -> Result<(), StoreError>;
}
