//! `SQLite` implementation of the `SourceCacheIndexPort` trait.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use sublingo_core::{SourceCacheEntry, SourceCacheIndexPort, StoreError};

/// `SQLite` index over the content-addressed media cache.
pub struct SqliteSourceCacheRepository {
    pool: SqlitePool,
}

impl SqliteSourceCacheRepository {
    /// Create a new `SQLite` source-cache repository.
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceCacheIndexPort for SqliteSourceCacheRepository {
    async fn upsert(&self, entry: &SourceCacheEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO url_source_cache(
                normalized_url, url_key, content_sha256, local_path, size_bytes,
                created_at, last_accessed_at, hit_count
            ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(normalized_url, content_sha256) DO UPDATE SET
                local_path = excluded.local_path,
                size_bytes = excluded.size_bytes,
                last_accessed_at = excluded.last_accessed_at
            "#,
        )
        .bind(&entry.normalized_url)
        .bind(&entry.url_key)
        .bind(&entry.content_sha256)
        .bind(&entry.local_path)
        .bind(i64::try_from(entry.size_bytes).unwrap_or(i64::MAX))
        .bind(entry.created_at)
        .bind(entry.last_accessed_at)
        .bind(i64::try_from(entry.hit_count).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::storage(e.to_string()))?;

        Ok(())
    }

    async fn find_latest_by_url(
        &self,
        normalized_url: &str,
    ) -> Result<Option<SourceCacheEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, normalized_url, url_key, content_sha256, local_path,
                   size_bytes, created_at, last_accessed_at, hit_count
            FROM url_source_cache
            WHERE normalized_url = ?
            ORDER BY last_accessed_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(normalized_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::storage(e.to_string()))?;

        row.map(|r| row_to_entry(&r)).transpose()
    }

    async fn touch(&self, id: i64, accessed_at: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE url_source_cache SET last_accessed_at = ?, hit_count = hit_count + 1 WHERE id = ?",
        )
        .bind(accessed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("cache entry id {id}")));
        }

        Ok(())
    }

    async fn list_by_access(&self) -> Result<Vec<SourceCacheEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, normalized_url, url_key, content_sha256, local_path,
                   size_bytes, created_at, last_accessed_at, hit_count
            FROM url_source_cache
            ORDER BY last_accessed_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::storage(e.to_string()))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM url_source_cache WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::storage(e.to_string()))?;

        Ok(())
    }
}

/// Convert a database row to a `SourceCacheEntry`.
fn row_to_entry(row: &SqliteRow) -> Result<SourceCacheEntry, StoreError> {
    let id: i64 = row.try_get("id").map_err(map_column_error)?;
    let normalized_url: String = row.try_get("normalized_url").map_err(map_column_error)?;
    let url_key: String = row.try_get("url_key").map_err(map_column_error)?;
    let content_sha256: String = row.try_get("content_sha256").map_err(map_column_error)?;
    let local_path: String = row.try_get("local_path").map_err(map_column_error)?;
    let size_bytes: i64 = row.try_get("size_bytes").map_err(map_column_error)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_column_error)?;
    let last_accessed_at: i64 = row.try_get("last_accessed_at").map_err(map_column_error)?;
    let hit_count: i64 = row.try_get("hit_count").map_err(map_column_error)?;

    Ok(SourceCacheEntry {
        id,
        normalized_url,
        url_key,
        content_sha256,
        local_path,
        size_bytes: u64::try_from(size_bytes).unwrap_or(0),
        created_at,
        last_accessed_at,
        hit_count: u64::try_from(hit_count).unwrap_or(0),
    })
}

fn map_column_error(e: sqlx::Error) -> StoreError {
    StoreError::storage(format!("Column read error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::setup_test_database;

    fn entry(url: &str, sha: &str, accessed_at: i64) -> SourceCacheEntry {
        SourceCacheEntry {
            id: 0,
            normalized_url: url.to_string(),
            url_key: format!("key-{url}"),
            content_sha256: sha.to_string(),
            local_path: format!("/cache/{sha}.mp4"),
            size_bytes: 2_048,
            created_at: accessed_at,
            last_accessed_at: accessed_at,
            hit_count: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let pool = setup_test_database().await.unwrap();
        let repo = SqliteSourceCacheRepository::new(pool);

        repo.upsert(&entry("https://example.com/a", "aa", 100))
            .await
            .unwrap();

        let found = repo
            .find_latest_by_url("https://example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.content_sha256, "aa");
        assert!(found.id > 0);

        assert!(
            repo.find_latest_by_url("https://example.com/missing")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_same_url_different_content_coexists() {
        let pool = setup_test_database().await.unwrap();
        let repo = SqliteSourceCacheRepository::new(pool);

        repo.upsert(&entry("https://example.com/a", "aa", 100))
            .await
            .unwrap();
        repo.upsert(&entry("https://example.com/a", "bb", 200))
            .await
            .unwrap();

        let rows = repo.list_by_access().await.unwrap();
        assert_eq!(rows.len(), 2);

        // Latest-accessed row wins the lookup
        let found = repo
            .find_latest_by_url("https://example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.content_sha256, "bb");
    }

    #[tokio::test]
    async fn test_upsert_same_pair_updates_in_place() {
        let pool = setup_test_database().await.unwrap();
        let repo = SqliteSourceCacheRepository::new(pool);

        repo.upsert(&entry("https://example.com/a", "aa", 100))
            .await
            .unwrap();
        let mut refreshed = entry("https://example.com/a", "aa", 900);
        refreshed.size_bytes = 4_096;
        repo.upsert(&refreshed).await.unwrap();

        let rows = repo.list_by_access().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].size_bytes, 4_096);
        assert_eq!(rows[0].last_accessed_at, 900);
    }

    #[tokio::test]
    async fn test_touch_bumps_hit_count() {
        let pool = setup_test_database().await.unwrap();
        let repo = SqliteSourceCacheRepository::new(pool);

        repo.upsert(&entry("https://example.com/a", "aa", 100))
            .await
            .unwrap();
        let found = repo
            .find_latest_by_url("https://example.com/a")
            .await
            .unwrap()
            .unwrap();

        repo.touch(found.id, 500).await.unwrap();
        repo.touch(found.id, 600).await.unwrap();

        let after = repo
            .find_latest_by_url("https://example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.hit_count, 2);
        assert_eq!(after.last_accessed_at, 600);

        let missing = repo.touch(9_999, 700).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_orders_by_access_time() {
        let pool = setup_test_database().await.unwrap();
        let repo = SqliteSourceCacheRepository::new(pool);

        repo.upsert(&entry("https://example.com/new", "bb", 300))
            .await
            .unwrap();
        repo.upsert(&entry("https://example.com/old", "aa", 100))
            .await
            .unwrap();

        let rows = repo.list_by_access().await.unwrap();
        assert_eq!(rows[0].content_sha256, "aa");
        assert_eq!(rows[1].content_sha256, "bb");
    }

    #[tokio::test]
    async fn test_delete() {
        let pool = setup_test_database().await.unwrap();
        let repo = SqliteSourceCacheRepository::new(pool);

        repo.upsert(&entry("https://example.com/a", "aa", 100))
            .await
            .unwrap();
        let found = repo
            .find_latest_by_url("https://example.com/a")
            .await
            .unwrap()
            .unwrap();

        repo.delete(found.id).await.unwrap();
        assert!(repo.list_by_access().await.unwrap().is_empty());
    }
}
