//! `SQLite` implementation of the `JobStorePort` trait.

use async_trait::async_trait;
use sqlx::SqlitePool;

use sublingo_core::{JobStorePort, StoreError, StoredJobRow};

/// `SQLite` implementation of the `JobStorePort` trait.
///
/// Persists one JSON blob per job for durability across restarts. The
/// payload is authoritative; `user_id`/timestamps are duplicated into
/// columns only to serve the `(user_id, updated_at)` index.
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    /// Create a new `SQLite` job repository.
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStorePort for SqliteJobRepository {
    async fn upsert(&self, row: &StoredJobRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, user_id, payload_json, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                user_id = excluded.user_id,
                payload_json = excluded.payload_json,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(&row.job_id)
        .bind(&row.user_id)
        .bind(&row.payload_json)
        .bind(row.created_at_ms)
        .bind(row.updated_at_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::storage(e.to_string()))?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<StoredJobRow>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String, i64, i64)>(
            r#"
            SELECT job_id, user_id, payload_json, created_at_ms, updated_at_ms
            FROM jobs
            ORDER BY user_id ASC, updated_at_ms DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(
                |(job_id, user_id, payload_json, created_at_ms, updated_at_ms)| StoredJobRow {
                    job_id,
                    user_id,
                    payload_json,
                    created_at_ms,
                    updated_at_ms,
                },
            )
            .collect())
    }

    async fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::storage(e.to_string()))?;

        Ok(())
    }
}
