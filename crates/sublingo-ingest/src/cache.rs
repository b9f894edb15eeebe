//! Content-addressed media cache.
//!
//! Downloaded files are stored under `<cache_root>/<sha256>.<ext>` and
//! indexed by normalized URL through the `SourceCacheIndexPort`. A single
//! mutex serializes index mutations; cached files are handed to job work
//! dirs via hardlink, falling back to a copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use sublingo_core::{
    ErrorCode, PipelineError, SourceCacheEntry, SourceCacheIndexPort, StageResult, now_ms, stage,
};

/// Cache policy knobs.
#[derive(Clone, Debug)]
pub struct SourceCachePolicy {
    pub root: PathBuf,
    pub ttl_seconds: i64,
    pub max_bytes: u64,
}

/// The cache manager.
pub struct SourceCache {
    policy: SourceCachePolicy,
    index: Arc<dyn SourceCacheIndexPort>,
    // Serializes lookup/store/prune against the index
    lock: Mutex<()>,
}

impl SourceCache {
    pub fn new(policy: SourceCachePolicy, index: Arc<dyn SourceCacheIndexPort>) -> Self {
        Self {
            policy,
            index,
            lock: Mutex::new(()),
        }
    }

    /// Look up a normalized URL. On hit the entry is touched and the file
    /// verified on disk; rows with vanished files are dropped.
    pub async fn lookup(&self, normalized_url: &str) -> StageResult<Option<PathBuf>> {
        let _guard = self.lock.lock().await;
        self.prune_locked().await?;

        let Some(entry) = self
            .index
            .find_latest_by_url(normalized_url)
            .await
            .map_err(storage_error)?
        else {
            return Ok(None);
        };

        let cached_path = PathBuf::from(&entry.local_path);
        if !cached_path.is_file() {
            self.index.delete(entry.id).await.map_err(storage_error)?;
            return Ok(None);
        }

        self.index
            .touch(entry.id, now_seconds())
            .await
            .map_err(storage_error)?;
        tracing::debug!(
            target: "sublingo.ingest",
            url = %normalized_url,
            file = %cached_path.display(),
            hits = entry.hit_count + 1,
            "url source cache hit"
        );
        Ok(Some(cached_path))
    }

    /// Store a downloaded file under its content hash and upsert the index
    /// row for `(normalized_url, content_sha256)`.
    pub async fn store(&self, normalized_url: &str, downloaded_path: &Path) -> StageResult<()> {
        if !downloaded_path.is_file() {
            return Ok(());
        }

        let content_sha = sha256_file(downloaded_path).await?;
        let suffix = downloaded_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_else(|| "mp4".to_string());
        let cached_path = self.policy.root.join(format!("{content_sha}.{suffix}"));

        let _guard = self.lock.lock().await;
        if !cached_path.is_file() {
            tokio::fs::create_dir_all(&self.policy.root)
                .await
                .map_err(|e| io_error("could not create cache root", &e))?;
            // Atomic publish: copy to a temp name, then rename into place
            let tmp_path = self
                .policy
                .root
                .join(format!("{content_sha}.{suffix}.tmp{}", now_ms()));
            tokio::fs::copy(downloaded_path, &tmp_path)
                .await
                .map_err(|e| io_error("could not copy media into cache", &e))?;
            if tokio::fs::rename(&tmp_path, &cached_path).await.is_err() {
                let _ = tokio::fs::remove_file(&tmp_path).await;
            }
        }

        let size_bytes = tokio::fs::metadata(&cached_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        let now = now_seconds();
        let entry = SourceCacheEntry {
            id: 0,
            normalized_url: normalized_url.to_string(),
            url_key: sha256_hex(normalized_url.as_bytes()),
            content_sha256: content_sha,
            local_path: cached_path.display().to_string(),
            size_bytes,
            created_at: now,
            last_accessed_at: now,
            hit_count: 0,
        };
        self.index.upsert(&entry).await.map_err(storage_error)?;
        self.prune_locked().await?;

        tracing::debug!(
            target: "sublingo.ingest",
            url = %normalized_url,
            file = %entry.local_path,
            size_bytes,
            "url source cached"
        );
        Ok(())
    }

    /// TTL pass first (vanished files, stale access times), then the size
    /// pass dropping oldest-accessed entries until under the cap.
    async fn prune_locked(&self) -> StageResult<()> {
        let now = now_seconds();
        let expire_before = now - self.policy.ttl_seconds;
        let rows = self.index.list_by_access().await.map_err(storage_error)?;

        let mut alive: Vec<SourceCacheEntry> = Vec::with_capacity(rows.len());
        let mut total_size: u64 = 0;
        for row in rows {
            let path = PathBuf::from(&row.local_path);
            if !path.is_file() || row.last_accessed_at <= 0 || row.last_accessed_at < expire_before
            {
                self.delete_row(&row, &path).await?;
                continue;
            }
            let size = if row.size_bytes > 0 {
                row.size_bytes
            } else {
                tokio::fs::metadata(&path)
                    .await
                    .map(|meta| meta.len())
                    .unwrap_or(0)
            };
            total_size += size;
            alive.push(SourceCacheEntry {
                size_bytes: size,
                ..row
            });
        }

        if total_size <= self.policy.max_bytes {
            return Ok(());
        }
        for row in alive {
            if total_size <= self.policy.max_bytes {
                break;
            }
            let path = PathBuf::from(&row.local_path);
            self.delete_row(&row, &path).await?;
            total_size = total_size.saturating_sub(row.size_bytes);
        }
        Ok(())
    }

    async fn delete_row(&self, row: &SourceCacheEntry, path: &Path) -> StageResult<()> {
        if path.is_file() {
            let _ = tokio::fs::remove_file(path).await;
        }
        self.index.delete(row.id).await.map_err(storage_error)?;
        tracing::debug!(
            target: "sublingo.ingest",
            url = %row.normalized_url,
            file = %row.local_path,
            "url source cache entry evicted"
        );
        Ok(())
    }
}

/// Materialize a cached file into a job's directory via hardlink, falling
/// back to a copy across filesystems.
pub async fn materialize_cached_file(
    cached_path: &Path,
    output_root: &Path,
) -> StageResult<PathBuf> {
    tokio::fs::create_dir_all(output_root)
        .await
        .map_err(|e| io_error("could not create output directory", &e))?;

    let suffix = cached_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_else(|| "mp4".to_string());
    let target = output_root.join(format!("source_cache_{}.{suffix}", now_ms()));

    if std::fs::hard_link(cached_path, &target).is_err() {
        tokio::fs::copy(cached_path, &target)
            .await
            .map_err(|e| io_error("could not materialize cached media", &e))?;
    }
    Ok(target)
}

/// Streaming SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> StageResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error("could not open file for hashing", &e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| io_error("could not read file for hashing", &e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn now_seconds() -> i64 {
    now_ms() / 1_000
}

fn storage_error(error: sublingo_core::StoreError) -> PipelineError {
    PipelineError::new(
        stage::DOWNLOAD_SOURCE,
        ErrorCode::StorageFailed,
        "source cache index operation failed",
    )
    .with_detail(error.to_string())
}

fn io_error(message: &str, error: &std::io::Error) -> PipelineError {
    PipelineError::new(stage::DOWNLOAD_SOURCE, ErrorCode::DownloadFailed, message)
        .with_detail(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use sublingo_core::StoreError;

    /// In-memory index fake with the same uniqueness semantics as the
    /// SQLite adapter.
    #[derive(Default)]
    struct MemoryIndex {
        rows: StdMutex<Vec<SourceCacheEntry>>,
        next_id: StdMutex<i64>,
    }

    #[async_trait]
    impl SourceCacheIndexPort for MemoryIndex {
        async fn upsert(&self, entry: &SourceCacheEntry) -> Result<(), StoreError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(existing) = rows.iter_mut().find(|row| {
                row.normalized_url == entry.normalized_url
                    && row.content_sha256 == entry.content_sha256
            }) {
                existing.local_path = entry.local_path.clone();
                existing.size_bytes = entry.size_bytes;
                existing.last_accessed_at = entry.last_accessed_at;
                return Ok(());
            }
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            rows.push(SourceCacheEntry {
                id: *next_id,
                ..entry.clone()
            });
            Ok(())
        }

        async fn find_latest_by_url(
            &self,
            normalized_url: &str,
        ) -> Result<Option<SourceCacheEntry>, StoreError> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|row| row.normalized_url == normalized_url)
                .max_by_key(|row| (row.last_accessed_at, row.id))
                .cloned())
        }

        async fn touch(&self, id: i64, accessed_at: i64) -> Result<(), StoreError> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .iter_mut()
                .find(|row| row.id == id)
                .ok_or_else(|| StoreError::not_found(format!("id {id}")))?;
            row.hit_count += 1;
            row.last_accessed_at = accessed_at;
            Ok(())
        }

        async fn list_by_access(&self) -> Result<Vec<SourceCacheEntry>, StoreError> {
            let mut rows = self.rows.lock().unwrap().clone();
            rows.sort_by_key(|row| (row.last_accessed_at, row.id));
            Ok(rows)
        }

        async fn delete(&self, id: i64) -> Result<(), StoreError> {
            self.rows.lock().unwrap().retain(|row| row.id != id);
            Ok(())
        }
    }

    fn cache_with(
        root: &Path,
        ttl_seconds: i64,
        max_bytes: u64,
    ) -> (SourceCache, Arc<MemoryIndex>) {
        let index = Arc::new(MemoryIndex::default());
        let cache = SourceCache::new(
            SourceCachePolicy {
                root: root.to_path_buf(),
                ttl_seconds,
                max_bytes,
            },
            Arc::clone(&index) as Arc<dyn SourceCacheIndexPort>,
        );
        (cache, index)
    }

    #[tokio::test]
    async fn store_then_lookup_returns_same_content() {
        let tmp = tempfile::tempdir().unwrap();
        let download = tmp.path().join("download.mp4");
        tokio::fs::write(&download, b"media-bytes").await.unwrap();

        let (cache, _) = cache_with(&tmp.path().join("cache"), 3600, 1 << 30);
        cache
            .store("https://example.com/v", &download)
            .await
            .unwrap();

        let hit = cache
            .lookup("https://example.com/v")
            .await
            .unwrap()
            .expect("cache hit");
        let cached_bytes = tokio::fs::read(&hit).await.unwrap();
        assert_eq!(cached_bytes, b"media-bytes");
        assert_eq!(
            hit.file_name().unwrap().to_str().unwrap(),
            format!("{}.mp4", sha256_hex(b"media-bytes"))
        );

        assert!(
            cache
                .lookup("https://example.com/other")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn lookup_drops_rows_with_vanished_files() {
        let tmp = tempfile::tempdir().unwrap();
        let download = tmp.path().join("download.mp4");
        tokio::fs::write(&download, b"gone-soon").await.unwrap();

        let (cache, index) = cache_with(&tmp.path().join("cache"), 3600, 1 << 30);
        cache
            .store("https://example.com/v", &download)
            .await
            .unwrap();

        let cached = cache.lookup("https://example.com/v").await.unwrap().unwrap();
        tokio::fs::remove_file(&cached).await.unwrap();

        assert!(cache.lookup("https://example.com/v").await.unwrap().is_none());
        assert!(index.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn size_cap_evicts_oldest_accessed_first() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, index) = cache_with(&tmp.path().join("cache"), 3600, 10);

        let old = tmp.path().join("old.mp4");
        tokio::fs::write(&old, b"12345678").await.unwrap();
        cache.store("https://example.com/old", &old).await.unwrap();

        // Backdate the first entry so it is the LRU victim
        {
            let mut rows = index.rows.lock().unwrap();
            rows[0].last_accessed_at -= 100;
        }

        let fresh = tmp.path().join("new.mp4");
        tokio::fs::write(&fresh, b"87654321").await.unwrap();
        cache.store("https://example.com/new", &fresh).await.unwrap();

        assert!(cache.lookup("https://example.com/old").await.unwrap().is_none());
        assert!(cache.lookup("https://example.com/new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ttl_expires_stale_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, index) = cache_with(&tmp.path().join("cache"), 50, 1 << 30);

        let download = tmp.path().join("v.mp4");
        tokio::fs::write(&download, b"abc").await.unwrap();
        cache.store("https://example.com/v", &download).await.unwrap();

        {
            let mut rows = index.rows.lock().unwrap();
            rows[0].last_accessed_at -= 1_000;
        }

        assert!(cache.lookup("https://example.com/v").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_url_new_content_gets_its_own_row() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, index) = cache_with(&tmp.path().join("cache"), 3600, 1 << 30);

        let first = tmp.path().join("a.mp4");
        tokio::fs::write(&first, b"version-one").await.unwrap();
        cache.store("https://example.com/v", &first).await.unwrap();

        let second = tmp.path().join("b.mp4");
        tokio::fs::write(&second, b"version-two").await.unwrap();
        cache.store("https://example.com/v", &second).await.unwrap();

        assert_eq!(index.rows.lock().unwrap().len(), 2);
        // Latest-accessed content wins the lookup
        let hit = cache.lookup("https://example.com/v").await.unwrap().unwrap();
        let bytes = tokio::fs::read(&hit).await.unwrap();
        assert_eq!(bytes, b"version-two");
    }

    #[tokio::test]
    async fn materialize_links_into_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let cached = tmp.path().join("deadbeef.mp4");
        tokio::fs::write(&cached, b"cached-media").await.unwrap();

        let work_input = tmp.path().join("job/input");
        let target = materialize_cached_file(&cached, &work_input).await.unwrap();
        assert!(target.starts_with(&work_input));
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"cached-media");
    }

    #[tokio::test]
    async fn sha256_matches_known_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("data.bin");
        tokio::fs::write(&file, b"hello").await.unwrap();
        assert_eq!(
            sha256_file(&file).await.unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
