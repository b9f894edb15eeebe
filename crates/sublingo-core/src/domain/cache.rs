//! URL source-cache index entry.

use serde::{Deserialize, Serialize};

/// One row in the content-addressed media cache index.
///
/// Uniqueness is `(normalized_url, content_sha256)`: the same URL may
/// legitimately point to different content over time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCacheEntry {
    /// Row id, 0 until persisted.
    pub id: i64,
    pub normalized_url: String,
    /// `sha256(normalized_url)`, a stable short key for logs and lookups.
    pub url_key: String,
    pub content_sha256: String,
    /// Canonical cache file path (`<cache_root>/<sha256>.<ext>`).
    pub local_path: String,
    pub size_bytes: u64,
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub hit_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips() {
        let entry = SourceCacheEntry {
            id: 7,
            normalized_url: "https://example.com/v.mp4".into(),
            url_key: "ab".repeat(32),
            content_sha256: "cd".repeat(32),
            local_path: "/cache/cdcd.mp4".into(),
            size_bytes: 1024,
            created_at: 1_700_000_000,
            last_accessed_at: 1_700_000_100,
            hit_count: 3,
        };
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: SourceCacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }
}
