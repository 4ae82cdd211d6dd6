// Cache Store
// Immutable cache keys pointing at manifests, with restore-key fallback

use crate::store::{write_atomic, Digest, StoreResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    digest: Digest,
    created_at: DateTime<Utc>,
    /// Monotonic save order; breaks ties between equal timestamps
    sequence: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: BTreeMap<String, CacheEntry>,
    next_sequence: u64,
}

/// A successful cache lookup
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// The key that matched (differs from the requested key on a prefix hit)
    pub key: String,
    pub digest: Digest,
    /// Whether the requested key itself matched
    pub exact: bool,
}

/// Cache index stored at `<root>/cache/index.json`
#[derive(Debug)]
pub struct CacheStore {
    index_path: PathBuf,
    index: RwLock<CacheIndex>,
}

impl CacheStore {
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let index_path = root.as_ref().join("cache").join("index.json");
        let index = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheIndex::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            index_path,
            index: RwLock::new(index),
        })
    }

    /// Record `key -> digest`.
    ///
    /// Returns `false` without touching the index when the key already
    /// exists: cache entries are never overwritten.
    pub async fn save(&self, key: &str, digest: &Digest) -> StoreResult<bool> {
        let mut index = self.index.write().await;
        if index.entries.contains_key(key) {
            debug!(key, "cache key already exists, not overwriting");
            return Ok(false);
        }

        let sequence = index.next_sequence;
        index.next_sequence += 1;
        index.entries.insert(
            key.to_string(),
            CacheEntry {
                digest: digest.clone(),
                created_at: Utc::now(),
                sequence,
            },
        );

        let bytes = serde_json::to_vec_pretty(&*index)?;
        if let Err(e) = write_atomic(&self.index_path, &bytes).await {
            index.entries.remove(key);
            return Err(e.into());
        }

        info!(key, %digest, "saved cache entry");
        Ok(true)
    }

    /// Look up `key`, then each restore key as a prefix in order.
    ///
    /// A prefix returns the most recently saved entry that starts with it.
    pub async fn restore(&self, key: &str, restore_keys: &[String]) -> Option<CacheHit> {
        let index = self.index.read().await;

        if let Some(entry) = index.entries.get(key) {
            return Some(CacheHit {
                key: key.to_string(),
                digest: entry.digest.clone(),
                exact: true,
            });
        }

        for prefix in restore_keys {
            let newest = index
                .entries
                .iter()
                .filter(|(k, _)| k.starts_with(prefix.as_str()))
                .max_by_key(|(_, entry)| (entry.created_at, entry.sequence));
            if let Some((matched, entry)) = newest {
                return Some(CacheHit {
                    key: matched.clone(),
                    digest: entry.digest.clone(),
                    exact: false,
                });
            }
        }

        None
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.index.read().await.entries.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(content: &str) -> Digest {
        Digest::of(content.as_bytes())
    }

    #[tokio::test]
    async fn test_exact_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).await.unwrap();
        assert!(cache.is_empty().await);

        assert!(cache.save("linux-cargo-abc", &digest("a")).await.unwrap());
        let hit = cache.restore("linux-cargo-abc", &[]).await.unwrap();
        assert!(hit.exact);
        assert_eq!(hit.digest, digest("a"));
    }

    #[tokio::test]
    async fn test_keys_are_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).await.unwrap();

        assert!(cache.save("key", &digest("first")).await.unwrap());
        assert!(!cache.save("key", &digest("second")).await.unwrap());

        let hit = cache.restore("key", &[]).await.unwrap();
        assert_eq!(hit.digest, digest("first"));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_restore_key_prefers_newest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).await.unwrap();

        cache.save("linux-cargo-111", &digest("old")).await.unwrap();
        cache.save("linux-cargo-222", &digest("new")).await.unwrap();
        cache.save("macos-cargo-333", &digest("mac")).await.unwrap();

        let hit = cache
            .restore(
                "linux-cargo-999",
                &["linux-cargo-".to_string(), "linux-".to_string()],
            )
            .await
            .unwrap();
        assert!(!hit.exact);
        assert_eq!(hit.key, "linux-cargo-222");
        assert_eq!(hit.digest, digest("new"));

        assert!(cache
            .restore("windows-cargo-1", &["windows-".to_string()])
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_index_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheStore::open(dir.path()).await.unwrap();
            cache.save("persisted", &digest("p")).await.unwrap();
        }
        assert!(dir.path().join("cache/index.json").exists());

        let reopened = CacheStore::open(dir.path()).await.unwrap();
        assert!(reopened.contains("persisted").await);
        // Sequence continues after reopen
        reopened.save("later", &digest("l")).await.unwrap();
        let hit = reopened.restore("x", &[String::new()]).await.unwrap();
        assert_eq!(hit.key, "later");
    }
}
