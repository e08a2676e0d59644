//! Cache of staged blocks awaiting commit.
//!
//! An application can push named blocks for a path one at a time and later
//! commit an ordered list of their ids as the new object content. Staged
//! data lives only in memory; nothing reaches the remote until the commit.

use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct StagedBlockCache {
    staged: RwLock<HashMap<String, HashMap<String, Bytes>>>,
}

impl StagedBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage one block. Re-staging an id replaces its previous bytes.
    pub async fn stage(&self, path: &str, block_id: &str, data: Bytes) {
        let mut staged = self.staged.write().await;
        staged
            .entry(path.to_string())
            .or_default()
            .insert(block_id.to_string(), data);
    }

    pub async fn staged_count(&self, path: &str) -> usize {
        self.staged
            .read()
            .await
            .get(path)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Remove and return everything staged for `path`. The commit path
    /// calls this up front so the cache is cleared whether or not the
    /// upload succeeds.
    pub async fn take(&self, path: &str) -> HashMap<String, Bytes> {
        self.staged.write().await.remove(path).unwrap_or_default()
    }

    pub async fn discard(&self, path: &str) {
        self.staged.write().await.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_take_clears() {
        let cache = StagedBlockCache::new();
        cache.stage("f", "id1", Bytes::from_static(b"aa")).await;
        cache.stage("f", "id2", Bytes::from_static(b"bb")).await;
        assert_eq!(cache.staged_count("f").await, 2);

        let taken = cache.take("f").await;
        assert_eq!(taken.len(), 2);
        assert_eq!(taken["id1"], Bytes::from_static(b"aa"));
        assert_eq!(cache.staged_count("f").await, 0);
        assert!(cache.take("f").await.is_empty());
    }

    #[tokio::test]
    async fn test_restage_replaces_bytes() {
        let cache = StagedBlockCache::new();
        cache.stage("f", "id1", Bytes::from_static(b"old")).await;
        cache.stage("f", "id1", Bytes::from_static(b"new")).await;
        let taken = cache.take("f").await;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken["id1"], Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_paths_are_independent() {
        let cache = StagedBlockCache::new();
        cache.stage("a", "id", Bytes::from_static(b"1")).await;
        cache.stage("b", "id", Bytes::from_static(b"2")).await;
        cache.discard("a").await;
        assert_eq!(cache.staged_count("a").await, 0);
        assert_eq!(cache.staged_count("b").await, 1);
    }
}
