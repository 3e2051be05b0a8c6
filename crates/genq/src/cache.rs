//! Result cache: task key → [`CachedResult`], with TTL expiry.
//!
//! Entries are JSON documents under the `image_result:` prefix of the shared
//! [`KeyValueStore`]. Only workers write here; the dispatcher and status
//! resolver read. Expiry is the only removal path.

use crate::error::StoreError;
use crate::store::KeyValueStore;
use crate::types::{CachedResult, TaskKey};
use core::time::Duration;
use std::sync::Arc;

pub const RESULT_PREFIX: &str = "image_result:";

#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn entry_key(key: &TaskKey) -> String {
        format!("{RESULT_PREFIX}{key}")
    }

    pub async fn get(&self, key: &TaskKey) -> Result<Option<CachedResult>, StoreError> {
        let entry_key = Self::entry_key(key);
        match self.store.get(&entry_key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: entry_key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, key: &TaskKey) -> Result<bool, StoreError> {
        self.store.exists(&Self::entry_key(key)).await
    }

    /// Stores `result`, replacing any previous entry for its key.
    pub async fn set(&self, result: &CachedResult) -> Result<(), StoreError> {
        let (entry_key, raw) = Self::encode(result)?;
        self.store.set(&entry_key, raw, self.ttl).await
    }

    /// Stores `result` unless a live entry already exists. Returns whether
    /// this call wrote it.
    pub async fn set_if_absent(&self, result: &CachedResult) -> Result<bool, StoreError> {
        let (entry_key, raw) = Self::encode(result)?;
        self.store.set_if_absent(&entry_key, raw, self.ttl).await
    }

    fn encode(result: &CachedResult) -> Result<(String, String), StoreError> {
        let entry_key = Self::entry_key(&result.task_key);
        let raw = serde_json::to_string(result).map_err(|e| StoreError::Corrupt {
            key: entry_key.clone(),
            reason: e.to_string(),
        })?;
        Ok((entry_key, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::store::MemoryStore;
    use crate::types::{GenerationRequest, ParamDefaults, RequesterId};
    use chrono::Utc;

    fn result(urls: &[&str]) -> CachedResult {
        let params = GenerationRequest::with_prompt("a red cat")
            .normalize(&ParamDefaults::default())
            .unwrap();
        CachedResult {
            task_key: fingerprint(&RequesterId::new("u1"), &params),
            urls: urls.iter().map(|u| u.to_string()).collect(),
            params,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn roundtrip_and_expiry() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResultCache::new(store.clone(), Duration::from_secs(3600));
        let entry = result(&["https://img/1.png", "https://img/2.png"]);

        assert_eq!(cache.get(&entry.task_key).await.unwrap(), None);
        cache.set(&entry).await.unwrap();
        assert_eq!(cache.get(&entry.task_key).await.unwrap(), Some(entry.clone()));
        assert!(
            store
                .exists(&format!("image_result:{}", entry.task_key))
                .await
                .unwrap()
        );

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!cache.exists(&entry.task_key).await.unwrap());
    }

    #[tokio::test]
    async fn first_writer_wins_with_set_if_absent() {
        let cache = ResultCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let first = result(&["https://img/first.png"]);
        let second = result(&["https://img/second.png"]);

        assert!(cache.set_if_absent(&first).await.unwrap());
        assert!(!cache.set_if_absent(&second).await.unwrap());
        let stored = cache.get(&first.task_key).await.unwrap().unwrap();
        assert_eq!(stored.urls, first.urls);
    }

    #[tokio::test]
    async fn corrupt_entries_are_reported() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResultCache::new(store.clone(), Duration::from_secs(60));
        let entry = result(&["https://img/1.png"]);
        store
            .set(
                &format!("image_result:{}", entry.task_key),
                "not json".into(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let err = cache.get(&entry.task_key).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
