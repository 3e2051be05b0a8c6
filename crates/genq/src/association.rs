//! User-task association index.
//!
//! Status queries are authorized by association, not by queue membership: a
//! requester may only see tasks it submitted. Associations live under the
//! `user_task:` prefix with the same TTL as cached results.

use crate::error::StoreError;
use crate::store::KeyValueStore;
use crate::types::{RequesterId, TaskKey};
use chrono::{DateTime, Utc};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const ASSOCIATION_PREFIX: &str = "user_task:";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssociation {
    pub task_key: TaskKey,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TaskAssociations {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl TaskAssociations {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    // Task keys are fixed-length hex, so a `:` inside the requester id
    // cannot make two entries collide.
    fn entry_key(requester: &RequesterId, key: &TaskKey) -> String {
        format!("{ASSOCIATION_PREFIX}{requester}:{key}")
    }

    /// Records (or refreshes) that `requester` owns `key`.
    pub async fn record(&self, requester: &RequesterId, key: &TaskKey) -> Result<(), StoreError> {
        let entry_key = Self::entry_key(requester, key);
        let association = TaskAssociation {
            task_key: key.clone(),
            created_at: Utc::now(),
        };
        let raw = serde_json::to_string(&association).map_err(|e| StoreError::Corrupt {
            key: entry_key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&entry_key, raw, self.ttl).await
    }

    pub async fn lookup(
        &self,
        requester: &RequesterId,
        key: &TaskKey,
    ) -> Result<Option<TaskAssociation>, StoreError> {
        let entry_key = Self::entry_key(requester, key);
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
}
