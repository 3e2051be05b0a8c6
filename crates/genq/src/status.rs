//! Task-query path.
//!
//! [`StatusResolver::query`] folds association, cache and queue state into a
//! single client-facing [`TaskStatus`]:
//!
//! | Queue state          | Status                                    |
//! |----------------------|-------------------------------------------|
//! | waiting / delayed    | `pending`                                 |
//! | active               | `processing` with progress                |
//! | completed (no cache) | `processing` at 100; resolves on next poll |
//! | failed               | `failed` with the last failure reason     |
//!
//! A cached result always wins over queue state. A record that disappears
//! between the cache read and the queue read is looked up in the cache once
//! more before the task is reported as not found.

use crate::association::TaskAssociations;
use crate::cache::ResultCache;
use crate::error::Result;
use crate::queue::{JobQueue, JobState};
use crate::types::{CachedResult, RequesterId, TaskKey};
use serde::Serialize;
use std::sync::Arc;

const UNKNOWN_FAILURE: &str = "generation failed";

/// Client-facing task status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    /// No association for this requester, or nothing left to report.
    NotFound,
    /// Queued and not yet leased by a worker.
    Pending,
    /// Leased by a worker (or acknowledged ahead of a visible cache write).
    Processing { progress: u8 },
    Completed { result: CachedResult },
    Failed { reason: String },
}

impl TaskStatus {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Pending => "pending",
            Self::Processing { .. } => "processing",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Clone)]
pub struct StatusResolver {
    queue: Arc<dyn JobQueue>,
    cache: ResultCache,
    associations: TaskAssociations,
}

impl StatusResolver {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        cache: ResultCache,
        associations: TaskAssociations,
    ) -> Self {
        Self {
            queue,
            cache,
            associations,
        }
    }

    /// Resolves the status of `key` as seen by `requester`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DependencyUnavailable`] if the store or broker fails.
    ///
    /// [`Error::DependencyUnavailable`]: crate::Error::DependencyUnavailable
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn query(&self, requester: &RequesterId, key: &TaskKey) -> Result<TaskStatus> {
        if self.associations.lookup(requester, key).await?.is_none() {
            return Ok(TaskStatus::NotFound);
        }

        if let Some(result) = self.cache.get(key).await? {
            return Ok(TaskStatus::Completed { result });
        }

        let Some(snapshot) = self.queue.get_state(key).await? else {
            // The worker caches before it acks, so a completion can land
            // between the two reads.
            return Ok(match self.cache.get(key).await? {
                Some(result) => TaskStatus::Completed { result },
                None => TaskStatus::NotFound,
            });
        };

        Ok(match snapshot.state {
            JobState::Waiting | JobState::Delayed => TaskStatus::Pending,
            JobState::Active => TaskStatus::Processing {
                progress: snapshot.progress,
            },
            JobState::Completed => TaskStatus::Processing { progress: 100 },
            JobState::Failed => TaskStatus::Failed {
                reason: snapshot
                    .failed_reason
                    .unwrap_or_else(|| UNKNOWN_FAILURE.to_string()),
            },
        })
    }
}
