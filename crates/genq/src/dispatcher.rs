//! Task-creation path.
//!
//! [`Dispatcher::submit`] resolves every submission to one of three outcomes
//! without blocking on generation: a cached result, an already-queued task, or
//! a freshly enqueued one. The checks are ordered cache first, then queue, so a
//! completed fingerprint never reaches the broker again while its result is
//! live.

use crate::association::TaskAssociations;
use crate::cache::ResultCache;
use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::queue::{EnqueueOutcome, JobOptions, JobQueue};
use crate::types::{GenerationRequest, ParamDefaults, RequesterId, TaskKey};
use std::sync::Arc;

/// Outcome of a submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub task_key: TaskKey,
    /// A result for this key was already cached.
    pub cached: bool,
    /// A live task record for this key already existed.
    pub already_queued: bool,
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    cache: ResultCache,
    associations: TaskAssociations,
    defaults: ParamDefaults,
    job_options: JobOptions,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        cache: ResultCache,
        associations: TaskAssociations,
        defaults: ParamDefaults,
        job_options: JobOptions,
    ) -> Self {
        Self {
            queue,
            cache,
            associations,
            defaults,
            job_options,
        }
    }

    /// Submits a generation request on behalf of `requester`.
    ///
    /// Every successful outcome records (or refreshes) the requester's
    /// association with the task key, so the requester can poll it.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the request fails normalization; nothing
    ///   is read from or written to the cache or queue in that case.
    /// - [`Error::DependencyUnavailable`] if the store or broker fails.
    ///
    /// [`Error::Validation`]: crate::Error::Validation
    /// [`Error::DependencyUnavailable`]: crate::Error::DependencyUnavailable
    #[tracing::instrument(level = "debug", skip(self, request), fields(task_key))]
    pub async fn submit(
        &self,
        requester: &RequesterId,
        request: GenerationRequest,
    ) -> Result<Submission> {
        let params = request.normalize(&self.defaults)?;
        let task_key = fingerprint(requester, &params);
        tracing::Span::current().record("task_key", tracing::field::display(&task_key));

        if self.cache.exists(&task_key).await? {
            self.associations.record(requester, &task_key).await?;
            tracing::debug!("served from cache");
            return Ok(Submission {
                task_key,
                cached: true,
                already_queued: false,
            });
        }

        if let Some(snapshot) = self.queue.get_state(&task_key).await? {
            if snapshot.state.is_live() {
                self.associations.record(requester, &task_key).await?;
                tracing::debug!(state = ?snapshot.state, "task already queued");
                return Ok(Submission {
                    task_key,
                    cached: false,
                    already_queued: true,
                });
            }
        }

        // The broker re-checks liveness atomically; losing that race to a
        // concurrent submission is reported the same as the lookup above.
        let outcome = self
            .queue
            .enqueue(&task_key, params, self.job_options)
            .await?;
        self.associations.record(requester, &task_key).await?;

        let already_queued = matches!(outcome, EnqueueOutcome::Duplicate(_));
        if already_queued {
            tracing::debug!("task enqueued concurrently");
        } else {
            tracing::info!(task_key = %task_key, "task enqueued");
        }
        Ok(Submission {
            task_key,
            cached: false,
            already_queued,
        })
    }
}
