//! Task-processing path.
//!
//! A [`WorkerPool`] runs a fixed number of worker tasks against one
//! [`JobQueue`]. Each worker leases a task, invokes the generator, writes the
//! result to the cache and then acknowledges the lease, in that order.
//! Failures are reported back to the broker, which decides between retry with
//! backoff and terminal failure.
//!
//! Two limits apply to the pool as a whole: `concurrency` bounds simultaneous
//! leases (one per worker), and a shared [`RateWindow`] bounds lease starts per
//! rolling window.
//!
//! ## Structure
//!
//! - [`manager`] - Spawning and graceful shutdown ([`WorkerPool`]).
//! - [`worker`] - Per-worker loop and the per-task protocol.
//! - [`limiter`] - Rolling-window lease-start limiter.
//!
//! [`JobQueue`]: crate::queue::JobQueue

mod limiter;
mod manager;
mod worker;

pub use limiter::RateWindow;
pub use manager::WorkerPool;
pub use worker::JobOutcome;

use core::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of workers, and so the cap on simultaneous leases.
    pub concurrency: usize,
    /// Lease starts allowed per `rate_window`.
    pub rate_max: usize,
    pub rate_window: Duration,
    /// Deadline for one generator invocation.
    pub generator_timeout: Duration,
    /// Idle workers re-poll the broker at this interval.
    pub poll_interval: Duration,
    /// How long [`WorkerPool::shutdown`] waits for in-flight tasks.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_max: 10,
            rate_window: Duration::from_secs(60),
            generator_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::TaskAssociations;
    use crate::cache::ResultCache;
    use crate::dispatcher::Dispatcher;
    use crate::error::GeneratorError;
    use crate::queue::{Backoff, JobOptions, MemoryQueue};
    use crate::status::{StatusResolver, TaskStatus};
    use crate::store::MemoryStore;
    use crate::testing::ScriptedGenerator;
    use crate::types::{GenerationRequest, ParamDefaults, RequesterId, TaskKey};
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(3600);

    struct Service {
        dispatcher: Dispatcher,
        resolver: StatusResolver,
        pool: WorkerPool,
    }

    fn service(generator: Arc<ScriptedGenerator>, config: PoolConfig) -> Service {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let cache = ResultCache::new(store.clone(), TTL);
        let associations = TaskAssociations::new(store, TTL);
        let options = JobOptions {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(5)),
            remove_on_complete: true,
        };
        Service {
            dispatcher: Dispatcher::new(
                queue.clone(),
                cache.clone(),
                associations.clone(),
                ParamDefaults::default(),
                options,
            ),
            resolver: StatusResolver::new(queue.clone(), cache.clone(), associations),
            pool: WorkerPool::spawn(queue, cache, generator, config),
        }
    }

    async fn wait_for_terminal(s: &Service, requester: &RequesterId, key: &TaskKey) -> TaskStatus {
        for _ in 0..1_000 {
            let status = s.resolver.query(requester, key).await.unwrap();
            if matches!(status, TaskStatus::Completed { .. } | TaskStatus::Failed { .. }) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("task {key} never reached a terminal status");
    }

    #[tokio::test(start_paused = true)]
    async fn completes_task_and_serves_result() {
        let generator = Arc::new(ScriptedGenerator::succeeding(&[
            "https://img/1.png",
            "https://img/2.png",
        ]));
        let s = service(generator.clone(), PoolConfig::default());
        let u1 = RequesterId::new("u1");

        let submission = s
            .dispatcher
            .submit(&u1, GenerationRequest::with_prompt("a red cat"))
            .await
            .unwrap();
        match wait_for_terminal(&s, &u1, &submission.task_key).await {
            TaskStatus::Completed { result } => {
                assert_eq!(result.urls, ["https://img/1.png", "https://img/2.png"]);
            }
            other => panic!("unexpected status {other:?}"),
        }

        // Later submissions are served from the cache.
        let again = s
            .dispatcher
            .submit(&u1, GenerationRequest::with_prompt("a red cat"))
            .await
            .unwrap();
        assert!(again.cached);
        assert_eq!(generator.calls(), 1);
        s.pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_up_to_the_cap() {
        let generator = Arc::new(ScriptedGenerator::failing(GeneratorError::Timeout {
            after: Duration::from_secs(120),
        }));
        let s = service(generator.clone(), PoolConfig::default());
        let u1 = RequesterId::new("u1");

        let submission = s
            .dispatcher
            .submit(&u1, GenerationRequest::with_prompt("a slow cat"))
            .await
            .unwrap();
        let status = wait_for_terminal(&s, &u1, &submission.task_key).await;
        assert!(
            matches!(&status, TaskStatus::Failed { reason } if reason.contains("timed out")),
            "{status:?}"
        );
        assert_eq!(generator.calls(), 3);
        s.pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn generator_deadline_is_enforced() {
        let generator = Arc::new(
            ScriptedGenerator::succeeding(&["https://img/late.png"])
                .with_delay(Duration::from_secs(600)),
        );
        let config = PoolConfig {
            generator_timeout: Duration::from_secs(1),
            ..PoolConfig::default()
        };
        let s = service(generator.clone(), config);
        let u1 = RequesterId::new("u1");

        let submission = s
            .dispatcher
            .submit(&u1, GenerationRequest::with_prompt("a slow cat"))
            .await
            .unwrap();
        let status = wait_for_terminal(&s, &u1, &submission.task_key).await;
        assert_eq!(status.name(), "failed");
        assert_eq!(generator.calls(), 3);
        s.pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicates_invoke_generator_once() {
        let generator = Arc::new(
            ScriptedGenerator::succeeding(&["https://img/1.png"])
                .with_delay(Duration::from_secs(2)),
        );
        let s = service(generator.clone(), PoolConfig::default());
        let u1 = RequesterId::new("u1");

        let submissions = futures::future::join_all((0..16).map(|_| {
            s.dispatcher
                .submit(&u1, GenerationRequest::with_prompt("a red cat"))
        }))
        .await;
        let key = submissions[0].as_ref().unwrap().task_key.clone();
        assert!(
            submissions
                .iter()
                .all(|s| s.as_ref().is_ok_and(|s| s.task_key == key))
        );

        assert_eq!(wait_for_terminal(&s, &u1, &key).await.name(), "completed");
        assert_eq!(generator.calls(), 1);
        s.pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lease_starts_are_rate_limited() {
        let generator = Arc::new(ScriptedGenerator::succeeding(&["https://img/1.png"]));
        let config = PoolConfig {
            rate_max: 2,
            rate_window: Duration::from_secs(60),
            ..PoolConfig::default()
        };
        let s = service(generator.clone(), config);
        let u1 = RequesterId::new("u1");

        for i in 0..3 {
            s.dispatcher
                .submit(&u1, GenerationRequest::with_prompt(format!("cat {i}")))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(generator.calls(), 2);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(generator.calls(), 3);
        s.pool.shutdown().await;
    }
}
