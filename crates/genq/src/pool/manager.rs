//! Worker pool lifecycle.
//!
//! [`WorkerPool::spawn`] starts `concurrency` workers that pull from the shared
//! broker. Shutdown is cooperative: cancelling the shared
//! [`CancellationToken`] stops idle workers immediately, while workers holding
//! a lease finish their task first. Tasks still running when the drain window
//! closes are aborted; their leases are reclaimed by the broker's lease timeout.

use super::PoolConfig;
use super::limiter::RateWindow;
use super::worker::{WorkerContext, worker_loop};
use crate::cache::ResultCache;
use crate::generator::ImageGenerator;
use crate::queue::JobQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// A set of workers processing tasks from one [`JobQueue`].
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    ctx: Arc<WorkerContext>,
    shutdown_token: CancellationToken,
    config: PoolConfig,
}

impl WorkerPool {
    /// Spawns the pool's workers on the current Tokio runtime.
    ///
    /// A `concurrency` of zero is treated as one.
    pub fn spawn(
        queue: Arc<dyn JobQueue>,
        cache: ResultCache,
        generator: Arc<dyn ImageGenerator>,
        config: PoolConfig,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            queue,
            cache,
            generator,
            limiter: RateWindow::new(config.rate_max, config.rate_window),
            generator_timeout: config.generator_timeout,
            poll_interval: config.poll_interval,
            in_flight: AtomicUsize::new(0),
        });
        let shutdown_token = CancellationToken::new();
        let concurrency = config.concurrency.max(1);

        let workers = (0..concurrency)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    ctx.clone(),
                    shutdown_token.child_token(),
                ))
            })
            .collect();

        tracing::info!(
            concurrency,
            generator = ctx.generator.name(),
            rate_max = config.rate_max,
            rate_window = ?config.rate_window,
            "Worker pool started"
        );

        Self {
            workers,
            ctx,
            shutdown_token,
            config,
        }
    }

    /// Tasks currently being processed.
    pub fn in_flight(&self) -> usize {
        self.ctx.in_flight.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Cancels the shared token so idle workers stop polling.
    /// - Waits up to `shutdown_timeout` for in-flight tasks to finish.
    /// - Aborts whatever is still running after that.
    pub async fn shutdown(self) {
        // === Phase 1: Stop leasing new work ===
        tracing::info!("Stopping workers ({} tasks in flight)", self.in_flight());
        self.shutdown_token.cancel();

        // === Phase 2: Drain in-flight tasks ===
        let aborts: Vec<_> = self.workers.iter().map(JoinHandle::abort_handle).collect();
        let drain = timeout(
            self.config.shutdown_timeout,
            futures::future::join_all(self.workers),
        )
        .await;

        match drain {
            Ok(results) => {
                for (worker_id, result) in results.into_iter().enumerate() {
                    if let Err(e) = result {
                        tracing::error!("Worker {worker_id} terminated abnormally: {e}");
                    }
                }
                tracing::debug!("All workers drained");
            }
            Err(_) => {
                // === Phase 3: Abort stragglers ===
                tracing::warn!(
                    "Graceful drain timed out ({} tasks still in flight)",
                    self.ctx.in_flight.load(Ordering::Acquire)
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        tracing::info!("Worker pool shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::queue::{JobOptions, MemoryQueue};
    use crate::store::MemoryStore;
    use crate::testing::ScriptedGenerator;
    use crate::types::{GenerationRequest, ParamDefaults, RequesterId, TaskKey};
    use core::time::Duration;

    fn pool(
        generator: ScriptedGenerator,
        shutdown_timeout: Duration,
    ) -> (WorkerPool, Arc<MemoryQueue>, ResultCache) {
        let queue = Arc::new(MemoryQueue::default());
        let cache = ResultCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600));
        let config = PoolConfig {
            concurrency: 2,
            shutdown_timeout,
            ..PoolConfig::default()
        };
        let pool = WorkerPool::spawn(
            queue.clone(),
            cache.clone(),
            Arc::new(generator),
            config,
        );
        (pool, queue, cache)
    }

    async fn enqueue(queue: &MemoryQueue) -> TaskKey {
        let params = GenerationRequest::with_prompt("a red cat")
            .normalize(&ParamDefaults::default())
            .unwrap();
        let key = fingerprint(&RequesterId::new("u1"), &params);
        queue
            .enqueue(&key, params, JobOptions::default())
            .await
            .unwrap();
        key
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_tasks() {
        let generator = ScriptedGenerator::succeeding(&["https://img/1.png"])
            .with_delay(Duration::from_secs(2));
        let (pool, queue, cache) = pool(generator, Duration::from_secs(5));
        let key = enqueue(&queue).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pool.in_flight(), 1);

        pool.shutdown().await;
        assert!(cache.exists(&key).await.unwrap());
        assert_eq!(queue.get_state(&key).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_timeout() {
        let generator = ScriptedGenerator::succeeding(&["https://img/1.png"])
            .with_delay(Duration::from_secs(60));
        let (pool, queue, cache) = pool(generator, Duration::from_secs(1));
        let key = enqueue(&queue).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!pool.is_shutting_down());
        pool.shutdown().await;

        assert!(!cache.exists(&key).await.unwrap());
        assert_eq!(queue.counts().active, 1);
    }
}
