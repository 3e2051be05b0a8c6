use super::limiter::RateWindow;
use crate::cache::ResultCache;
use crate::error::{GeneratorError, QueueError, StoreError};
use crate::generator::{ImageGenerator, normalize_urls};
use crate::queue::{FailOutcome, JobFailure, JobQueue, Lease};
use crate::types::CachedResult;
use chrono::Utc;
use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Everything a worker needs, shared by all workers of a pool.
pub(crate) struct WorkerContext {
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) cache: ResultCache,
    pub(crate) generator: Arc<dyn ImageGenerator>,
    pub(crate) limiter: RateWindow,
    pub(crate) generator_timeout: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) in_flight: AtomicUsize,
}

/// How one leased task ended, from the worker's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Generated, cached and acknowledged.
    Completed,
    /// A result was already cached; acknowledged without generating.
    AlreadyCached,
    /// Failed; the broker scheduled another attempt.
    Retrying { delay: Duration },
    /// Failed terminally.
    Failed,
    /// The lease was lost or the broker could not be reached to report back;
    /// the broker's lease timeout takes over.
    Abandoned,
}

/// Why an attempt did not produce a cached result.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AttemptError {
    fn into_failure(self) -> JobFailure {
        match self {
            Self::Generator(err) if err.is_retryable() => JobFailure::retryable(err.to_string()),
            Self::Generator(err) => JobFailure::permanent(err.to_string()),
            Self::Store(err) => JobFailure::retryable(err.to_string()),
        }
    }
}

/// Worker task: leases and processes tasks until `shutdown` is cancelled.
///
/// Cancellation is observed only between tasks. A task that has been leased
/// runs to completion; the pool decides how long to wait for it.
pub(crate) async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
) {
    tracing::trace!("Worker {worker_id} started");

    while !shutdown.is_cancelled() {
        let slot = match ctx.limiter.try_acquire() {
            Ok(slot) => slot,
            Err(wait) => {
                tracing::trace!("Worker {worker_id} rate limited for {wait:?}");
                if idle(&shutdown, wait).await {
                    break;
                }
                continue;
            }
        };

        let lease = match ctx.queue.lease().await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                ctx.limiter.release(slot);
                if idle(&shutdown, ctx.poll_interval).await {
                    break;
                }
                continue;
            }
            Err(err) => {
                ctx.limiter.release(slot);
                tracing::warn!("Worker {worker_id} failed to lease: {err}");
                if idle(&shutdown, ctx.poll_interval).await {
                    break;
                }
                continue;
            }
        };

        ctx.in_flight.fetch_add(1, Ordering::AcqRel);
        let outcome = process_job(&ctx, &lease).await;
        ctx.in_flight.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(
            task_key = %lease.key,
            attempt = lease.attempt,
            ?outcome,
            "Worker {worker_id} finished task"
        );
    }

    tracing::trace!("Worker {worker_id} stopped");
}

/// Sleeps for `wait` unless shutdown comes first. Returns whether shutdown
/// was requested.
async fn idle(shutdown: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(wait) => false,
    }
}

/// Runs one leased task and reports the result to the broker.
///
/// The result is written to the cache before the lease is acknowledged, so a
/// crash between the two leaves a cached result and a lease that the broker
/// will eventually hand out again (and that will short-circuit on the cache).
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(task_key = %lease.key, attempt = lease.attempt)
)]
pub(crate) async fn process_job(ctx: &WorkerContext, lease: &Lease) -> JobOutcome {
    match attempt(ctx, lease).await {
        Ok(cached) => match ctx.queue.ack(lease).await {
            Ok(()) if cached => JobOutcome::AlreadyCached,
            Ok(()) => JobOutcome::Completed,
            Err(err) => abandon(err),
        },
        Err(err) => {
            let failure = err.into_failure();
            let reason = failure.reason.clone();
            match ctx.queue.fail(lease, failure).await {
                Ok(FailOutcome::Retrying {
                    next_attempt,
                    delay,
                }) => {
                    tracing::warn!(next_attempt, ?delay, "attempt failed, retrying: {reason}");
                    JobOutcome::Retrying { delay }
                }
                Ok(FailOutcome::Failed) => {
                    tracing::error!("task failed: {reason}");
                    JobOutcome::Failed
                }
                Err(err) => abandon(err),
            }
        }
    }
}

fn abandon(err: QueueError) -> JobOutcome {
    tracing::warn!("could not report back to the broker: {err}");
    JobOutcome::Abandoned
}

/// Returns `Ok(true)` if the result was already cached.
async fn attempt(ctx: &WorkerContext, lease: &Lease) -> Result<bool, AttemptError> {
    if ctx.cache.exists(&lease.key).await? {
        tracing::info!("result already cached, skipping generation");
        report(ctx, lease, 100).await;
        return Ok(true);
    }

    report(ctx, lease, 10).await;
    report(ctx, lease, 30).await;

    let generated = tokio::time::timeout(
        ctx.generator_timeout,
        ctx.generator.generate(&lease.params),
    )
    .await
    .map_err(|_| GeneratorError::Timeout {
        after: ctx.generator_timeout,
    })??;

    report(ctx, lease, 70).await;
    let urls = normalize_urls(generated)?;

    report(ctx, lease, 90).await;
    let result = CachedResult {
        task_key: lease.key.clone(),
        urls,
        params: lease.params.clone(),
        completed_at: Utc::now(),
    };
    if !ctx.cache.set_if_absent(&result).await? {
        tracing::debug!("another worker cached this result first");
    }
    tracing::info!(
        generator = ctx.generator.name(),
        images = result.urls.len(),
        "generated"
    );

    report(ctx, lease, 100).await;
    Ok(false)
}

/// Progress is advisory; failures to record it are logged and ignored.
async fn report(ctx: &WorkerContext, lease: &Lease, progress: u8) {
    if let Err(err) = ctx.queue.progress(lease, progress).await {
        tracing::debug!(progress, "progress not recorded: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::queue::{
        Backoff, EnqueueOutcome, JobOptions, JobSnapshot, JobState, MemoryQueue,
    };
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use crate::testing::ScriptedGenerator;
    use crate::types::{GenerationParams, GenerationRequest, ParamDefaults, RequesterId, TaskKey};

    struct Harness {
        ctx: WorkerContext,
        queue: Arc<MemoryQueue>,
        generator: Arc<ScriptedGenerator>,
    }

    fn harness(generator: ScriptedGenerator) -> Harness {
        let queue = Arc::new(MemoryQueue::default());
        let generator = Arc::new(generator);
        let ctx = WorkerContext {
            queue: queue.clone(),
            cache: ResultCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600)),
            generator: generator.clone(),
            limiter: RateWindow::new(10, Duration::from_secs(60)),
            generator_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(250),
            in_flight: AtomicUsize::new(0),
        };
        Harness {
            ctx,
            queue,
            generator,
        }
    }

    fn params() -> GenerationParams {
        GenerationRequest::with_prompt("a red cat")
            .normalize(&ParamDefaults::default())
            .unwrap()
    }

    async fn enqueue(h: &Harness, max_attempts: u32) -> (TaskKey, Lease) {
        let key = fingerprint(&RequesterId::new("u1"), &params());
        let options = JobOptions {
            max_attempts,
            backoff: Backoff::exponential(Duration::from_secs(5)),
            remove_on_complete: true,
        };
        h.queue.enqueue(&key, params(), options).await.unwrap();
        let lease = h.queue.lease().await.unwrap().unwrap();
        (key, lease)
    }

    #[tokio::test]
    async fn success_caches_then_acknowledges() {
        let h = harness(ScriptedGenerator::succeeding(&["https://img/1.png"]));
        let (key, lease) = enqueue(&h, 3).await;

        assert_eq!(process_job(&h.ctx, &lease).await, JobOutcome::Completed);
        let cached = h.ctx.cache.get(&key).await.unwrap().unwrap();
        assert_eq!(cached.urls, ["https://img/1.png"]);
        assert_eq!(cached.params, params());
        assert_eq!(h.queue.get_state(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cached_result_short_circuits_generation() {
        let h = harness(ScriptedGenerator::succeeding(&["https://img/new.png"]));
        let (key, lease) = enqueue(&h, 3).await;
        h.ctx
            .cache
            .set(&CachedResult {
                task_key: key.clone(),
                urls: vec!["https://img/old.png".into()],
                params: params(),
                completed_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(process_job(&h.ctx, &lease).await, JobOutcome::AlreadyCached);
        assert_eq!(h.generator.calls(), 0);
        let cached = h.ctx.cache.get(&key).await.unwrap().unwrap();
        assert_eq!(cached.urls, ["https://img/old.png"]);
    }

    #[tokio::test]
    async fn empty_response_fails_without_retry() {
        let h = harness(ScriptedGenerator::succeeding(&[]));
        let (key, lease) = enqueue(&h, 3).await;

        assert_eq!(process_job(&h.ctx, &lease).await, JobOutcome::Failed);
        let snapshot = h.queue.get_state(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Failed);
        assert_eq!(snapshot.attempts_made, 1);
        assert_eq!(
            snapshot.failed_reason.as_deref(),
            Some("generator returned no image URLs")
        );
    }

    #[tokio::test]
    async fn unavailable_generator_is_retried() {
        let h = harness(ScriptedGenerator::failing(GeneratorError::Unavailable {
            reason: "connection reset".into(),
        }));
        let (key, lease) = enqueue(&h, 3).await;

        assert_eq!(
            process_job(&h.ctx, &lease).await,
            JobOutcome::Retrying {
                delay: Duration::from_secs(5)
            }
        );
        assert!(!h.ctx.cache.exists(&key).await.unwrap());
        let snapshot = h.queue.get_state(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Delayed);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let h = harness(
            ScriptedGenerator::succeeding(&["https://img/1.png"]).after(Err(
                GeneratorError::Unavailable {
                    reason: "503".into(),
                },
            )),
        );
        let (key, lease) = enqueue(&h, 1).await;
        assert_eq!(process_job(&h.ctx, &lease).await, JobOutcome::Failed);

        // A fresh submission gets a new budget and succeeds.
        h.queue
            .enqueue(&key, params(), JobOptions::default())
            .await
            .unwrap();
        let lease = h.queue.lease().await.unwrap().unwrap();
        assert_eq!(process_job(&h.ctx, &lease).await, JobOutcome::Completed);
        assert_eq!(h.generator.calls(), 2);
    }

    #[tokio::test]
    async fn lost_lease_is_abandoned() {
        let h = harness(ScriptedGenerator::succeeding(&["https://img/1.png"]));
        let (key, lease) = enqueue(&h, 3).await;
        h.queue.ack(&lease).await.unwrap();

        assert_eq!(process_job(&h.ctx, &lease).await, JobOutcome::Abandoned);
        // The result was still cached before the ack was attempted.
        assert!(h.ctx.cache.exists(&key).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_loop_stops_on_shutdown() {
        let h = harness(ScriptedGenerator::succeeding(&["https://img/1.png"]));
        let ctx = Arc::new(h.ctx);
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker_loop(0, ctx.clone(), token.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.limiter.in_window(), 0);
    }

    /// Broker that records every progress report before delegating.
    #[derive(Default)]
    struct RecordingQueue {
        inner: MemoryQueue,
        reports: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(
            &self,
            key: &TaskKey,
            params: GenerationParams,
            options: JobOptions,
        ) -> Result<EnqueueOutcome, QueueError> {
            self.inner.enqueue(key, params, options).await
        }

        async fn get_state(&self, key: &TaskKey) -> Result<Option<JobSnapshot>, QueueError> {
            self.inner.get_state(key).await
        }

        async fn lease(&self) -> Result<Option<Lease>, QueueError> {
            self.inner.lease().await
        }

        async fn progress(&self, lease: &Lease, progress: u8) -> Result<(), QueueError> {
            self.reports.lock().push(progress);
            self.inner.progress(lease, progress).await
        }

        async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
            self.inner.ack(lease).await
        }

        async fn fail(
            &self,
            lease: &Lease,
            failure: JobFailure,
        ) -> Result<FailOutcome, QueueError> {
            self.inner.fail(lease, failure).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_progress_checkpoints() {
        let queue = Arc::new(RecordingQueue::default());
        let generator = ScriptedGenerator::succeeding(&["https://img/1.png"])
            .with_delay(Duration::from_secs(10));
        let ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            cache: ResultCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600)),
            generator: Arc::new(generator),
            limiter: RateWindow::new(10, Duration::from_secs(60)),
            generator_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(250),
            in_flight: AtomicUsize::new(0),
        });

        let key = fingerprint(&RequesterId::new("u1"), &params());
        let options = JobOptions {
            remove_on_complete: false,
            ..JobOptions::default()
        };
        queue.enqueue(&key, params(), options).await.unwrap();
        let lease = queue.lease().await.unwrap().unwrap();

        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { process_job(&ctx, &lease).await }
        });

        // The generator is still running.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = queue.get_state(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Active);
        assert_eq!(snapshot.progress, 30);

        assert_eq!(task.await.unwrap(), JobOutcome::Completed);
        assert_eq!(*queue.reports.lock(), [10, 30, 70, 90, 100]);
        let snapshot = queue.get_state(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Completed);
        assert_eq!(snapshot.progress, 100);
    }
}
