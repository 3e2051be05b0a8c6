//! In-process job broker.
//!
//! [`MemoryQueue`] keeps every task record in one locked map keyed by task
//! key. Leasing scans for the oldest ready record; that is linear in the
//! number of records, which is fine for the bounded populations a single
//! process holds. All transitions happen under the lock, so exactly one
//! caller can move a record from ready to active.

use super::{
    EnqueueOutcome, FailOutcome, JobFailure, JobOptions, JobQueue, JobSnapshot, JobState, Lease,
};
use crate::error::QueueError;
use crate::types::{GenerationParams, TaskKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryQueueConfig {
    /// An active lease older than this is considered stalled and reclaimed.
    pub lease_timeout: Duration,
    /// Failed records retained for inspection; the oldest are evicted.
    pub keep_failed: usize,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(300),
            keep_failed: 100,
        }
    }
}

/// Per-state record totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct JobRecord {
    params: GenerationParams,
    options: JobOptions,
    state: JobState,
    progress: u8,
    attempts_made: u32,
    failed_reason: Option<String>,
    created_at: DateTime<Utc>,
    /// Enqueue order.
    seq: u64,
    ready_at: Instant,
    lease: Option<ActiveLease>,
}

#[derive(Clone, Copy, Debug)]
struct ActiveLease {
    token: u64,
    leased_at: Instant,
}

impl JobRecord {
    fn snapshot(&self, key: &TaskKey) -> JobSnapshot {
        JobSnapshot {
            key: key.clone(),
            state: self.state,
            progress: self.progress,
            attempts_made: self.attempts_made,
            failed_reason: self.failed_reason.clone(),
            created_at: self.created_at,
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.ready_at <= now
    }

    fn holds(&self, lease: &Lease) -> bool {
        self.state == JobState::Active && self.lease.is_some_and(|l| l.token == lease.token)
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<TaskKey, JobRecord>,
    /// Keys of the records currently in [`JobState::Failed`], oldest failure
    /// first. Kept in step with `jobs`: an entry leaves when its record is
    /// evicted or replaced.
    failed: VecDeque<TaskKey>,
    next_seq: u64,
    next_token: u64,
}

impl Inner {
    fn mark_failed(&mut self, key: &TaskKey, keep_failed: usize) {
        self.failed.push_back(key.clone());
        while self.failed.len() > keep_failed {
            let Some(old_key) = self.failed.pop_front() else {
                break;
            };
            self.jobs.remove(&old_key);
        }
    }

    /// Drops `key` from the failed index ahead of replacing its record.
    fn forget_failed(&mut self, key: &TaskKey) {
        if let Some(pos) = self.failed.iter().position(|k| k == key) {
            self.failed.remove(pos);
        }
    }

    /// Returns stalled active records to the ready set, or fails them once
    /// their attempts are used up.
    fn reclaim_stalled(&mut self, now: Instant, lease_timeout: Duration, keep_failed: usize) {
        let stalled: Vec<TaskKey> = self
            .jobs
            .iter()
            .filter(|(_, r)| {
                r.state == JobState::Active
                    && r.lease.is_some_and(|l| l.leased_at + lease_timeout <= now)
            })
            .map(|(k, _)| k.clone())
            .collect();

        for key in stalled {
            let Some(record) = self.jobs.get_mut(&key) else {
                continue;
            };
            record.lease = None;
            record.attempts_made += 1;
            record.failed_reason = Some("lease expired before completion".to_string());
            if record.attempts_made >= record.options.max_attempts {
                tracing::warn!(task_key = %key, "stalled task exhausted its attempts");
                record.state = JobState::Failed;
                self.mark_failed(&key, keep_failed);
            } else {
                tracing::warn!(task_key = %key, "reclaiming stalled lease");
                record.state = JobState::Waiting;
                record.progress = 0;
                record.ready_at = now;
            }
        }
    }
}

/// In-memory [`JobQueue`].
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    config: MemoryQueueConfig,
}

impl MemoryQueue {
    pub fn new(config: MemoryQueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    pub fn counts(&self) -> QueueCounts {
        let inner = self.inner.lock();
        let mut counts = QueueCounts::default();
        for record in inner.jobs.values() {
            match record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    fn lease_lost(lease: &Lease) -> QueueError {
        QueueError::LeaseLost {
            key: lease.key.to_string(),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        key: &TaskKey,
        params: GenerationParams,
        options: JobOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut inner = self.inner.lock();
        match inner.jobs.get(key).map(|r| r.state) {
            Some(state) if state.is_live() => return Ok(EnqueueOutcome::Duplicate(state)),
            Some(JobState::Failed) => inner.forget_failed(key),
            _ => {}
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            key.clone(),
            JobRecord {
                params,
                options,
                state: JobState::Waiting,
                progress: 0,
                attempts_made: 0,
                failed_reason: None,
                created_at: Utc::now(),
                seq,
                ready_at: Instant::now(),
                lease: None,
            },
        );
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn get_state(&self, key: &TaskKey) -> Result<Option<JobSnapshot>, QueueError> {
        Ok(self.inner.lock().jobs.get(key).map(|r| r.snapshot(key)))
    }

    async fn lease(&self) -> Result<Option<Lease>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.reclaim_stalled(now, self.config.lease_timeout, self.config.keep_failed);

        let Some(key) = inner
            .jobs
            .iter()
            .filter(|(_, r)| r.is_ready(now))
            .min_by_key(|(_, r)| r.seq)
            .map(|(k, _)| k.clone())
        else {
            return Ok(None);
        };

        let token = inner.next_token;
        inner.next_token += 1;

        let record = inner
            .jobs
            .get_mut(&key)
            .ok_or_else(|| QueueError::Unavailable(format!("record {key} vanished")))?;
        record.state = JobState::Active;
        record.progress = 0;
        record.lease = Some(ActiveLease {
            token,
            leased_at: now,
        });

        Ok(Some(Lease {
            key,
            params: record.params.clone(),
            attempt: record.attempts_made + 1,
            max_attempts: record.options.max_attempts,
            created_at: record.created_at,
            token,
        }))
    }

    async fn progress(&self, lease: &Lease, progress: u8) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&lease.key) {
            Some(record) if record.holds(lease) => {
                record.progress = progress.min(100);
                Ok(())
            }
            _ => Err(Self::lease_lost(lease)),
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let remove = match inner.jobs.get_mut(&lease.key) {
            Some(record) if record.holds(lease) => {
                record.state = JobState::Completed;
                record.progress = 100;
                record.lease = None;
                record.options.remove_on_complete
            }
            _ => return Err(Self::lease_lost(lease)),
        };
        if remove {
            inner.jobs.remove(&lease.key);
        }
        Ok(())
    }

    async fn fail(&self, lease: &Lease, failure: JobFailure) -> Result<FailOutcome, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let record = match inner.jobs.get_mut(&lease.key) {
            Some(record) if record.holds(lease) => record,
            _ => return Err(Self::lease_lost(lease)),
        };

        record.lease = None;
        record.attempts_made = lease.attempt;
        record.failed_reason = Some(failure.reason);

        if failure.retryable && record.attempts_made < record.options.max_attempts {
            let delay = record.options.backoff.delay_after(record.attempts_made);
            record.state = JobState::Delayed;
            record.progress = 0;
            record.ready_at = now + delay;
            return Ok(FailOutcome::Retrying {
                next_attempt: record.attempts_made + 1,
                delay,
            });
        }

        record.state = JobState::Failed;
        inner.mark_failed(&lease.key, self.config.keep_failed);
        Ok(FailOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Backoff;
    use crate::types::{GenerationRequest, ParamDefaults};

    fn key(n: u8) -> TaskKey {
        TaskKey::parse(&format!("{n:02x}").repeat(32)).unwrap()
    }

    fn params() -> GenerationParams {
        GenerationRequest::with_prompt("a red cat")
            .normalize(&ParamDefaults::default())
            .unwrap()
    }

    fn options(max_attempts: u32) -> JobOptions {
        JobOptions {
            max_attempts,
            backoff: Backoff::exponential(Duration::from_secs(5)),
            remove_on_complete: true,
        }
    }

    async fn state(queue: &MemoryQueue, key: &TaskKey) -> Option<JobState> {
        queue.get_state(key).await.unwrap().map(|s| s.state)
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected_while_live() {
        let queue = MemoryQueue::default();
        let k = key(1);
        assert_eq!(
            queue.enqueue(&k, params(), options(3)).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue(&k, params(), options(3)).await.unwrap(),
            EnqueueOutcome::Duplicate(JobState::Waiting)
        );

        let _lease = queue.lease().await.unwrap().unwrap();
        assert_eq!(
            queue.enqueue(&k, params(), options(3)).await.unwrap(),
            EnqueueOutcome::Duplicate(JobState::Active)
        );
        assert_eq!(queue.counts().active, 1);
    }

    #[tokio::test]
    async fn leases_in_enqueue_order_and_exclusively() {
        let queue = MemoryQueue::default();
        for n in 1..=3 {
            queue.enqueue(&key(n), params(), options(3)).await.unwrap();
        }

        let first = queue.lease().await.unwrap().unwrap();
        let second = queue.lease().await.unwrap().unwrap();
        let third = queue.lease().await.unwrap().unwrap();
        assert_eq!(
            [first.key, second.key, third.key],
            [key(1), key(2), key(3)]
        );
        assert!(queue.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_removes_record_by_default() {
        let queue = MemoryQueue::default();
        queue.enqueue(&key(1), params(), options(3)).await.unwrap();
        let lease = queue.lease().await.unwrap().unwrap();
        queue.progress(&lease, 70).await.unwrap();
        assert_eq!(queue.get_state(&key(1)).await.unwrap().unwrap().progress, 70);

        queue.ack(&lease).await.unwrap();
        assert_eq!(state(&queue, &key(1)).await, None);
        assert_eq!(
            queue.ack(&lease).await.unwrap_err(),
            QueueError::LeaseLost {
                key: key(1).to_string()
            }
        );
    }

    #[tokio::test]
    async fn ack_can_retain_completed_records() {
        let queue = MemoryQueue::default();
        let opts = JobOptions {
            remove_on_complete: false,
            ..options(3)
        };
        queue.enqueue(&key(1), params(), opts).await.unwrap();
        let lease = queue.lease().await.unwrap().unwrap();
        queue.ack(&lease).await.unwrap();

        let snapshot = queue.get_state(&key(1)).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Completed);
        assert_eq!(snapshot.progress, 100);

        // A completed record does not block a fresh submission.
        assert_eq!(
            queue.enqueue(&key(1), params(), opts).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_back_off_exponentially() {
        let queue = MemoryQueue::default();
        queue.enqueue(&key(1), params(), options(3)).await.unwrap();

        let lease = queue.lease().await.unwrap().unwrap();
        assert_eq!(lease.attempt, 1);
        let outcome = queue
            .fail(&lease, JobFailure::retryable("timeout"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                next_attempt: 2,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(state(&queue, &key(1)).await, Some(JobState::Delayed));
        assert!(queue.lease().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let lease = queue.lease().await.unwrap().unwrap();
        assert_eq!(lease.attempt, 2);
        let outcome = queue
            .fail(&lease, JobFailure::retryable("timeout"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                next_attempt: 3,
                delay: Duration::from_secs(10)
            }
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        let lease = queue.lease().await.unwrap().unwrap();
        assert_eq!(lease.attempt, 3);
        let outcome = queue
            .fail(&lease, JobFailure::retryable("timeout again"))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let snapshot = queue.get_state(&key(1)).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Failed);
        assert_eq!(snapshot.attempts_made, 3);
        assert_eq!(snapshot.failed_reason.as_deref(), Some("timeout again"));
    }

    #[tokio::test]
    async fn permanent_failures_skip_retries() {
        let queue = MemoryQueue::default();
        queue.enqueue(&key(1), params(), options(3)).await.unwrap();
        let lease = queue.lease().await.unwrap().unwrap();
        let outcome = queue
            .fail(&lease, JobFailure::permanent("empty response"))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
        assert_eq!(state(&queue, &key(1)).await, Some(JobState::Failed));

        // A failed record is replaced by a new submission.
        assert_eq!(
            queue.enqueue(&key(1), params(), options(3)).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(state(&queue, &key(1)).await, Some(JobState::Waiting));
    }

    #[tokio::test]
    async fn failed_records_are_bounded() {
        let queue = MemoryQueue::new(MemoryQueueConfig {
            keep_failed: 2,
            ..MemoryQueueConfig::default()
        });
        for n in 1..=3 {
            queue.enqueue(&key(n), params(), options(1)).await.unwrap();
            let lease = queue.lease().await.unwrap().unwrap();
            queue
                .fail(&lease, JobFailure::permanent("boom"))
                .await
                .unwrap();
        }

        assert_eq!(queue.counts().failed, 2);
        assert_eq!(state(&queue, &key(1)).await, None);
        assert_eq!(state(&queue, &key(3)).await, Some(JobState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_leases_are_reclaimed() {
        let queue = MemoryQueue::new(MemoryQueueConfig {
            lease_timeout: Duration::from_secs(30),
            keep_failed: 10,
        });
        queue.enqueue(&key(1), params(), options(2)).await.unwrap();

        let stale = queue.lease().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        let fresh = queue.lease().await.unwrap().unwrap();
        assert_eq!(fresh.key, key(1));
        assert_eq!(fresh.attempt, 2);
        assert!(matches!(
            queue.ack(&stale).await,
            Err(QueueError::LeaseLost { .. })
        ));

        // Second stall exhausts the attempt budget.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(queue.lease().await.unwrap().is_none());
        let snapshot = queue.get_state(&key(1)).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Failed);
        assert!(queue.ack(&fresh).await.is_err());
    }

    #[tokio::test]
    async fn failed_index_tracks_replaced_records() {
        let queue = MemoryQueue::new(MemoryQueueConfig {
            keep_failed: 2,
            ..MemoryQueueConfig::default()
        });

        for _ in 0..500 {
            queue.enqueue(&key(1), params(), options(1)).await.unwrap();
            let lease = queue.lease().await.unwrap().unwrap();
            queue
                .fail(&lease, JobFailure::permanent("boom"))
                .await
                .unwrap();

            queue.enqueue(&key(1), params(), options(1)).await.unwrap();
            let lease = queue.lease().await.unwrap().unwrap();
            queue.ack(&lease).await.unwrap();
        }
        assert!(queue.inner.lock().failed.is_empty());
        assert_eq!(queue.counts(), QueueCounts::default());

        // A replaced failure no longer takes up one of the retained slots.
        for n in 2..=3 {
            queue.enqueue(&key(n), params(), options(1)).await.unwrap();
            let lease = queue.lease().await.unwrap().unwrap();
            queue
                .fail(&lease, JobFailure::permanent("boom"))
                .await
                .unwrap();
        }
        queue.enqueue(&key(2), params(), options(1)).await.unwrap();
        queue.enqueue(&key(4), params(), options(1)).await.unwrap();
        let lease = queue.lease().await.unwrap().unwrap();
        assert_eq!(lease.key, key(2));
        queue
            .fail(&lease, JobFailure::permanent("boom"))
            .await
            .unwrap();

        assert_eq!(queue.inner.lock().failed.len(), 2);
        assert_eq!(state(&queue, &key(3)).await, Some(JobState::Failed));
        assert_eq!(state(&queue, &key(2)).await, Some(JobState::Failed));
        assert_eq!(state(&queue, &key(4)).await, Some(JobState::Waiting));
    }
}
