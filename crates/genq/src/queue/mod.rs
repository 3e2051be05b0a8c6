//! Job queue abstraction.
//!
//! The queue owns task records: their state, attempts and advisory progress.
//! Records are identified by their [`TaskKey`], which lets the dispatcher ask
//! "is this fingerprint already in flight?" with a single lookup.
//!
//! Lease exclusivity is the broker's job. A worker holds a [`Lease`] from
//! [`JobQueue::lease`] until it calls [`JobQueue::ack`] or
//! [`JobQueue::fail`]; a stale lease (reclaimed, or its record replaced) is
//! rejected with [`QueueError::LeaseLost`].
//!
//! ## Structure
//!
//! - [`memory`] - In-process broker ([`MemoryQueue`]).

mod memory;

pub use memory::{MemoryQueue, MemoryQueueConfig, QueueCounts};

use crate::error::QueueError;
use crate::types::{GenerationParams, TaskKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Broker-level state of a task record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be leased.
    Waiting,
    /// Waiting out a retry backoff.
    Delayed,
    /// Leased by a worker.
    Active,
    /// Acknowledged; only visible when completed records are retained.
    Completed,
    /// Attempts exhausted or failure was not retryable.
    Failed,
}

impl JobState {
    /// Whether a record in this state still represents in-flight work.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed | Self::Active)
    }
}

/// Exponential backoff: `seed`, `2 * seed`, `4 * seed`, ...
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub seed: Duration,
}

impl Backoff {
    pub const fn exponential(seed: Duration) -> Self {
        Self { seed }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.seed.saturating_mul(1_u32 << exponent)
    }
}

/// Per-job retry and retention policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobOptions {
    /// Upper bound on attempts, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Drop the record on acknowledgement instead of keeping it as
    /// [`JobState::Completed`].
    pub remove_on_complete: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(5)),
            remove_on_complete: true,
        }
    }
}

/// Point-in-time view of a task record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSnapshot {
    pub key: TaskKey,
    pub state: JobState,
    /// Advisory progress, 0-100.
    pub progress: u8,
    /// Attempts that have ended (failed or been reclaimed).
    pub attempts_made: u32,
    /// Reason of the most recent failure, if any.
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Exclusive right to process one task record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub key: TaskKey,
    pub params: GenerationParams,
    /// 1-based number of the attempt this lease represents.
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub(crate) token: u64,
}

/// Why an attempt failed and whether it may be retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFailure {
    pub reason: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new record was created.
    Enqueued,
    /// A live record for the same key already exists.
    Duplicate(JobState),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOutcome {
    /// The record was delayed and will be leased again after `delay`.
    Retrying { next_attempt: u32, delay: Duration },
    /// The record is terminally failed.
    Failed,
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Adds a record for `key` unless a live one exists. A terminal record
    /// for the same key is replaced.
    async fn enqueue(
        &self,
        key: &TaskKey,
        params: GenerationParams,
        options: JobOptions,
    ) -> Result<EnqueueOutcome, QueueError>;

    async fn get_state(&self, key: &TaskKey) -> Result<Option<JobSnapshot>, QueueError>;

    /// Leases the oldest ready record, if any.
    async fn lease(&self) -> Result<Option<Lease>, QueueError>;

    /// Records advisory progress for a held lease.
    async fn progress(&self, lease: &Lease, progress: u8) -> Result<(), QueueError>;

    /// Acknowledges successful completion of a held lease.
    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Reports a failed attempt; the broker decides between retry and
    /// terminal failure.
    async fn fail(&self, lease: &Lease, failure: JobFailure) -> Result<FailOutcome, QueueError>;
}
