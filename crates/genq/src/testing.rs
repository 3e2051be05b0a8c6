//! In-memory fakes for exercising the dispatch path without real backends.
//!
//! Available to this crate's tests and, through the `test-util` feature, to
//! downstream crates.

use crate::error::{GeneratorError, QueueError, StoreError};
use crate::generator::ImageGenerator;
use crate::queue::{
    EnqueueOutcome, FailOutcome, JobFailure, JobOptions, JobQueue, JobSnapshot, Lease,
};
use crate::store::KeyValueStore;
use crate::types::{GenerationParams, TaskKey};
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

type Outcome = Result<Vec<String>, GeneratorError>;

/// Generator that replays scripted outcomes, then repeats a fallback.
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    /// Always returns `urls`.
    pub fn succeeding(urls: &[&str]) -> Self {
        Self::with_fallback(Ok(urls.iter().map(|u| (*u).to_string()).collect()))
    }

    /// Always fails with `err`.
    pub fn failing(err: GeneratorError) -> Self {
        Self::with_fallback(Err(err))
    }

    fn with_fallback(fallback: Outcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Queues `outcome` ahead of the fallback; queued outcomes are returned in
    /// the order they were added.
    #[must_use]
    pub fn after(self, outcome: Outcome) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    /// Sleeps for `delay` (on the Tokio clock) before every answer.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of invocations so far, including ones still sleeping.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _params: &GenerationParams) -> Result<Vec<String>, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

const UNREACHABLE: &str = "connection refused";

/// Broker whose every operation fails as unreachable.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableQueue;

#[async_trait]
impl JobQueue for UnavailableQueue {
    async fn enqueue(
        &self,
        _key: &TaskKey,
        _params: GenerationParams,
        _options: JobOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        Err(QueueError::Unavailable(UNREACHABLE.into()))
    }

    async fn get_state(&self, _key: &TaskKey) -> Result<Option<JobSnapshot>, QueueError> {
        Err(QueueError::Unavailable(UNREACHABLE.into()))
    }

    async fn lease(&self) -> Result<Option<Lease>, QueueError> {
        Err(QueueError::Unavailable(UNREACHABLE.into()))
    }

    async fn progress(&self, _lease: &Lease, _progress: u8) -> Result<(), QueueError> {
        Err(QueueError::Unavailable(UNREACHABLE.into()))
    }

    async fn ack(&self, _lease: &Lease) -> Result<(), QueueError> {
        Err(QueueError::Unavailable(UNREACHABLE.into()))
    }

    async fn fail(&self, _lease: &Lease, _failure: JobFailure) -> Result<FailOutcome, QueueError> {
        Err(QueueError::Unavailable(UNREACHABLE.into()))
    }
}

/// Key-value store whose every operation fails as unreachable.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableStore;

#[async_trait]
impl KeyValueStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable(UNREACHABLE.into()))
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(UNREACHABLE.into()))
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: String,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable(UNREACHABLE.into()))
    }

    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable(UNREACHABLE.into()))
    }
}
