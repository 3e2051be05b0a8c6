//! # `genq`: Idempotent Image-Generation Job Dispatch
//!
//! `genq` turns image-generation requests into asynchronously processed jobs.
//! A submission returns a task key immediately; clients poll for completion.
//!
//! The crate is built around three guarantees:
//!
//! - **Deterministic task keys**: a request's normalized parameters and its
//!   requester identity hash to a stable [`TaskKey`].
//! - **Best-effort idempotency**: the [`Dispatcher`] serves cached results
//!   and collapses duplicate in-flight submissions, and every worker
//!   re-checks the cache before calling the generator.
//! - **Bounded processing**: the [`WorkerPool`] caps simultaneous leases and
//!   lease starts per rolling window, and retries transient generator
//!   failures with exponential backoff up to a fixed attempt cap.
//!
//! ## Module Overview
//!
//! - [`fingerprint`] - Task key derivation.
//! - [`store`] - Key-value store abstraction and in-memory TTL store.
//! - [`cache`] / [`association`] - Typed views over the store for results and
//!   requester ownership.
//! - [`queue`] - Job queue abstraction and in-memory broker.
//! - [`dispatcher`] - Task-creation path.
//! - [`pool`] - Task-processing path.
//! - [`status`] - Task-query path.
//! - [`generator`] - External image generator contract and providers.
//!
//! All collaborators are passed in explicitly, so any of them can be swapped
//! for a durable backend or a test fake.

pub mod association;
pub mod cache;
pub mod dispatcher;
mod error;
pub mod fingerprint;
pub mod generator;
pub mod pool;
pub mod queue;
pub mod status;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
mod types;

pub use crate::association::TaskAssociations;
pub use crate::cache::ResultCache;
pub use crate::dispatcher::{Dispatcher, Submission};
pub use crate::error::*;
pub use crate::fingerprint::fingerprint;
pub use crate::generator::ImageGenerator;
pub use crate::pool::{PoolConfig, WorkerPool};
pub use crate::queue::{JobQueue, JobState, MemoryQueue};
pub use crate::status::{StatusResolver, TaskStatus};
pub use crate::store::{KeyValueStore, MemoryStore};
pub use crate::types::*;
