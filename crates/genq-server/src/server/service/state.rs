//! Service wiring.
//!
//! [`Service::build`] assembles the store, broker, cache, association index,
//! generator and worker pool from a [`ServerConfig`], and hands out the
//! [`AppState`] shared by every handler.

use crate::server::auth::{IdentityVerifier, RemoteVerifier, StaticTokenVerifier};
use crate::server::config::{GeneratorConfig, IdentityConfig, ServerConfig};
use crate::server::limiter::RequestLimiter;
use core::time::Duration;
use genq::generator::{DryRunGenerator, TogetherConfig, TogetherGenerator};
use genq::queue::{Backoff, JobOptions, MemoryQueueConfig};
use genq::{
    Dispatcher, ImageGenerator, JobQueue, KeyValueStore, MemoryQueue, MemoryStore, ParamDefaults,
    PoolConfig, ResultCache, StatusResolver, TaskAssociations, WorkerPool,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);
const DRYRUN_BASE_URL: &str = "https://dryrun.genq.invalid/images";

/// State shared by all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub resolver: StatusResolver,
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Keyed by client IP; applies to every route before authentication.
    pub ip_limiter: Arc<RequestLimiter>,
    /// Keyed by requester; applies to every authenticated route.
    pub user_limiter: Arc<RequestLimiter>,
    /// Applies to generation submissions only.
    pub image_limiter: Arc<RequestLimiter>,
    /// Cancelled once shutdown starts; submissions are refused from then on.
    pub draining: CancellationToken,
}

impl AppState {
    pub fn new(
        dispatcher: Dispatcher,
        resolver: StatusResolver,
        verifier: Arc<dyn IdentityVerifier>,
        ip_limiter: RequestLimiter,
        user_limiter: RequestLimiter,
        image_limiter: RequestLimiter,
    ) -> Self {
        Self {
            dispatcher,
            resolver,
            verifier,
            ip_limiter: Arc::new(ip_limiter),
            user_limiter: Arc::new(user_limiter),
            image_limiter: Arc::new(image_limiter),
            draining: CancellationToken::new(),
        }
    }
}

/// The running service: handler state plus the background tasks behind it.
pub struct Service {
    state: AppState,
    pool: WorkerPool,
    janitor: JoinHandle<()>,
}

impl Service {
    /// Builds every component and starts the worker pool and the janitor.
    /// Must be called from within a Tokio runtime.
    pub fn build(config: &ServerConfig) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(MemoryQueueConfig {
            lease_timeout: config.lease_timeout,
            keep_failed: config.keep_failed,
        }));
        let shared_store: Arc<dyn KeyValueStore> = store.clone();
        let shared_queue: Arc<dyn JobQueue> = queue.clone();

        let cache = ResultCache::new(shared_store.clone(), config.result_ttl);
        let associations = TaskAssociations::new(shared_store, config.result_ttl);

        let dispatcher = Dispatcher::new(
            shared_queue.clone(),
            cache.clone(),
            associations.clone(),
            ParamDefaults {
                model: config.default_model.clone(),
                ..ParamDefaults::default()
            },
            JobOptions {
                max_attempts: config.max_attempts,
                backoff: Backoff::exponential(config.backoff),
                remove_on_complete: true,
            },
        );
        let resolver = StatusResolver::new(shared_queue.clone(), cache.clone(), associations);

        let pool = WorkerPool::spawn(
            shared_queue,
            cache,
            build_generator(&config.generator)?,
            PoolConfig {
                concurrency: config.num_workers,
                rate_max: config.worker_rate_max,
                rate_window: config.worker_rate_window,
                generator_timeout: config.generator_timeout,
                poll_interval: config.poll_interval,
                shutdown_timeout: config.shutdown_timeout,
            },
        );

        let state = AppState::new(
            dispatcher,
            resolver,
            build_verifier(&config.identity)?,
            RequestLimiter::new(config.rate_limit_max, config.rate_limit_window),
            RequestLimiter::new(
                config.rate_limit_max.saturating_mul(2),
                config.rate_limit_window,
            ),
            RequestLimiter::new(config.image_rate_limit_max, config.rate_limit_window),
        );

        let janitor = tokio::spawn(janitor(
            store,
            queue,
            state.clone(),
            state.draining.child_token(),
        ));

        Ok(Self {
            state,
            pool,
            janitor,
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Refuses new submissions, then drains the worker pool.
    pub async fn shutdown(self) {
        self.state.draining.cancel();
        self.pool.shutdown().await;
        if let Err(e) = self.janitor.await {
            tracing::error!("Janitor terminated abnormally: {e}");
        }
    }
}

fn build_generator(config: &GeneratorConfig) -> anyhow::Result<Arc<dyn ImageGenerator>> {
    Ok(match config {
        GeneratorConfig::Together { base_url, api_key } => {
            Arc::new(TogetherGenerator::new(TogetherConfig {
                base_url: base_url.clone(),
                api_key: api_key.expose().to_string(),
                connect_timeout: CONNECT_TIMEOUT,
            })?)
        }
        GeneratorConfig::DryRun => Arc::new(DryRunGenerator::new(DRYRUN_BASE_URL, Duration::ZERO)),
    })
}

fn build_verifier(config: &IdentityConfig) -> anyhow::Result<Arc<dyn IdentityVerifier>> {
    Ok(match config {
        IdentityConfig::Remote { url, api_key } => Arc::new(RemoteVerifier::new(
            url.clone(),
            api_key.as_ref().map(|k| k.expose().to_string()),
            IDENTITY_TIMEOUT,
        )?),
        IdentityConfig::Static { tokens } => Arc::new(StaticTokenVerifier::new(tokens.clone())),
    })
}

/// Periodically drops expired store entries and limiter windows.
async fn janitor(
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    state: AppState,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(JANITOR_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let entries = store.purge_expired();
        let windows = state.ip_limiter.purge_expired()
            + state.user_limiter.purge_expired()
            + state.image_limiter.purge_expired();
        let counts = queue.counts();
        tracing::debug!(
            entries,
            windows,
            waiting = counts.waiting,
            delayed = counts.delayed,
            active = counts.active,
            failed = counts.failed,
            "Purged expired entries"
        );
    }
}
