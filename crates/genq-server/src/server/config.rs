use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::fmt;
use core::time::Duration;
use genq::{DEFAULT_MODEL, RequesterId};
use std::collections::HashMap;

/// Runtime configuration for the `genq-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults suitable for a single-node
/// deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "genq-server",
    version,
    about = "An HTTP service for asynchronous, deduplicated image generation"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:3000"))]
    pub server_addr: String,

    /// Number of workers, i.e. the cap on tasks processed simultaneously.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 5)]
    pub num_workers: usize,

    /// Maximum task starts per worker rate window, across all workers.
    ///
    /// Environment variable: `WORKER_RATE_MAX`
    #[arg(long, env = "WORKER_RATE_MAX", default_value_t = 10)]
    pub worker_rate_max: usize,

    /// Length of the worker rate window in milliseconds.
    ///
    /// Environment variable: `WORKER_RATE_WINDOW_MS`
    #[arg(long, env = "WORKER_RATE_WINDOW_MS", default_value_t = 60_000)]
    pub worker_rate_window_ms: u64,

    /// Attempts per task, including the first.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles with every further attempt.
    ///
    /// Environment variable: `BACKOFF_MS`
    #[arg(long, env = "BACKOFF_MS", default_value_t = 5_000)]
    pub backoff_ms: u64,

    /// Deadline for a single generator invocation.
    ///
    /// Environment variable: `GENERATOR_TIMEOUT_SECS`
    #[arg(long, env = "GENERATOR_TIMEOUT_SECS", default_value_t = 120)]
    pub generator_timeout_secs: u64,

    /// Lifetime of cached results and requester associations.
    ///
    /// Environment variable: `RESULT_TTL_SECS`
    #[arg(long, env = "RESULT_TTL_SECS", default_value_t = 3_600)]
    pub result_ttl_secs: u64,

    /// Failed tasks kept for status queries before the oldest are evicted.
    ///
    /// Environment variable: `KEEP_FAILED`
    #[arg(long, env = "KEEP_FAILED", default_value_t = 100)]
    pub keep_failed: usize,

    /// A task leased for longer than this is considered stalled and handed
    /// out again.
    ///
    /// Environment variable: `LEASE_TIMEOUT_SECS`
    #[arg(long, env = "LEASE_TIMEOUT_SECS", default_value_t = 300)]
    pub lease_timeout_secs: u64,

    /// How often idle workers poll for new tasks.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 250)]
    pub poll_interval_ms: u64,

    /// Image generator backend.
    ///
    /// Environment variable: `GENERATOR`
    #[arg(long, env = "GENERATOR", value_enum, default_value_t = GeneratorKind::Together)]
    pub generator: GeneratorKind,

    /// Base URL of the HTTP generator.
    ///
    /// Environment variable: `GENERATOR_URL`
    #[arg(long, env = "GENERATOR_URL", default_value_t = String::from("https://api.together.xyz"))]
    pub generator_url: String,

    /// API key for the HTTP generator.
    ///
    /// Environment variable: `GENERATOR_API_KEY`
    #[arg(long, env = "GENERATOR_API_KEY", hide_env_values = true)]
    pub generator_api_key: Option<String>,

    /// Model used when a request does not name one.
    ///
    /// Environment variable: `DEFAULT_MODEL`
    #[arg(long, env = "DEFAULT_MODEL", default_value_t = String::from(DEFAULT_MODEL))]
    pub default_model: String,

    /// Identity endpoint that resolves a bearer token to a user (`{"id": ...}`).
    ///
    /// Environment variable: `AUTH_URL`
    #[arg(long, env = "AUTH_URL")]
    pub auth_url: Option<String>,

    /// API key sent to the identity endpoint in the `apikey` header.
    ///
    /// Environment variable: `AUTH_API_KEY`
    #[arg(long, env = "AUTH_API_KEY", hide_env_values = true)]
    pub auth_api_key: Option<String>,

    /// Static `token:identity` pairs, comma separated. Used when `AUTH_URL`
    /// is not set.
    ///
    /// Environment variable: `API_TOKENS`
    #[arg(long, env = "API_TOKENS", hide_env_values = true)]
    pub api_tokens: Option<String>,

    /// Length of the HTTP rate windows in milliseconds.
    ///
    /// Environment variable: `RATE_LIMIT_WINDOW_MS`
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = 60_000)]
    pub rate_limit_window_ms: u64,

    /// Requests allowed per window and client IP. Each authenticated requester
    /// is allowed twice this.
    ///
    /// Environment variable: `RATE_LIMIT_MAX`
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 10)]
    pub rate_limit_max: u32,

    /// Generation submissions allowed per window and requester.
    ///
    /// Environment variable: `IMAGE_RATE_LIMIT_MAX`
    #[arg(long, env = "IMAGE_RATE_LIMIT_MAX", default_value_t = 5)]
    pub image_rate_limit_max: u32,

    /// How long shutdown waits for in-flight tasks.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GeneratorKind {
    /// Together images API over HTTP.
    Together,
    /// Placeholder URLs, no network access.
    Dryrun,
}

/// A configuration value that must not end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

#[derive(Clone, Debug)]
pub enum GeneratorConfig {
    Together { base_url: String, api_key: Secret },
    DryRun,
}

#[derive(Clone, Debug)]
pub enum IdentityConfig {
    Remote {
        url: String,
        api_key: Option<Secret>,
    },
    Static {
        tokens: HashMap<String, RequesterId>,
    },
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub worker_rate_max: usize,
    pub worker_rate_window: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub generator_timeout: Duration,
    pub result_ttl: Duration,
    pub keep_failed: usize,
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    pub generator: GeneratorConfig,
    pub default_model: String,
    pub identity: IdentityConfig,
    pub rate_limit_window: Duration,
    pub rate_limit_max: u32,
    pub image_rate_limit_max: u32,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.worker_rate_max == 0 || args.worker_rate_window_ms == 0 {
            bail!("WORKER_RATE_MAX and WORKER_RATE_WINDOW_MS must be greater than 0");
        }
        if args.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be greater than 0");
        }
        if args.generator_timeout_secs == 0 {
            bail!("GENERATOR_TIMEOUT_SECS must be greater than 0");
        }
        if args.result_ttl_secs == 0 {
            bail!("RESULT_TTL_SECS must be greater than 0");
        }
        if args.lease_timeout_secs <= args.generator_timeout_secs {
            bail!(
                "LEASE_TIMEOUT_SECS ({}) must exceed GENERATOR_TIMEOUT_SECS ({})",
                args.lease_timeout_secs,
                args.generator_timeout_secs
            );
        }
        if args.poll_interval_ms == 0 {
            bail!("POLL_INTERVAL_MS must be greater than 0");
        }
        if args.rate_limit_window_ms == 0 || args.rate_limit_max == 0 {
            bail!("RATE_LIMIT_WINDOW_MS and RATE_LIMIT_MAX must be greater than 0");
        }
        if args.image_rate_limit_max == 0 {
            bail!("IMAGE_RATE_LIMIT_MAX must be greater than 0");
        }
        if args.default_model.trim().is_empty() {
            bail!("DEFAULT_MODEL must not be empty");
        }

        let generator = match args.generator {
            GeneratorKind::Together => {
                let Some(api_key) = non_empty(args.generator_api_key) else {
                    bail!("GENERATOR_API_KEY is required for the together generator");
                };
                GeneratorConfig::Together {
                    base_url: args.generator_url,
                    api_key: Secret(api_key),
                }
            }
            GeneratorKind::Dryrun => GeneratorConfig::DryRun,
        };

        let identity = match (non_empty(args.auth_url), non_empty(args.api_tokens)) {
            (Some(url), _) => IdentityConfig::Remote {
                url,
                api_key: non_empty(args.auth_api_key).map(Secret),
            },
            (None, Some(raw)) => IdentityConfig::Static {
                tokens: parse_tokens(&raw).context("invalid API_TOKENS")?,
            },
            (None, None) => bail!("either AUTH_URL or API_TOKENS must be set"),
        };

        Ok(Self {
            server_addr: args.server_addr,
            num_workers: args.num_workers,
            worker_rate_max: args.worker_rate_max,
            worker_rate_window: Duration::from_millis(args.worker_rate_window_ms),
            max_attempts: args.max_attempts,
            backoff: Duration::from_millis(args.backoff_ms),
            generator_timeout: Duration::from_secs(args.generator_timeout_secs),
            result_ttl: Duration::from_secs(args.result_ttl_secs),
            keep_failed: args.keep_failed,
            lease_timeout: Duration::from_secs(args.lease_timeout_secs),
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            generator,
            default_model: args.default_model.trim().to_string(),
            identity,
            rate_limit_window: Duration::from_millis(args.rate_limit_window_ms),
            rate_limit_max: args.rate_limit_max,
            image_rate_limit_max: args.image_rate_limit_max,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses `token:identity[,token:identity...]`.
fn parse_tokens(raw: &str) -> anyhow::Result<HashMap<String, RequesterId>> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((token, identity)) = pair.split_once(':') else {
            bail!("expected `token:identity`, got an entry without `:`");
        };
        let (token, identity) = (token.trim(), identity.trim());
        if token.is_empty() || identity.is_empty() {
            bail!("token and identity must both be non-empty");
        }
        if tokens
            .insert(token.to_string(), RequesterId::new(identity))
            .is_some()
        {
            bail!("duplicate token for identity `{identity}`");
        }
    }
    if tokens.is_empty() {
        bail!("no tokens configured");
    }
    Ok(tokens)
}
