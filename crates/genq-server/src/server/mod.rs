//! Server internals for `genq-server`.
//!
//! ## Structure
//!
//! - [`config`] - CLI and environment configuration.
//! - [`telemetry`] - Logging, tracing and metrics setup.
//! - [`auth`] - Bearer-token identity verification.
//! - [`limiter`] - Per-requester request limits.
//! - [`service`] - HTTP routes and component wiring.

pub mod auth;
pub mod config;
pub mod limiter;
pub mod service;
pub mod telemetry;
