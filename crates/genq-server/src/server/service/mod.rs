//! HTTP service: routes, shared state and error responses.
//!
//! ## Structure
//!
//! - [`handler`] - Router and request handlers.
//! - [`state`] - Component wiring ([`state::Service`], [`state::AppState`]).
//! - [`error`] - Error-to-response mapping ([`error::ApiError`]).

pub mod error;
pub mod handler;
pub mod state;
